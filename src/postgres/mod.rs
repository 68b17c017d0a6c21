// ABOUTME: PostgreSQL connection utilities module
// ABOUTME: Hands out one session per operation against a named database

pub mod connection;

pub use connection::{redact_url, Gateway, Session};
