// ABOUTME: Library root for PostgreSQL logical replication subscription lifecycle management
// ABOUTME: Exposes the controller, origin reconciler, convergence verifier and supporting types

pub mod config;
pub mod convergence;
pub mod error;
pub mod lsn;
pub mod postgres;
pub mod replication;

pub use config::Config;
pub use convergence::{wait_until, Backoff, Converged, PollPolicy};
pub use error::{Result, SubscriptionError};
pub use lsn::Lsn;
pub use postgres::Gateway;
pub use replication::{
    OriginReconciler, SubscriptionController, SubscriptionSpec, SubscriptionState, SweepReport,
};
