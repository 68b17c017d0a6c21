// ABOUTME: Replication subscription lifecycle module
// ABOUTME: Handles subscription state, lifecycle statements and replication origin bookkeeping

pub mod controller;
pub mod origin;
pub mod reader;
pub mod spec;
pub mod sql;

pub use controller::SubscriptionController;
pub use origin::{OriginFailure, OriginReconciler, SweepReport};
pub use reader::read_state;
pub use spec::{
    origin_name, plan_transition, Phase, SubscriptionSpec, SubscriptionState, Transition,
};
