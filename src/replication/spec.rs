// ABOUTME: Desired and observed subscription models plus the enable/disable transition guard
// ABOUTME: Rejects contract violations before anything is sent to the server

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubscriptionError};
use crate::lsn::Lsn;

/// Prefix the server uses when naming a subscription's replication origin.
pub const ORIGIN_PREFIX: &str = "pg_";

/// Replication origin name for a subscription identifier.
pub fn origin_name(oid: u32) -> String {
    format!("{}{}", ORIGIN_PREFIX, oid)
}

/// Desired state of one subscription, supplied per operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionSpec {
    pub name: String,
    pub database: String,
    pub conninfo: String,
    pub publications: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub create_slot: bool,
    #[serde(default)]
    pub slot_name: Option<String>,
    #[serde(default = "default_true")]
    pub copy_data: bool,
    #[serde(default = "default_true")]
    pub connect: bool,
    #[serde(default)]
    pub start_lsn: Option<Lsn>,
}

fn default_true() -> bool {
    true
}

impl SubscriptionSpec {
    pub fn new<I, S>(name: &str, database: &str, conninfo: &str, publications: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            database: database.to_string(),
            conninfo: conninfo.to_string(),
            publications: publications.into_iter().map(Into::into).collect(),
            enabled: true,
            create_slot: true,
            slot_name: None,
            copy_data: true,
            connect: true,
            start_lsn: None,
        }
    }

    /// Checks that apply to any use of the spec, independent of server state.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SubscriptionError::InvalidSpec(
                "name must not be empty".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(SubscriptionError::InvalidSpec(
                "database must not be empty".to_string(),
            ));
        }
        if self.conninfo.trim().is_empty() {
            return Err(SubscriptionError::InvalidSpec(
                "conninfo must not be empty".to_string(),
            ));
        }
        if self.publications.is_empty() || self.publications.iter().any(|p| p.is_empty()) {
            return Err(SubscriptionError::InvalidSpec(
                "at least one non-empty publication is required".to_string(),
            ));
        }
        if !self.create_slot && self.slot_name.as_deref().map_or(true, str::is_empty) {
            return Err(SubscriptionError::InvalidSpec(
                "slot_name is required when create_slot = false".to_string(),
            ));
        }
        if !self.connect && (self.enabled || self.create_slot || self.copy_data) {
            return Err(SubscriptionError::InvalidSpec(
                "connect = false requires enabled, create_slot and copy_data to be false"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Validation for creation: everything in `validate`, plus no start position.
    pub fn validate_for_create(&self) -> Result<()> {
        if let Some(lsn) = self.start_lsn {
            return Err(SubscriptionError::InvalidSpec(format!(
                "start_lsn {} cannot be set at creation; create the subscription disabled and enable it with the start position",
                lsn
            )));
        }
        self.validate()
    }
}

/// Observed state of one subscription, read fresh from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SubscriptionState {
    pub name: String,
    pub exists: bool,
    pub enabled: bool,
    pub oid: Option<u32>,
    pub slot_name: Option<String>,
    pub conninfo: Option<String>,
    pub publications: BTreeSet<String>,
    /// Last remote position the origin has replayed, when the origin exists.
    pub origin_lsn: Option<Lsn>,
}

impl SubscriptionState {
    pub fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn origin_name(&self) -> Option<String> {
        self.oid.map(origin_name)
    }

    pub fn phase(&self) -> Phase {
        match (self.exists, self.enabled) {
            (false, _) => Phase::Absent,
            (true, false) => Phase::Disabled,
            (true, true) => Phase::Enabled,
        }
    }
}

/// Per-subscription lifecycle position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Absent,
    Disabled,
    Enabled,
}

/// What an enabled-flag request amounts to against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Disable,
    /// Disabled -> enabled. `start_lsn` is only ever carried on this edge.
    Enable { start_lsn: Option<Lsn> },
}

/// Decide the enabled-flag transition, enforcing that a start position is only
/// accepted on the disabled -> enabled edge of an existing subscription.
pub fn plan_transition(
    current: &SubscriptionState,
    enabled: bool,
    start_lsn: Option<Lsn>,
) -> Result<Transition> {
    if let Some(lsn) = start_lsn {
        let reason = match current.phase() {
            Phase::Absent => Some("the subscription does not exist"),
            Phase::Enabled => Some("the subscription is already enabled"),
            Phase::Disabled if !enabled => Some("the request does not enable the subscription"),
            Phase::Disabled => None,
        };
        if let Some(reason) = reason {
            return Err(SubscriptionError::InvalidTransition(format!(
                "start_lsn {} for subscription '{}' is only valid when enabling a disabled subscription: {}",
                lsn, current.name, reason
            )));
        }
    }

    match current.phase() {
        Phase::Absent => Err(SubscriptionError::StateConflict(format!(
            "subscription '{}' does not exist",
            current.name
        ))),
        Phase::Disabled if enabled => Ok(Transition::Enable { start_lsn }),
        Phase::Enabled if !enabled => Ok(Transition::Disable),
        _ => Ok(Transition::Unchanged),
    }
}

/// Non-enabled-flag differences between desired and observed state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecDiff {
    pub conninfo: Option<String>,
    pub publications: Option<BTreeSet<String>>,
    pub slot_name: Option<String>,
}

impl SpecDiff {
    pub fn compute(desired: &SubscriptionSpec, observed: &SubscriptionState) -> Self {
        let conninfo = (observed.conninfo.as_deref() != Some(desired.conninfo.as_str()))
            .then(|| desired.conninfo.clone());
        let publications = (observed.publications != desired.publications)
            .then(|| desired.publications.clone());
        let slot_name = match &desired.slot_name {
            Some(slot) if observed.slot_name.as_ref() != Some(slot) => Some(slot.clone()),
            _ => None,
        };
        Self {
            conninfo,
            publications,
            slot_name,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conninfo.is_none() && self.publications.is_none() && self.slot_name.is_none()
    }
}

/// True when an existing subscription already matches what `spec` would create.
pub fn matches_existing(spec: &SubscriptionSpec, observed: &SubscriptionState) -> bool {
    observed.exists
        && observed.enabled == spec.enabled
        && SpecDiff::compute(spec, observed).is_empty()
}
