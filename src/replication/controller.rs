// ABOUTME: Subscription lifecycle controller: create, enable/disable, update, drop
// ABOUTME: Reads catalog state before every change and applies start positions only on the enable edge

use tokio_postgres::error::SqlState;
use tracing::{debug, info, warn};

use crate::error::{Result, SubscriptionError};
use crate::lsn::Lsn;
use crate::postgres::{Gateway, Session};
use crate::replication::origin;
use crate::replication::reader;
use crate::replication::spec::{
    matches_existing, plan_transition, SpecDiff, SubscriptionSpec, SubscriptionState, Transition,
};
use crate::replication::sql;

/// Drives subscriptions toward a requested state.
///
/// Holds no subscription state between calls; every operation opens its own session and
/// reads the catalog first.
#[derive(Debug, Clone)]
pub struct SubscriptionController {
    gateway: Gateway,
}

/// An ALTER that fails because the subscription is gone means it vanished after we read it.
fn vanished(err: SubscriptionError, name: &str) -> SubscriptionError {
    if err.has_sqlstate(&SqlState::UNDEFINED_OBJECT) {
        SubscriptionError::StateConflict(format!(
            "subscription '{}' disappeared while it was being changed",
            name
        ))
    } else {
        err
    }
}

fn is_missing_slot(err: &SubscriptionError) -> bool {
    err.server_message().is_some_and(|message| {
        message.contains("replication slot") && message.contains("does not exist")
    })
}

/// CREATE SUBSCRIPTION refuses to run in a transaction block when it creates a remote slot.
fn creates_remote_slot(spec: &SubscriptionSpec) -> bool {
    spec.connect && spec.create_slot
}

impl SubscriptionController {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Current catalog state of `name` in `database`.
    pub async fn read(&self, database: &str, name: &str) -> Result<SubscriptionState> {
        let session = self.gateway.session(database).await?;
        reader::read_state(session.client(), name).await
    }

    /// Create a subscription. A start position is never accepted here.
    ///
    /// Creating a subscription that already exists with the same publications, connection,
    /// slot and enabled flag succeeds without changes.
    pub async fn create(&self, spec: &SubscriptionSpec) -> Result<()> {
        spec.validate_for_create()?;

        let mut session = self.gateway.session(&spec.database).await?;
        info!(
            subscription = %spec.name,
            database = %spec.database,
            enabled = spec.enabled,
            create_slot = spec.create_slot,
            "Creating subscription"
        );

        let outcome = Self::create_in_session(&mut session, spec).await;
        match outcome {
            Err(err) if err.has_sqlstate(&SqlState::DUPLICATE_OBJECT) => {
                let existing = reader::read_state(session.client(), &spec.name).await?;
                if matches_existing(spec, &existing) {
                    info!(subscription = %spec.name, "Subscription already exists with the requested spec");
                    Ok(())
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    async fn create_in_session(session: &mut Session, spec: &SubscriptionSpec) -> Result<()> {
        let statement = sql::create_subscription(spec);

        if creates_remote_slot(spec) {
            session.execute(&statement).await?;
            let state = reader::read_state(session.client(), &spec.name).await?;
            if !state.exists {
                return Err(SubscriptionError::StateConflict(format!(
                    "subscription '{}' was dropped right after creation",
                    spec.name
                )));
            }
            info!(subscription = %spec.name, oid = ?state.oid, "Subscription created");
            return Ok(());
        }

        let tx = session.transaction().await?;
        tx.batch_execute(&statement)
            .await
            .map_err(|e| SubscriptionError::from_db(&e))?;
        let state = reader::read_state(&tx, &spec.name).await?;
        if !state.exists {
            return Err(SubscriptionError::StateConflict(format!(
                "subscription '{}' not visible after creation",
                spec.name
            )));
        }
        tx.commit()
            .await
            .map_err(|e| SubscriptionError::from_db(&e))?;
        info!(subscription = %spec.name, oid = ?state.oid, "Subscription created");
        Ok(())
    }

    /// Enable or disable a subscription.
    ///
    /// `start_lsn` is honoured only when a disabled subscription is being enabled; the
    /// origin is advanced to it in the same transaction as the ENABLE. Any other use is an
    /// `InvalidTransition` and nothing is changed.
    pub async fn set_enabled(
        &self,
        name: &str,
        database: &str,
        enabled: bool,
        start_lsn: Option<Lsn>,
    ) -> Result<()> {
        let mut session = self.gateway.session(database).await?;
        let current = reader::read_state(session.client(), name).await?;
        let transition = plan_transition(&current, enabled, start_lsn)?;

        match transition {
            Transition::Unchanged => {
                debug!(subscription = %name, enabled, "Enabled flag already as requested");
                Ok(())
            }
            Transition::Disable => {
                session
                    .execute(&sql::disable_subscription(name))
                    .await
                    .map_err(|e| vanished(e, name))?;
                info!(subscription = %name, "Subscription disabled");
                Ok(())
            }
            Transition::Enable { start_lsn: None } => {
                session
                    .execute(&sql::enable_subscription(name))
                    .await
                    .map_err(|e| vanished(e, name))?;
                info!(subscription = %name, "Subscription enabled");
                Ok(())
            }
            Transition::Enable {
                start_lsn: Some(lsn),
            } => Self::enable_from(&mut session, &current, lsn).await,
        }
    }

    async fn enable_from(session: &mut Session, current: &SubscriptionState, lsn: Lsn) -> Result<()> {
        let name = current.name.as_str();
        let tx = session.transaction().await?;

        // The read above happened outside this transaction.
        let fresh = reader::read_state(&tx, name).await?;
        if !fresh.exists || fresh.oid != current.oid || fresh.enabled {
            return Err(SubscriptionError::StateConflict(format!(
                "subscription '{}' changed before it could be enabled from {}",
                name, lsn
            )));
        }
        let Some(origin_name) = fresh.origin_name() else {
            return Err(SubscriptionError::StateConflict(format!(
                "subscription '{}' has no identifier",
                name
            )));
        };

        // The server creates the origin with the subscription and reserves the `pg_` prefix,
        // so a missing one cannot be recreated from here.
        if !origin::origin_exists(&tx, &origin_name).await? {
            return Err(SubscriptionError::Server {
                code: None,
                message: format!(
                    "replication origin \"{}\" of subscription '{}' does not exist; the server did not create it or it was dropped",
                    origin_name, name
                ),
            });
        }
        let progress = origin::origin_progress(&tx, &origin_name).await?;
        origin::check_start_position(&origin_name, lsn, progress)?;
        origin::advance_origin(&tx, &origin_name, lsn).await?;
        tx.batch_execute(&sql::enable_subscription(name))
            .await
            .map_err(|e| vanished(SubscriptionError::from_db(&e), name))?;
        tx.commit()
            .await
            .map_err(|e| SubscriptionError::from_db(&e))?;

        info!(
            subscription = %name,
            origin = %origin_name,
            start_lsn = %lsn,
            "Subscription enabled from start position"
        );
        Ok(())
    }

    /// Reconcile publications, connection string and slot name with `spec`.
    ///
    /// Only differing fields are altered. An enabled-flag difference is handed to
    /// [`set_enabled`](Self::set_enabled) after the other changes.
    pub async fn update(&self, spec: &SubscriptionSpec) -> Result<()> {
        spec.validate()?;

        let session = self.gateway.session(&spec.database).await?;
        let current = reader::read_state(session.client(), &spec.name).await?;
        if !current.exists {
            return Err(SubscriptionError::StateConflict(format!(
                "subscription '{}' does not exist in database '{}'",
                spec.name, spec.database
            )));
        }

        // Reject a misplaced start position before altering anything.
        let transition = plan_transition(&current, spec.enabled, spec.start_lsn)?;
        let diff = SpecDiff::compute(spec, &current);

        if let Some(conninfo) = &diff.conninfo {
            session
                .execute(&sql::set_connection(&spec.name, conninfo))
                .await
                .map_err(|e| vanished(e, &spec.name))?;
            info!(subscription = %spec.name, "Connection string updated");
        }
        if let Some(publications) = &diff.publications {
            session
                .execute(&sql::set_publications(
                    &spec.name,
                    publications,
                    current.enabled,
                ))
                .await
                .map_err(|e| vanished(e, &spec.name))?;
            info!(subscription = %spec.name, ?publications, "Publications updated");
        }
        if let Some(slot) = &diff.slot_name {
            session
                .execute(&sql::set_slot_name(&spec.name, Some(slot)))
                .await
                .map_err(|e| vanished(e, &spec.name))?;
            info!(subscription = %spec.name, slot = %slot, "Slot name updated");
        }
        if diff.is_empty() {
            debug!(subscription = %spec.name, "No attribute changes");
        }
        drop(session);

        if transition != Transition::Unchanged {
            self.set_enabled(&spec.name, &spec.database, spec.enabled, spec.start_lsn)
                .await?;
        }
        Ok(())
    }

    /// Drop a subscription.
    ///
    /// With `drop_slot = false` the slot is detached first so it survives on the publisher.
    /// With `drop_slot = true` a slot that is already gone is not an error. Afterwards any
    /// replication origin still named after the subscription is removed on a best-effort
    /// basis.
    pub async fn drop_subscription(&self, name: &str, database: &str, drop_slot: bool) -> Result<()> {
        let mut session = self.gateway.session(database).await?;
        let current = reader::read_state(session.client(), name).await?;
        let Some(oid) = current.oid else {
            info!(subscription = %name, database, "Subscription already absent");
            return Ok(());
        };

        if !drop_slot && current.slot_name.is_some() {
            Self::detach_slot(&mut session, name).await?;
        }

        info!(subscription = %name, database, drop_slot, "Dropping subscription");
        let dropped = session.execute(&sql::drop_subscription(name)).await;
        match dropped {
            Ok(()) => {}
            Err(err) if drop_slot && is_missing_slot(&err) => {
                warn!(subscription = %name, "Replication slot already gone on publisher: {}", err);
                Self::detach_slot(&mut session, name).await?;
                session.execute(&sql::drop_subscription(name)).await?;
            }
            Err(err) if err.has_sqlstate(&SqlState::UNDEFINED_OBJECT) => {
                info!(subscription = %name, "Subscription was dropped concurrently");
            }
            Err(err) => return Err(err),
        }

        match origin::cleanup_for_subscription(&session, oid).await {
            Ok(report) if !report.is_clean() => {
                warn!(
                    subscription = %name,
                    failures = report.failures.len(),
                    "Some replication origins could not be removed"
                );
            }
            Ok(report) => {
                debug!(subscription = %name, cleaned = report.cleaned_count(), "Origin cleanup done");
            }
            Err(e) => {
                warn!(subscription = %name, "Origin cleanup skipped: {}", e);
            }
        }
        Ok(())
    }

    /// Disable and detach the slot so DROP SUBSCRIPTION leaves the publisher alone.
    async fn detach_slot(session: &mut Session, name: &str) -> Result<()> {
        let tx = session.transaction().await?;
        tx.batch_execute(&sql::disable_subscription(name))
            .await
            .map_err(|e| vanished(SubscriptionError::from_db(&e), name))?;
        tx.batch_execute(&sql::set_slot_name(name, None))
            .await
            .map_err(|e| vanished(SubscriptionError::from_db(&e), name))?;
        tx.commit()
            .await
            .map_err(|e| SubscriptionError::from_db(&e))?;
        debug!(subscription = %name, "Slot detached");
        Ok(())
    }

    /// Bring a subscription to `spec`: create when absent, otherwise update and flip the
    /// enabled flag. A `StateConflict` is retried once from a fresh read.
    pub async fn apply(&self, spec: &SubscriptionSpec) -> Result<()> {
        match self.apply_once(spec).await {
            Err(err) if err.is_retryable() => {
                warn!(subscription = %spec.name, "Retrying after state conflict: {}", err);
                self.apply_once(spec).await
            }
            other => other,
        }
    }

    async fn apply_once(&self, spec: &SubscriptionSpec) -> Result<()> {
        let current = self.read(&spec.database, &spec.name).await?;
        if current.exists {
            self.update(spec).await
        } else {
            self.create(spec).await
        }
    }
}
