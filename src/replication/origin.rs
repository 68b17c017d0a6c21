// ABOUTME: Replication origin verification, positioning and orphan cleanup
// ABOUTME: Cleanup is best-effort: each origin drop succeeds or fails on its own

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_postgres::GenericClient;
use tracing::{debug, info, warn};

use crate::error::{Result, SubscriptionError};
use crate::lsn::Lsn;
use crate::postgres::{Gateway, Session};
use crate::replication::reader;
use crate::replication::spec::ORIGIN_PREFIX;
use crate::replication::sql;

/// Subscription identifier that owns an origin name.
///
/// Accepts the apply-worker form `pg_<oid>` and the table-sync form `pg_<oid>_<relid>`.
pub fn origin_owner(origin: &str) -> Option<u32> {
    let rest = origin.strip_prefix(ORIGIN_PREFIX)?;
    let mut parts = rest.splitn(2, '_');
    let oid = parts.next()?;
    if oid.is_empty() || !oid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(relid) = parts.next() {
        if relid.is_empty() || !relid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
    }
    oid.parse().ok()
}

/// Origins whose owning subscription identifier is not in `live`.
pub fn find_orphans<'a, I>(origins: I, live: &HashSet<u32>) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    origins
        .into_iter()
        .filter(|origin| origin_owner(origin).is_some_and(|oid| !live.contains(&oid)))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginFailure {
    pub origin: String,
    pub error: String,
}

/// Outcome of a cleanup pass. Failures never hide the origins that were removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cleaned: Vec<String>,
    pub failures: Vec<OriginFailure>,
}

impl SweepReport {
    pub fn cleaned_count(&self) -> usize {
        self.cleaned.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(mut self, origin: String, outcome: Result<()>) -> Self {
        match outcome {
            Ok(()) => {
                info!(origin = %origin, "Dropped orphaned replication origin");
                self.cleaned.push(origin);
            }
            Err(e) => {
                warn!(origin = %origin, "Could not drop orphaned replication origin: {}", e);
                self.failures.push(OriginFailure {
                    origin,
                    error: e.to_string(),
                });
            }
        }
        self
    }
}

pub async fn origin_exists<C>(client: &C, origin: &str) -> Result<bool>
where
    C: GenericClient + Sync,
{
    let row = client
        .query_one(sql::SELECT_ORIGIN_EXISTS, &[&origin])
        .await
        .map_err(|e| SubscriptionError::from_db(&e))?;
    Ok(row.get(0))
}

/// Replay position the server has recorded for `origin`, flushed. `None` when the origin
/// has no progress record.
pub async fn origin_progress<C>(client: &C, origin: &str) -> Result<Option<Lsn>>
where
    C: GenericClient + Sync,
{
    let row = client
        .query_one(sql::ORIGIN_PROGRESS, &[&origin])
        .await
        .map_err(|e| SubscriptionError::from_db(&e))?;
    let progress: Option<String> = row.get(0);
    progress
        .map(|text| {
            text.parse::<Lsn>().map_err(|e| {
                SubscriptionError::StateRead(format!("progress of origin '{}': {}", origin, e))
            })
        })
        .transpose()
}

/// A start position may not precede what the origin has already replayed.
pub fn check_start_position(origin: &str, start: Lsn, progress: Option<Lsn>) -> Result<()> {
    match progress {
        Some(replayed) if start < replayed => Err(SubscriptionError::Server {
            code: None,
            message: format!(
                "start position {} is behind replay position {} of replication origin \"{}\"",
                start, replayed, origin
            ),
        }),
        _ => Ok(()),
    }
}

/// Move `origin` to `lsn`.
///
/// The server function moves backwards as readily as forwards; callers check the position
/// with [`check_start_position`] first.
pub async fn advance_origin<C>(client: &C, origin: &str, lsn: Lsn) -> Result<()>
where
    C: GenericClient + Sync,
{
    let position = lsn.to_string();
    client
        .query_one(sql::ADVANCE_ORIGIN, &[&origin, &position])
        .await
        .map_err(|e| SubscriptionError::from_db(&e))?;
    Ok(())
}

async fn drop_origin(client: &tokio_postgres::Client, origin: &str) -> Result<()> {
    client
        .query_one(sql::DROP_ORIGIN, &[&origin])
        .await
        .map_err(|e| SubscriptionError::from_db(&e))?;
    Ok(())
}

async fn list_subscription_origins(client: &tokio_postgres::Client) -> Result<Vec<String>> {
    let rows = client
        .query(sql::SELECT_SUBSCRIPTION_ORIGINS, &[])
        .await
        .map_err(|e| SubscriptionError::from_db(&e))?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

async fn live_subscription_oids(client: &tokio_postgres::Client) -> Result<HashSet<u32>> {
    let rows = client
        .query(sql::SELECT_SUBSCRIPTION_OIDS, &[])
        .await
        .map_err(|e| SubscriptionError::from_db(&e))?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Drop every origin in `targets`, one at a time, folding each outcome into the report.
async fn drop_all(session: &Session, targets: Vec<String>) -> SweepReport {
    stream::iter(targets)
        .fold(SweepReport::default(), |report, origin| async move {
            let outcome = drop_origin(session.client(), &origin).await;
            report.record(origin, outcome)
        })
        .await
}

/// Remove the origins left behind by a dropped subscription with identifier `oid`.
pub async fn cleanup_for_subscription(session: &Session, oid: u32) -> Result<SweepReport> {
    let origins = list_subscription_origins(session.client()).await?;
    let targets: Vec<String> = origins
        .into_iter()
        .filter(|origin| origin_owner(origin) == Some(oid))
        .collect();
    if targets.is_empty() {
        debug!(oid, "No replication origins left for dropped subscription");
    }
    Ok(drop_all(session, targets).await)
}

#[derive(Debug, Clone)]
pub struct OriginReconciler {
    gateway: Gateway,
}

impl OriginReconciler {
    pub fn new(gateway: Gateway) -> Self {
        Self { gateway }
    }

    /// Whether the origin derived from `name`'s identifier exists.
    ///
    /// A missing subscription has no identifier and therefore no origin: that is `false`,
    /// not an error.
    pub async fn verify_origin_exists(&self, database: &str, name: &str) -> Result<bool> {
        let session = self.gateway.session(database).await?;
        let state = reader::read_state(session.client(), name).await?;
        let Some(origin) = state.origin_name() else {
            debug!(subscription = %name, database, "No subscription, so no origin");
            return Ok(false);
        };
        let exists = origin_exists(session.client(), &origin).await?;
        debug!(subscription = %name, origin = %origin, exists, "Checked replication origin");
        Ok(exists)
    }

    /// Drop every subscription-style origin with no matching subscription in the cluster.
    ///
    /// `admin_database` is any database on the cluster; both catalogs involved are shared.
    pub async fn sweep_orphans(&self, admin_database: &str) -> Result<SweepReport> {
        let session = self.gateway.session(admin_database).await?;
        let origins = list_subscription_origins(session.client()).await?;
        let live = live_subscription_oids(session.client()).await?;
        let orphans = find_orphans(&origins, &live);

        info!(
            origins = origins.len(),
            orphans = orphans.len(),
            "Sweeping orphaned replication origins"
        );
        Ok(drop_all(&session, orphans).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_owner_parses_both_forms() {
        assert_eq!(origin_owner("pg_16390"), Some(16390));
        assert_eq!(origin_owner("pg_16390_24576"), Some(16390));
    }

    #[test]
    fn test_origin_owner_rejects_foreign_names() {
        for name in ["pg_", "pg_abc", "pg_12_", "pg_12_x", "bdr_12", "pg_12_34_56", "16390"] {
            assert_eq!(origin_owner(name), None, "{}", name);
        }
    }

    #[test]
    fn test_find_orphans_keeps_live_subscriptions() {
        let origins: Vec<String> = ["pg_100", "pg_100_5000", "pg_200", "pg_300_7", "custom"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let live: HashSet<u32> = [100].into_iter().collect();

        assert_eq!(
            find_orphans(&origins, &live),
            vec!["pg_200".to_string(), "pg_300_7".to_string()]
        );
    }

    #[test]
    fn test_find_orphans_after_cleanup_is_empty() {
        let live: HashSet<u32> = [100].into_iter().collect();
        let remaining = vec!["pg_100".to_string()];
        assert!(find_orphans(&remaining, &live).is_empty());
    }

    #[test]
    fn test_start_position_behind_progress_is_refused() {
        let replayed = Lsn::new(0, 0x5FC2590);
        let err = check_start_position("pg_16654", Lsn::new(0, 0x5FC2410), Some(replayed))
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Server { .. }), "{err}");
        assert!(!err.is_retryable());
        let message = err.to_string();
        assert!(message.contains("0/5FC2590"), "{}", message);
        assert!(message.contains("pg_16654"), "{}", message);
    }

    #[test]
    fn test_start_position_at_or_after_progress_is_accepted() {
        let replayed = Lsn::new(0, 0x5FC2590);
        assert!(check_start_position("pg_1", replayed, Some(replayed)).is_ok());
        assert!(check_start_position("pg_1", Lsn::new(1, 0), Some(replayed)).is_ok());
        assert!(check_start_position("pg_1", Lsn::new(0, 0x10), None).is_ok());
    }

    #[test]
    fn test_report_keeps_partial_success() {
        let report = SweepReport::default()
            .record("pg_1".to_string(), Ok(()))
            .record(
                "pg_2".to_string(),
                Err(SubscriptionError::Server {
                    code: Some("55006".to_string()),
                    message: "replication origin with ID 2 is already active".to_string(),
                }),
            )
            .record("pg_3".to_string(), Ok(()));

        assert_eq!(report.cleaned, vec!["pg_1".to_string(), "pg_3".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].origin, "pg_2");
        assert!(!report.is_clean());
        assert_eq!(report.cleaned_count(), 2);
    }
}
