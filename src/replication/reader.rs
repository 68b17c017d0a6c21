// ABOUTME: Catalog reader producing a subscription state snapshot
// ABOUTME: A missing row is an absent subscription, never an error

use tokio_postgres::GenericClient;
use tracing::{debug, warn};

use crate::error::{Result, SubscriptionError};
use crate::lsn::Lsn;
use crate::replication::spec::SubscriptionState;
use crate::replication::sql;

/// Read the state of `name` in the database the client is connected to.
///
/// Works on a plain client or inside a transaction.
pub async fn read_state<C>(client: &C, name: &str) -> Result<SubscriptionState>
where
    C: GenericClient + Sync,
{
    let row = client
        .query_opt(sql::SELECT_STATE, &[&name])
        .await
        .map_err(|e| SubscriptionError::StateRead(e.to_string()))?;

    let Some(row) = row else {
        debug!(subscription = %name, "Subscription not found");
        return Ok(SubscriptionState::absent(name));
    };

    let oid: u32 = row.get(0);
    let enabled: bool = row.get(1);
    let slot_name: Option<String> = row.get(2);
    let conninfo: Option<String> = row.get(3);
    let publications: Vec<String> = row.get(4);
    let remote_lsn: Option<String> = row.get(5);

    let origin_lsn = remote_lsn.and_then(|text| match text.parse::<Lsn>() {
        Ok(lsn) => Some(lsn),
        Err(e) => {
            warn!(subscription = %name, "Ignoring unparseable origin progress: {}", e);
            None
        }
    });

    Ok(SubscriptionState {
        name: name.to_string(),
        exists: true,
        enabled,
        oid: Some(oid),
        slot_name,
        conninfo,
        publications: publications.into_iter().collect(),
        origin_lsn,
    })
}
