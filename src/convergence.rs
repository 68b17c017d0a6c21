// ABOUTME: Bounded polling for asynchronous replication effects
// ABOUTME: Distinguishes "not yet" from failure and retries query errors until the budget runs out

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SubscriptionError};
use crate::postgres::Gateway;
use crate::replication::reader;
use crate::replication::sql::quote_ident;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    /// Doubles the interval after every miss up to `max_interval`, with +/-20% jitter.
    Exponential { max_interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub backoff: Backoff,
}

impl PollPolicy {
    pub fn fixed(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            backoff: Backoff::Fixed,
        }
    }

    /// Delay before the poll following the `miss`-th consecutive miss (0-based).
    pub fn delay_after(&self, miss: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.poll_interval,
            Backoff::Exponential { max_interval } => {
                let base = self
                    .poll_interval
                    .saturating_mul(1u32 << miss.min(16))
                    .min(max_interval);
                let jitter = rand::thread_rng().gen_range(0.8..=1.2);
                base.mul_f64(jitter).min(max_interval)
            }
        }
    }
}

/// Outcome of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converged {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Poll `probe` until it reports `true`.
///
/// The first poll happens immediately. Probe errors are remembered and retried; they never
/// end the wait early. A single probe is cut off once it outlives both the remaining budget
/// and one poll interval, so the call returns no later than `timeout + poll_interval`.
/// Dropping the returned future cancels the wait; no transaction is held between polls.
pub async fn wait_until<F, Fut, E>(policy: &PollPolicy, mut probe: F) -> Result<Converged>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<bool, E>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let budget = deadline
            .saturating_duration_since(Instant::now())
            .max(policy.poll_interval);

        let last_error = match tokio::time::timeout(budget, probe()).await {
            Ok(Ok(true)) => {
                let elapsed = started.elapsed();
                debug!(attempts, ?elapsed, "Convergence observed");
                return Ok(Converged { attempts, elapsed });
            }
            Ok(Ok(false)) => {
                debug!(attempts, "Not converged yet");
                None
            }
            Ok(Err(err)) => {
                debug!(attempts, error = %err, "Poll failed, will retry");
                Some(err.to_string())
            }
            Err(_) => {
                debug!(attempts, "Poll exceeded its time budget");
                Some(format!("poll did not complete within {:?}", budget))
            }
        };

        let now = Instant::now();
        if now >= deadline {
            let waited = started.elapsed();
            warn!(attempts, ?waited, "Gave up waiting for convergence");
            return Err(SubscriptionError::ConvergenceTimeout {
                waited,
                attempts,
                last_error,
            });
        }

        let delay = policy.delay_after(attempts - 1).min(deadline - now);
        tokio::time::sleep(delay).await;
    }
}

/// Probe: does the subscription's enabled flag currently equal `expected`?
/// An absent subscription is "not yet", not an error.
pub async fn enabled_flag_is(
    gateway: &Gateway,
    database: &str,
    name: &str,
    expected: bool,
) -> Result<bool> {
    let session = gateway.session(database).await?;
    let state = reader::read_state(session.client(), name).await?;
    Ok(state.exists && state.enabled == expected)
}

/// Count rows in `schema.table`, optionally restricted to `column = value`.
pub async fn count_rows(
    gateway: &Gateway,
    database: &str,
    schema: &str,
    table: &str,
    filter: Option<(&str, &str)>,
) -> Result<i64> {
    let session = gateway.session(database).await?;
    let target = format!("{}.{}", quote_ident(schema), quote_ident(table));
    let row = match filter {
        Some((column, value)) => {
            let query = format!(
                "SELECT count(*) FROM {} WHERE {}::text = $1",
                target,
                quote_ident(column)
            );
            session.client().query_one(query.as_str(), &[&value]).await
        }
        None => {
            let query = format!("SELECT count(*) FROM {}", target);
            session.client().query_one(query.as_str(), &[]).await
        }
    }
    .map_err(|e| SubscriptionError::from_db(&e))?;
    Ok(row.get(0))
}

/// Probe: does `count_rows` equal `expected`?
pub async fn row_count_is(
    gateway: &Gateway,
    database: &str,
    schema: &str,
    table: &str,
    filter: Option<(&str, &str)>,
    expected: i64,
) -> Result<bool> {
    Ok(count_rows(gateway, database, schema, table, filter).await? == expected)
}
