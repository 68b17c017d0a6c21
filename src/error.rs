// ABOUTME: Error taxonomy for subscription lifecycle operations
// ABOUTME: Separates caller contract violations from server refusals, conflicts and timeouts

use std::fmt;
use std::time::Duration;

use tokio_postgres::error::SqlState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// Caller-side contract violation in a subscription spec. Raised before any server call.
    InvalidSpec(String),
    /// Start LSN requested on an edge other than disabled -> enabled. Raised before any server call.
    InvalidTransition(String),
    /// The server refused a statement. `message` is the server's text, unmodified.
    Server {
        code: Option<String>,
        message: String,
    },
    /// Server state changed between the read and the write. Safe to retry the whole operation once.
    StateConflict(String),
    /// An asynchronous effect was not observed within the polling budget.
    ConvergenceTimeout {
        waited: Duration,
        attempts: u32,
        last_error: Option<String>,
    },
    /// The catalog lookup for a subscription failed.
    StateRead(String),
    /// The session could not be opened or was lost mid-statement.
    Connection(String),
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;

impl SubscriptionError {
    /// Classify a driver error. Errors carrying a server response keep their SQLSTATE
    /// and message verbatim; everything else is treated as a connectivity failure.
    pub fn from_db(err: &tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => SubscriptionError::Server {
                code: Some(db.code().code().to_string()),
                message: db.message().to_string(),
            },
            None => SubscriptionError::Connection(err.to_string()),
        }
    }

    /// Only `StateConflict` is retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubscriptionError::StateConflict(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SubscriptionError::ConvergenceTimeout { .. })
    }

    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            SubscriptionError::Server { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn has_sqlstate(&self, state: &SqlState) -> bool {
        self.sqlstate() == Some(state.code())
    }

    pub(crate) fn server_message(&self) -> Option<&str> {
        match self {
            SubscriptionError::Server { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubscriptionError::InvalidSpec(msg) => write!(f, "Invalid subscription spec: {}", msg),
            SubscriptionError::InvalidTransition(msg) => {
                write!(f, "Invalid subscription transition: {}", msg)
            }
            SubscriptionError::Server {
                code: Some(code),
                message,
            } => write!(f, "Server error [{}]: {}", code, message),
            SubscriptionError::Server { code: None, message } => {
                write!(f, "Server error: {}", message)
            }
            SubscriptionError::StateConflict(msg) => write!(f, "State conflict: {}", msg),
            SubscriptionError::ConvergenceTimeout {
                waited,
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "Convergence timeout after {:?} ({} attempts)",
                    waited, attempts
                )?;
                if let Some(err) = last_error {
                    write!(f, "; last poll error: {}", err)?;
                }
                Ok(())
            }
            SubscriptionError::StateRead(msg) => {
                write!(f, "Failed to read subscription state: {}", msg)
            }
            SubscriptionError::Connection(msg) => write!(f, "Connection error: {}", msg),
        }
    }
}

impl std::error::Error for SubscriptionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_state_conflict_is_retryable() {
        assert!(SubscriptionError::StateConflict("gone".into()).is_retryable());
        assert!(!SubscriptionError::InvalidSpec("lsn".into()).is_retryable());
        assert!(!SubscriptionError::Server {
            code: Some("55000".into()),
            message: "nope".into()
        }
        .is_retryable());
        assert!(!SubscriptionError::Connection("reset".into()).is_retryable());
    }

    #[test]
    fn test_server_error_keeps_message_verbatim() {
        let err = SubscriptionError::Server {
            code: Some("42710".into()),
            message: "subscription \"s1\" already exists".into(),
        };
        assert_eq!(
            err.to_string(),
            "Server error [42710]: subscription \"s1\" already exists"
        );
        assert!(err.has_sqlstate(&SqlState::DUPLICATE_OBJECT));
        assert_eq!(
            err.server_message(),
            Some("subscription \"s1\" already exists")
        );
    }

    #[test]
    fn test_timeout_display_includes_last_error() {
        let err = SubscriptionError::ConvergenceTimeout {
            waited: Duration::from_millis(1500),
            attempts: 4,
            last_error: Some("connection refused".into()),
        };
        let text = err.to_string();
        assert!(text.contains("4 attempts"));
        assert!(text.contains("connection refused"));
        assert!(err.is_timeout());
    }
}
