//! Error types for acquisition and persistence.
//!
//! Acquisition failures are classified so the recovery layer can decide
//! between backing off, re-authenticating and giving up. Persistence
//! failures distinguish replayed units from transient lock contention.

use rusqlite::ffi;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Failure while acquiring a slice of odds history
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    /// HTTP 429 from the source
    #[error("throttled by source: {url}")]
    Throttled { url: String },

    /// HTTP 403, a redirect to the login page, or a login page body
    #[error("session expired: {url}")]
    AuthExpired { url: String },

    /// Re-login budget for this run is used up
    #[error("re-login budget exhausted after {attempts} attempts")]
    ReloginBudgetExhausted { attempts: u32 },

    #[error("login failed: {0}")]
    LoginFailed(String),

    /// Connection reset, timeout or similar
    #[error("network failure: {0}")]
    TransientNetwork(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("parse failure: {0}")]
    Parse(String),

    #[error("invalid record: {0}")]
    Validation(String),
}

impl ScrapeError {
    /// Whether the recovery policy may retry this failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScrapeError::Throttled { .. }
                | ScrapeError::AuthExpired { .. }
                | ScrapeError::TransientNetwork(_)
        )
    }

    /// Whether this failure means no further authenticated work can succeed
    pub fn is_hard_stop(&self) -> bool {
        matches!(self, ScrapeError::ReloginBudgetExhausted { .. })
    }

    /// Short class name used in run summaries
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::Throttled { .. } => "throttled",
            ScrapeError::AuthExpired { .. } => "auth_expired",
            ScrapeError::ReloginBudgetExhausted { .. } => "relogin_exhausted",
            ScrapeError::LoginFailed(_) => "login_failed",
            ScrapeError::TransientNetwork(_) => "network",
            ScrapeError::Http { .. } => "http",
            ScrapeError::Parse(_) => "parse",
            ScrapeError::Validation(_) => "validation",
        }
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            return match status.as_u16() {
                429 => ScrapeError::Throttled { url },
                403 => ScrapeError::AuthExpired { url },
                code => ScrapeError::Http { status: code, url },
            };
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            ScrapeError::TransientNetwork(err.to_string())
        } else if err.is_decode() {
            ScrapeError::Parse(err.to_string())
        } else {
            ScrapeError::TransientNetwork(err.to_string())
        }
    }
}

/// Failure while persisting a unit
#[derive(Debug, Error)]
pub enum PersistError {
    /// Uniqueness violation on the unit's outer key; treated as already done
    #[error("unit already persisted: {0}")]
    Conflict(String),

    /// Lock contention or a busy database
    #[error("database busy: {0}")]
    Transient(String),

    #[error("database failure: {0}")]
    Fatal(String),
}

impl PersistError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistError::Transient(_))
    }
}

impl From<rusqlite::Error> for PersistError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, _) = &err {
            match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return PersistError::Transient(err.to_string());
                }
                ErrorCode::ConstraintViolation
                    if code.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                        || code.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    return PersistError::Conflict(err.to_string());
                }
                _ => {}
            }
        }
        PersistError::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: ErrorCode, extended_code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            ffi::Error {
                code,
                extended_code,
            },
            None,
        )
    }

    #[test]
    fn test_scrape_error_retryable() {
        assert!(ScrapeError::Throttled { url: "u".into() }.is_retryable());
        assert!(ScrapeError::AuthExpired { url: "u".into() }.is_retryable());
        assert!(ScrapeError::TransientNetwork("reset".into()).is_retryable());
        assert!(!ScrapeError::Parse("no table".into()).is_retryable());
        assert!(!ScrapeError::Http { status: 500, url: "u".into() }.is_retryable());
        assert!(!ScrapeError::ReloginBudgetExhausted { attempts: 3 }.is_retryable());
    }

    #[test]
    fn test_hard_stop() {
        assert!(ScrapeError::ReloginBudgetExhausted { attempts: 3 }.is_hard_stop());
        assert!(!ScrapeError::LoginFailed("bad password".into()).is_hard_stop());
    }

    #[test]
    fn test_persist_error_classification() {
        let busy = PersistError::from(sqlite_failure(ErrorCode::DatabaseBusy, 5));
        assert!(matches!(busy, PersistError::Transient(_)));
        assert!(busy.is_retryable());

        let locked = PersistError::from(sqlite_failure(ErrorCode::DatabaseLocked, 6));
        assert!(matches!(locked, PersistError::Transient(_)));

        let unique = PersistError::from(sqlite_failure(
            ErrorCode::ConstraintViolation,
            ffi::SQLITE_CONSTRAINT_UNIQUE,
        ));
        assert!(matches!(unique, PersistError::Conflict(_)));
        assert!(!unique.is_retryable());

        let foreign_key = PersistError::from(sqlite_failure(
            ErrorCode::ConstraintViolation,
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY,
        ));
        assert!(matches!(foreign_key, PersistError::Fatal(_)));
    }
}
