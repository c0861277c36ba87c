//! Shared error taxonomy for the sync pipeline.
//!
//! `SyncError` is the single error type threaded through the matcher, merger,
//! directory/CRM clients, and the sync engine. `csync-api` maps it onto HTTP
//! responses; `csync-worker` maps it onto reschedule/dead-letter decisions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed match keys, unknown direction, unparseable id list, etc.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Directory auth expired or was revoked. Never dead-lettered.
    #[error("unauthorised")]
    Unauthorised,

    /// Source CRM credentials are absent. The worker dead-letters on this.
    #[error("source CRM credentials missing")]
    AuthMissing,

    /// Directory rate limit exhausted after retries.
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    /// Recoverable mid-apply condition: `missing_etag`, `missing_primary`,
    /// `update_failed:<status>`. Handled inside `SyncEngine::apply` with a
    /// bounded re-plan loop; propagated once the loop is exhausted.
    #[error("recoverable: {reason}")]
    Recoverable { reason: String },

    /// Any other non-2xx directory/CRM response, or a network failure.
    #[error("transport error: {status} {body}")]
    Transport { status: u16, body: String },

    /// Storage (SQLite) failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    pub fn recoverable(reason: impl Into<String>) -> Self {
        SyncError::Recoverable {
            reason: reason.into(),
        }
    }

    /// `true` for errors the sync engine's apply loop re-plans and retries
    /// in-process, as opposed to errors that propagate to the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SyncError::Recoverable { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_helper_sets_reason() {
        let err = SyncError::recoverable("missing_etag");
        match &err {
            SyncError::Recoverable { reason } => assert_eq!(reason, "missing_etag"),
            _ => panic!("expected Recoverable"),
        }
        assert!(err.is_recoverable());
    }

    #[test]
    fn rate_limited_is_not_recoverable() {
        assert!(!SyncError::RateLimited {
            retry_after_seconds: 12
        }
        .is_recoverable());
    }
}
