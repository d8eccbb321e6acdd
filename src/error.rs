use thiserror::Error;

use crate::state_machine::SessionId;
use crate::store::StoreError;

/// Failures visible to callers of the session registry.
///
/// Launch failures are not here: they end up as the session's `error` state.
/// Adapter failures never leave the background tasks.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn not_found_display() {
        assert_eq!(SessionError::NotFound(4).to_string(), "session 4 not found");
    }

    #[test]
    fn persistence_wraps_store_error() {
        let err: SessionError = StoreError::Io {
            path: PathBuf::from("/var/lib/batchkeeper/next_id"),
            source: std::io::Error::other("disk full"),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "persistence error: I/O error on /var/lib/batchkeeper/next_id: disk full"
        );
    }
}
