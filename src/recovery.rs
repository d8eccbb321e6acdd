//! Startup reconstruction of sessions from the store.
//!
//! Terminal sessions come back as they were. Live ones are handed to a monitor
//! that queries the resource manager before anything else, so an application
//! that finished or vanished while the service was down is reconciled at once.
//! Recovery never submits anything.

use tracing::{info, warn};

use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::state_machine::SessionId;

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions restored in a terminal state.
    pub terminal: Vec<SessionId>,
    /// Sessions restored live and now being reconciled.
    pub reconciling: Vec<SessionId>,
    /// Sessions already registered, left untouched.
    pub skipped: Vec<SessionId>,
}

impl RecoveryReport {
    pub fn restored(&self) -> usize {
        self.terminal.len() + self.reconciling.len()
    }
}

pub struct RecoveryManager<'a> {
    registry: &'a SessionRegistry,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(registry: &'a SessionRegistry) -> Self {
        Self { registry }
    }

    /// Load every stored session, in id order, into the registry.
    pub fn recover(&self) -> Result<RecoveryReport, SessionError> {
        let sessions = self.registry.store().load_all()?;
        let mut report = RecoveryReport::default();

        for session in sessions {
            let id = session.id;
            if session.deleted {
                warn!(session_id = id, "stored session is marked deleted, skipping");
                report.skipped.push(id);
                continue;
            }
            let live = !session.state.is_terminal();
            let state = session.state;
            if !self.registry.restore(session) {
                report.skipped.push(id);
                continue;
            }
            if live {
                info!(session_id = id, %state, "reconciling recovered session");
                report.reconciling.push(id);
            } else {
                report.terminal.push(id);
            }
        }

        info!(
            restored = report.restored(),
            reconciling = report.reconciling.len(),
            "recovery complete"
        );
        Ok(report)
    }
}
