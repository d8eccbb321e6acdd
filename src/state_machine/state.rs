use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::session::Session;
use crate::adapter::{AppReport, AppStatus};

/// Lifecycle states of a batch session.
///
/// Each session flows through: starting → running → {success | dead | killed | error}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Success,
    Dead,
    Killed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionState::Starting | SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::Success => write!(f, "success"),
            SessionState::Dead => write!(f, "dead"),
            SessionState::Killed => write!(f, "killed"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

/// Something that happened to a session and may move it along.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The launcher handed back the resource manager's application id.
    Launched { app_id: String },
    /// The local submission step itself failed.
    LaunchFailed { reason: String },
    /// A status snapshot from the resource manager.
    Observed(AppReport),
    /// Recent log lines for the application.
    Logs(Vec<String>),
    /// This service asked the resource manager to kill the application.
    TerminateRequested,
    /// Recovery could not correlate the session with any application.
    ApplicationLost,
}

/// The result of applying an event to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Moved to a new non-terminal state.
    Next(SessionState),
    /// Reached a terminal state.
    Complete(SessionState),
    /// State unchanged, but metadata (app id, URLs, log) may have been updated.
    Stay,
    /// The event had no effect at all.
    Ignored,
}

/// Applies events to sessions.
///
/// Terminal states absorb every further observation. `killed` is reachable only
/// through [`SessionEvent::TerminateRequested`] and `error` only through
/// [`SessionEvent::LaunchFailed`]; an application that started and then failed,
/// vanished, or was killed by someone else ends up `dead`.
pub struct StateMachine;

impl StateMachine {
    pub fn apply(session: &mut Session, event: SessionEvent) -> Transition {
        let transition = match event {
            SessionEvent::Launched { app_id } => Self::record_app_id(session, app_id),
            SessionEvent::LaunchFailed { reason } => {
                if session.state != SessionState::Starting || session.app_id.is_some() {
                    return Transition::Ignored;
                }
                session.log_tail.push(format!("launch failed: {reason}"));
                Self::move_to(session, SessionState::Error)
            }
            SessionEvent::Observed(report) => Self::observe(session, report),
            SessionEvent::Logs(lines) => {
                if lines.is_empty() {
                    return Transition::Ignored;
                }
                session.log_tail.extend(lines);
                Transition::Stay
            }
            SessionEvent::TerminateRequested => {
                if session.state.is_terminal() {
                    return Transition::Ignored;
                }
                Self::move_to(session, SessionState::Killed)
            }
            SessionEvent::ApplicationLost => {
                if session.state.is_terminal() {
                    return Transition::Ignored;
                }
                Self::move_to(session, SessionState::Dead)
            }
        };

        if transition != Transition::Ignored {
            session.updated_at = Utc::now();
        }
        transition
    }

    // The app id is set once. A late launch result for an already-terminal
    // session (deleted while starting) is still recorded so it can be killed.
    fn record_app_id(session: &mut Session, app_id: String) -> Transition {
        match &session.app_id {
            Some(existing) if *existing == app_id => Transition::Ignored,
            Some(existing) => {
                tracing::warn!(
                    session_id = session.id,
                    existing = %existing,
                    rejected = %app_id,
                    "refusing to replace application id"
                );
                Transition::Ignored
            }
            None => {
                session.app_id = Some(app_id);
                Transition::Stay
            }
        }
    }

    fn observe(session: &mut Session, report: AppReport) -> Transition {
        if session.state.is_terminal() {
            return Transition::Ignored;
        }

        let mut metadata_changed = false;
        if session.tracking_url.is_none() && report.tracking_url.is_some() {
            session.tracking_url = report.tracking_url;
            metadata_changed = true;
        }
        if session.driver_log_url.is_none() && report.driver_log_url.is_some() {
            session.driver_log_url = report.driver_log_url;
            metadata_changed = true;
        }

        let target = match report.status {
            AppStatus::Pending => None,
            AppStatus::Running => Some(SessionState::Running),
            AppStatus::Succeeded => Some(SessionState::Success),
            AppStatus::Failed | AppStatus::Killed => Some(SessionState::Dead),
            // Without an app id there is nothing that could have disappeared.
            AppStatus::NotFound if session.app_id.is_some() => Some(SessionState::Dead),
            AppStatus::NotFound => None,
        };

        match target {
            Some(state) if state == session.state => Self::stay(metadata_changed),
            Some(state) => {
                // An application seen finished while still `starting` did run;
                // record `running` so the history never skips it.
                if state.is_terminal() && session.state == SessionState::Starting {
                    Self::move_to(session, SessionState::Running);
                }
                Self::move_to(session, state)
            }
            None => Self::stay(metadata_changed),
        }
    }

    fn stay(metadata_changed: bool) -> Transition {
        if metadata_changed {
            Transition::Stay
        } else {
            Transition::Ignored
        }
    }

    fn move_to(session: &mut Session, next: SessionState) -> Transition {
        session.state_history.push(session.state);
        session.state = next;
        if next.is_terminal() {
            session.ended_at = Some(Utc::now());
            Transition::Complete(next)
        } else {
            Transition::Next(next)
        }
    }
}
