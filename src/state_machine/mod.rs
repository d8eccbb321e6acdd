mod session;
mod state;

pub use session::{LaunchTarget, LogTail, Session, SessionId, SubmissionSpec};
pub use state::{SessionEvent, SessionState, StateMachine, Transition};
