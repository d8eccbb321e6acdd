//! Batch session manager for Spark applications running on YARN.
//!
//! A [`SessionRegistry`] tracks one [`Session`] per submitted job, persists it
//! through a [`SessionStore`] before reporting anything, and follows the real
//! application through an [`AppStatusAdapter`]. After a restart the
//! [`RecoveryManager`] reloads every session and reconciles it without
//! re-launching.

pub mod adapter;
pub mod cli;
pub mod config;
pub mod error;
pub mod launcher;
pub mod monitor;
pub mod recovery;
pub mod registry;
pub mod state_machine;
pub mod store;
pub mod ui;

#[cfg(test)]
mod test_support;

pub use adapter::{AppStatusAdapter, YarnClient};
pub use config::BatchConfig;
pub use error::SessionError;
pub use launcher::{Launcher, SparkSubmitLauncher};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use registry::{RegistrySettings, SessionRegistry};
pub use state_machine::{Session, SessionId, SessionState, SubmissionSpec};
pub use store::{FileSessionStore, SessionStore};
