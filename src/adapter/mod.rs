pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

pub use client::YarnClient;
pub use error::AdapterError;
pub use types::{AppReport, AppStatus};

/// Read and control access to the cluster resource manager.
///
/// Every error is transient from a session's point of view; an application the
/// resource manager no longer knows about is reported as [`AppStatus::NotFound`],
/// not as an error.
#[async_trait]
pub trait AppStatusAdapter: Send + Sync {
    async fn query(&self, app_id: &str) -> Result<AppReport, AdapterError>;

    /// The most recent `max_lines` log lines of the application.
    async fn fetch_log(&self, app_id: &str, max_lines: usize) -> Result<Vec<String>, AdapterError>;

    /// Ask the resource manager to kill the application. Killing an
    /// application that is already gone succeeds.
    async fn terminate(&self, app_id: &str) -> Result<(), AdapterError>;

    /// Look up the application carrying `tag`, if any.
    async fn find_by_tag(&self, tag: &str) -> Result<Option<String>, AdapterError>;
}
