//! Per-session background work: launch, correlation, and status polling.
//!
//! A [`Monitor`] never touches session state directly. Everything it learns is
//! handed to its [`TransitionSink`] and applied there under the session's lock,
//! in the order it was learned.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, AppReport, AppStatus, AppStatusAdapter};
use crate::launcher::Launcher;
use crate::registry::TransitionSink;
use crate::state_machine::{SessionEvent, SessionId, SubmissionSpec};

/// Exponential backoff for transient adapter failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl Backoff {
    /// delay = base_delay_ms * 2^(attempt - 1), capped at max_delay_ms
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Timing knobs for the background tasks.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Bound on a single adapter call; hitting it counts as a transient failure.
    pub timeout: Duration,
    pub backoff: Backoff,
    pub terminate_attempts: u32,
    pub log_tail_lines: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
            terminate_attempts: 5,
            log_tail_lines: 100,
        }
    }
}

/// How a monitor gets hold of the application id before it can poll.
pub(crate) enum StartMode {
    /// Fresh session: submit it.
    Launch { spec: SubmissionSpec, app_tag: String },
    /// Recovered session with a known application: reconcile right away.
    Resume { app_id: String },
    /// Recovered session whose launch never reported back: search by tag.
    Locate { app_tag: String },
}

pub(crate) struct Monitor {
    pub id: SessionId,
    pub sink: TransitionSink,
    pub adapter: Arc<dyn AppStatusAdapter>,
    pub launcher: Arc<dyn Launcher>,
    pub settings: PollSettings,
    /// Cancelled when the session is deleted or collected.
    pub cancel: CancellationToken,
    /// Cancelled when the whole registry stops.
    pub shutdown: CancellationToken,
}

impl Monitor {
    pub async fn run(self, start: StartMode) {
        let (app_id, immediate) = match start {
            StartMode::Launch { spec, app_tag } => match self.launch(&spec, &app_tag).await {
                Some(app_id) => (app_id, false),
                None => return,
            },
            StartMode::Resume { app_id } => (app_id, true),
            StartMode::Locate { app_tag } => match self.locate(&app_tag).await {
                Some(app_id) => (app_id, true),
                None => return,
            },
        };
        self.poll(&app_id, immediate).await;
        debug!(session_id = self.id, "monitor stopped");
    }

    // Launch is not cancelled by a delete: the application id is still needed
    // to kill whatever was submitted.
    async fn launch(&self, spec: &SubmissionSpec, app_tag: &str) -> Option<String> {
        match self.launcher.launch(spec, app_tag).await {
            Ok(launched) => {
                info!(session_id = self.id, app_id = %launched.app_id, "application submitted");
                self.deliver(SessionEvent::Logs(launched.log_lines)).await;
                self.deliver(SessionEvent::Launched {
                    app_id: launched.app_id.clone(),
                })
                .await;
                Some(launched.app_id)
            }
            Err(err) => {
                warn!(session_id = self.id, error = %err, "launch failed");
                self.deliver(SessionEvent::LaunchFailed {
                    reason: err.to_string(),
                })
                .await;
                None
            }
        }
    }

    async fn locate(&self, app_tag: &str) -> Option<String> {
        let mut failures = 0u32;
        loop {
            let lookup = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = timeout(self.settings.timeout, self.adapter.find_by_tag(app_tag)) => {
                    flatten_timeout(result, self.settings.timeout)
                }
            };
            match lookup {
                Ok(Some(app_id)) => {
                    info!(session_id = self.id, app_id = %app_id, tag = app_tag, "application found by tag");
                    self.deliver(SessionEvent::Launched {
                        app_id: app_id.clone(),
                    })
                    .await;
                    return Some(app_id);
                }
                Ok(None) => {
                    warn!(session_id = self.id, tag = app_tag, "no application carries this session's tag");
                    self.deliver(SessionEvent::ApplicationLost).await;
                    return None;
                }
                Err(err) => {
                    failures += 1;
                    if !self.back_off(failures, &err).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn poll(&self, app_id: &str, mut immediate: bool) {
        let mut failures = 0u32;
        loop {
            if !immediate {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = sleep(self.settings.interval) => {}
                }
            }
            immediate = false;

            if self.cancel.is_cancelled() || self.sink.state().is_terminal() {
                return;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = timeout(self.settings.timeout, self.adapter.query(app_id)) => {
                    flatten_timeout(result, self.settings.timeout)
                }
            };

            match result {
                Ok(report) => {
                    failures = 0;
                    if report.status.is_final() && report.status != AppStatus::NotFound {
                        self.collect_logs(app_id).await;
                    }
                    self.observe(report).await;
                }
                Err(err) => {
                    failures += 1;
                    if !self.back_off(failures, &err).await {
                        return;
                    }
                }
            }
        }
    }

    async fn collect_logs(&self, app_id: &str) {
        let fetch = self.adapter.fetch_log(app_id, self.settings.log_tail_lines);
        match timeout(self.settings.timeout, fetch).await {
            Ok(Ok(lines)) => self.deliver(SessionEvent::Logs(lines)).await,
            Ok(Err(err)) => debug!(session_id = self.id, error = %err, "log fetch failed"),
            Err(_) => debug!(session_id = self.id, "log fetch timed out"),
        }
    }

    async fn observe(&self, report: AppReport) {
        debug!(session_id = self.id, status = ?report.status, "observed application");
        self.deliver(SessionEvent::Observed(report)).await;
    }

    /// Sleep after a transient failure. Returns false if cancelled meanwhile.
    async fn back_off(&self, attempt: u32, err: &AdapterError) -> bool {
        let delay = self.settings.backoff.delay_for_attempt(attempt);
        warn!(
            session_id = self.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "resource manager query failed, retrying"
        );
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Record `event`, retrying failed store writes until the registry stops.
    ///
    /// Status reports are the exception: the next poll repeats them, so a
    /// failed write just waits for it. Everything else is produced once and
    /// must not be lost, even after the session's own cancellation, since a
    /// late launch result is what lets a deleted session's application be killed.
    async fn deliver(&self, event: SessionEvent) {
        let repeated_by_next_poll = matches!(event, SessionEvent::Observed(_));
        let mut failures = 0u32;
        loop {
            let err = match self.sink.apply(event.clone()).await {
                Ok(()) => return,
                Err(err) => err,
            };
            if repeated_by_next_poll {
                error!(session_id = self.id, error = %err, "failed to persist status report; keeping previous state");
                return;
            }

            failures += 1;
            let delay = self.settings.backoff.delay_for_attempt(failures);
            error!(
                session_id = self.id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "failed to persist session event, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }
}

/// Ask the resource manager to kill `app_id`, retrying transient failures.
pub(crate) async fn terminate_with_retry(
    adapter: Arc<dyn AppStatusAdapter>,
    id: SessionId,
    app_id: String,
    settings: PollSettings,
) {
    let attempts = settings.terminate_attempts.max(1);
    for attempt in 1..=attempts {
        let result = flatten_timeout(
            timeout(settings.timeout, adapter.terminate(&app_id)).await,
            settings.timeout,
        );
        match result {
            Ok(()) => {
                info!(session_id = id, app_id = %app_id, "terminate request accepted");
                return;
            }
            Err(err) if attempt < attempts => {
                let delay = settings.backoff.delay_for_attempt(attempt);
                warn!(session_id = id, app_id = %app_id, attempt, error = %err, "terminate request failed, retrying");
                sleep(delay).await;
            }
            Err(err) => {
                error!(session_id = id, app_id = %app_id, attempts, error = %err, "giving up on terminate request");
            }
        }
    }
}

fn flatten_timeout<T>(
    result: Result<Result<T, AdapterError>, tokio::time::error::Elapsed>,
    limit: Duration,
) -> Result<T, AdapterError> {
    result.unwrap_or_else(|_| Err(AdapterError::Timeout(limit.as_millis() as u64)))
}
