//! In-memory stand-ins for the resource manager, the launcher, and a store
//! that fails on demand.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Notify;

use crate::adapter::{AdapterError, AppReport, AppStatus, AppStatusAdapter};
use crate::launcher::{LaunchError, Launched, Launcher};
use crate::monitor::{Backoff, PollSettings};
use crate::registry::{RegistrySettings, SessionRegistry};
use crate::state_machine::{LaunchTarget, Session, SessionId, SessionState, SubmissionSpec};
use crate::store::{FileSessionStore, SessionStore, StoreError};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub(crate) fn fast_settings() -> RegistrySettings {
    RegistrySettings {
        poll: PollSettings {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(50),
            backoff: Backoff {
                base_delay_ms: 5,
                max_delay_ms: 20,
            },
            terminate_attempts: 3,
            log_tail_lines: 50,
        },
        kill_pattern: Some(Regex::new("(?i)killed by user").unwrap()),
    }
}

pub(crate) fn jar_spec() -> SubmissionSpec {
    let mut spec = SubmissionSpec::new(LaunchTarget::Jar {
        jar: "hdfs:///jobs/etl.jar".into(),
        main_class: "com.example.Etl".into(),
    });
    spec.args = vec!["--date".into(), "2026-10-01".into()];
    spec
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub(crate) async fn wait_for_state(registry: &SessionRegistry, id: SessionId, state: SessionState) {
    let mut rx = registry.subscribe(id).unwrap();
    let reached = matches!(
        tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|current| *current == state)).await,
        Ok(Ok(_))
    );
    assert!(
        reached,
        "session {id} never reached {state}; now {}",
        registry.get(id).unwrap().state
    );
}

#[derive(Default)]
pub(crate) struct FakeAdapter {
    apps: Mutex<HashMap<String, AppStatus>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    tags: Mutex<HashMap<String, String>>,
    terminated: Mutex<Vec<String>>,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    pub queries: AtomicUsize,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, app_id: &str, status: AppStatus) {
        self.apps.lock().unwrap().insert(app_id.to_string(), status);
    }

    /// Make the resource manager lose track of the application.
    pub fn forget(&self, app_id: &str) {
        self.apps.lock().unwrap().remove(app_id);
    }

    pub fn set_logs(&self, app_id: &str, lines: Vec<String>) {
        self.logs.lock().unwrap().insert(app_id.to_string(), lines);
    }

    pub fn tag(&self, tag: &str, app_id: &str) {
        self.tags
            .lock()
            .unwrap()
            .insert(tag.to_string(), app_id.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    fn check_failing(&self) -> Result<(), AdapterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AdapterError::Api {
                status: 503,
                message: "resource manager in standby".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AppStatusAdapter for FakeAdapter {
    async fn query(&self, app_id: &str) -> Result<AppReport, AdapterError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failing()?;
        let status = self.apps.lock().unwrap().get(app_id).copied();
        Ok(status.map_or_else(AppReport::not_found, AppReport::with_status))
    }

    async fn fetch_log(&self, app_id: &str, max_lines: usize) -> Result<Vec<String>, AdapterError> {
        self.check_failing()?;
        let lines = self
            .logs
            .lock()
            .unwrap()
            .get(app_id)
            .cloned()
            .unwrap_or_default();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines.into_iter().skip(skip).collect())
    }

    async fn terminate(&self, app_id: &str) -> Result<(), AdapterError> {
        self.check_failing()?;
        self.terminated.lock().unwrap().push(app_id.to_string());
        let mut apps = self.apps.lock().unwrap();
        if let Some(status) = apps.get_mut(app_id) {
            *status = AppStatus::Killed;
        }
        Ok(())
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<String>, AdapterError> {
        self.check_failing()?;
        Ok(self.tags.lock().unwrap().get(tag).cloned())
    }
}

/// Hands out sequential application ids and registers them as pending.
pub(crate) struct FakeLauncher {
    adapter: Option<Arc<FakeAdapter>>,
    failure: Option<String>,
    gate: Option<Arc<Notify>>,
    counter: AtomicU32,
    pub launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(adapter: Arc<FakeAdapter>) -> Self {
        Self {
            adapter: Some(adapter),
            failure: None,
            gate: None,
            counter: AtomicU32::new(0),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            adapter: None,
            failure: Some(reason.to_string()),
            gate: None,
            counter: AtomicU32::new(0),
            launches: AtomicUsize::new(0),
        }
    }

    /// Hold every launch until `gate` is notified.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, _spec: &SubmissionSpec, _app_tag: &str) -> Result<Launched, LaunchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(reason) = &self.failure {
            return Err(LaunchError::Exited {
                status: "exit status: 127".into(),
                tail: reason.clone(),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let app_id = format!("application_1700000000000_{n:04}");
        if let Some(adapter) = &self.adapter {
            adapter.set_status(&app_id, AppStatus::Pending);
        }
        Ok(Launched {
            log_lines: vec![format!("INFO Client: Submitted application {app_id}")],
            app_id,
        })
    }
}

/// File-backed store whose writes can be made to fail or stall.
pub(crate) struct FlakyStore {
    inner: FileSessionStore,
    pub fail_puts: AtomicBool,
    pub fail_deletes: AtomicBool,
    fail_delete_of: Mutex<Option<SessionId>>,
    slow_put: Mutex<Option<(SessionId, Duration)>>,
}

impl FlakyStore {
    pub fn new(inner: FileSessionStore) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_delete_of: Mutex::new(None),
            slow_put: Mutex::new(None),
        }
    }

    /// Make deleting `id` fail while other deletes go through.
    pub fn fail_delete_of(&self, id: SessionId) {
        *self.fail_delete_of.lock().unwrap() = Some(id);
    }

    /// Make every write of `id` take `delay` before it lands.
    pub fn slow_put_of(&self, id: SessionId, delay: Duration) {
        *self.slow_put.lock().unwrap() = Some((id, delay));
    }

    pub fn inner(&self) -> &FileSessionStore {
        &self.inner
    }

    fn injected(&self) -> StoreError {
        StoreError::Io {
            path: PathBuf::from(self.inner.root()),
            source: io::Error::other("injected failure"),
        }
    }
}

impl SessionStore for FlakyStore {
    fn put(&self, session: &Session) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(self.injected());
        }
        let slow = *self.slow_put.lock().unwrap();
        if let Some((id, delay)) = slow
            && id == session.id
        {
            std::thread::sleep(delay);
        }
        self.inner.put(session)
    }

    fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst)
            || *self.fail_delete_of.lock().unwrap() == Some(id)
        {
            return Err(self.injected());
        }
        self.inner.delete(id)
    }

    fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        self.inner.load_all()
    }

    fn next_id(&self) -> Result<SessionId, StoreError> {
        self.inner.next_id()
    }

    fn save_next_id(&self, next: SessionId) -> Result<(), StoreError> {
        self.inner.save_next_id(next)
    }
}
