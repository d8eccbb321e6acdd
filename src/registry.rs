//! The authoritative table of sessions.
//!
//! [`SessionRegistry`] allocates ids, persists metadata before reporting
//! anything, and owns one background [`Monitor`](crate::monitor) task per live
//! session. Each monitor hands what it observes to a [`TransitionSink`], which
//! applies it under the session's lock on a blocking thread, so every
//! transition for a session is durably stored in the order it was produced
//! while other sessions carry on independently.
//! Public operations are synchronous and never wait on the network.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use regex::Regex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::AppStatusAdapter;
use crate::error::SessionError;
use crate::launcher::Launcher;
use crate::monitor::{self, Monitor, PollSettings, StartMode};
use crate::state_machine::{
    Session, SessionEvent, SessionId, SessionState, StateMachine, SubmissionSpec, Transition,
};
use crate::store::{SessionStore, StoreError};

#[derive(Debug, Clone, Default)]
pub struct RegistrySettings {
    pub poll: PollSettings,
    /// Log pattern that marks an application as killed by someone else.
    pub kill_pattern: Option<Regex>,
}

/// One session plus the handles of its background work.
pub(crate) struct SessionSlot {
    session: Mutex<Session>,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl SessionSlot {
    fn new(session: Session, parent: &CancellationToken) -> Self {
        let (state_tx, _) = watch::channel(session.state);
        Self {
            session: Mutex::new(session),
            state_tx,
            cancel: parent.child_token(),
        }
    }

    // Mutations go through a clone that is committed only after it is stored,
    // so a poisoned guard still holds a consistent session.
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state without taking the session lock.
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn commit(&self, guard: &mut MutexGuard<'_, Session>, next: Session) {
        let state = next.state;
        **guard = next;
        self.state_tx.send_replace(state);
    }
}

/// Where a monitor sends what it learns about its session.
///
/// Events are applied one at a time, in the order the monitor awaits them.
pub(crate) struct TransitionSink {
    id: SessionId,
    inner: Weak<Inner>,
    slot: Arc<SessionSlot>,
}

impl TransitionSink {
    pub(crate) fn state(&self) -> SessionState {
        self.slot.state()
    }

    /// Apply `event` under the session's lock, off the async workers.
    ///
    /// Fails only when the store write failed, in which case the session is
    /// unchanged. Events for a registry that no longer exists are dropped.
    pub(crate) async fn apply(&self, event: SessionEvent) -> Result<(), StoreError> {
        // No strong reference is held across the await, so a stopped registry
        // (and its store lock) is released as soon as the write is done.
        let Some(inner) = self.inner.upgrade() else {
            debug!(session_id = self.id, "registry gone, dropping event");
            return Ok(());
        };
        let slot = Arc::clone(&self.slot);
        let id = self.id;
        let applied = tokio::task::spawn_blocking(move || inner.apply(id, &slot, event)).await;

        match applied {
            Ok(Ok(Some(orphaned_app))) => {
                if let Some(inner) = self.inner.upgrade() {
                    info!(session_id = id, app_id = %orphaned_app, "killing application launched after delete");
                    inner.spawn_terminate(id, orphaned_app);
                }
                Ok(())
            }
            Ok(Ok(None)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(err) => {
                error!(session_id = id, error = %err, "transition task panicked");
                Ok(())
            }
        }
    }
}

struct Inner {
    store: Arc<dyn SessionStore>,
    adapter: Arc<dyn AppStatusAdapter>,
    launcher: Arc<dyn Launcher>,
    settings: RegistrySettings,
    next_id: Mutex<SessionId>,
    sessions: RwLock<BTreeMap<SessionId, Arc<SessionSlot>>>,
    terminations: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Table of sessions, keyed by id.
///
/// Cloning is cheap and every clone refers to the same table. It lives as long
/// as the process; call [`SessionRegistry::shutdown`] to stop background work.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Build a registry over `store`. Must be called inside a Tokio runtime.
    ///
    /// Id allocation resumes above every id the store has ever issued, so new
    /// sessions can be created before recovery has run.
    pub fn new(
        store: Arc<dyn SessionStore>,
        adapter: Arc<dyn AppStatusAdapter>,
        launcher: Arc<dyn Launcher>,
        settings: RegistrySettings,
    ) -> Result<Self, SessionError> {
        let next_id = store.next_id()?;
        let inner = Arc::new(Inner {
            store,
            adapter,
            launcher,
            settings,
            next_id: Mutex::new(next_id),
            sessions: RwLock::new(BTreeMap::new()),
            terminations: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        });
        debug!(next_id, "session registry ready");
        Ok(Self { inner })
    }

    /// Record a new session and start launching it in the background.
    pub fn create(&self, spec: SubmissionSpec) -> Result<SessionId, SessionError> {
        let id = self.inner.allocate_id()?;
        let session = Session::new(id, spec, self.inner.settings.poll.log_tail_lines);
        self.inner.store.put(&session)?;

        let start = StartMode::Launch {
            spec: session.spec.clone(),
            app_tag: session.app_tag.clone(),
        };
        info!(session_id = id, tag = %session.app_tag, "session created");
        let slot = self.inner.insert(session);
        self.spawn_monitor(id, slot, start);
        Ok(id)
    }

    /// Snapshot of a session. Sessions deleted since startup are still visible.
    pub fn get(&self, id: SessionId) -> Result<Session, SessionError> {
        Ok(self.inner.slot(id)?.lock().clone())
    }

    /// All sessions not deleted, in id order.
    pub fn list(&self) -> Vec<Session> {
        self.inner
            .slots()
            .into_iter()
            .map(|slot| slot.lock().clone())
            .filter(|session| !session.deleted)
            .collect()
    }

    pub fn log_tail(&self, id: SessionId) -> Result<Vec<String>, SessionError> {
        Ok(self.inner.slot(id)?.lock().log_tail.to_vec())
    }

    /// Watch a session's state as transitions are applied.
    pub fn subscribe(&self, id: SessionId) -> Result<watch::Receiver<SessionState>, SessionError> {
        Ok(self.inner.slot(id)?.state_tx.subscribe())
    }

    /// Delete a session.
    ///
    /// A live session is marked `killed` and its application is sent a
    /// terminate request. A terminal session keeps its outcome. Either way it
    /// is removed from the store and from [`list`](Self::list). Deleting twice
    /// is a no-op.
    pub fn delete(&self, id: SessionId) -> Result<(), SessionError> {
        let slot = self.inner.slot(id)?;
        let terminate = {
            let mut guard = slot.lock();
            if guard.deleted {
                return Ok(());
            }
            let mut next = guard.clone();
            let transition = StateMachine::apply(&mut next, SessionEvent::TerminateRequested);
            next.deleted = true;
            self.inner.store.delete(id)?;

            info!(session_id = id, state = %next.state, "session deleted");
            let terminate = match transition {
                Transition::Complete(SessionState::Killed) => next.app_id.clone(),
                _ => None,
            };
            slot.commit(&mut guard, next);
            terminate
        };

        if let Some(app_id) = terminate {
            self.inner.spawn_terminate(id, app_id);
        }
        slot.cancel.cancel();
        Ok(())
    }

    /// Drop terminal sessions that ended more than `retention` ago.
    ///
    /// Each session leaves the table as soon as its record is gone, so a
    /// failure part way through never leaves a listed session without one.
    pub fn gc(&self, retention: Duration) -> Result<Vec<SessionId>, SessionError> {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        for slot in self.inner.slots() {
            let guard = slot.lock();
            let expired = guard.state.is_terminal()
                && guard.ended_at.is_some_and(|ended| ended <= cutoff);
            if !expired {
                continue;
            }
            if !guard.deleted {
                self.inner.store.delete(guard.id)?;
            }
            self.inner.write_sessions().remove(&guard.id);
            slot.cancel.cancel();
            removed.push(guard.id);
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "garbage collected terminal sessions");
        }
        Ok(removed)
    }

    /// Stop all background tasks. Session state is left as it is.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait for every terminate request issued so far to finish its retries.
    /// A short-lived process calls this before exiting.
    pub async fn wait_for_terminations(&self) {
        loop {
            let pending = std::mem::take(
                &mut *self
                    .inner
                    .terminations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(err) = handle.await {
                    warn!(error = %err, "terminate task did not complete");
                }
            }
        }
    }

    pub(crate) fn store(&self) -> &dyn SessionStore {
        self.inner.store.as_ref()
    }

    /// Re-register a persisted session. Live sessions are reconciled against
    /// the resource manager right away; nothing is ever re-launched.
    /// Returns false if the id is already registered.
    pub(crate) fn restore(&self, mut session: Session) -> bool {
        let id = session.id;
        self.inner.ensure_next_id_above(id);
        if self.inner.read_sessions().contains_key(&id) {
            return false;
        }

        session
            .log_tail
            .set_capacity(self.inner.settings.poll.log_tail_lines);
        let start = if session.state.is_terminal() {
            None
        } else {
            Some(match &session.app_id {
                Some(app_id) => StartMode::Resume {
                    app_id: app_id.clone(),
                },
                None => StartMode::Locate {
                    app_tag: session.app_tag.clone(),
                },
            })
        };
        let slot = self.inner.insert(session);
        if let Some(start) = start {
            self.spawn_monitor(id, slot, start);
        }
        true
    }

    fn spawn_monitor(&self, id: SessionId, slot: Arc<SessionSlot>, start: StartMode) {
        let inner = &self.inner;
        let monitor = Monitor {
            id,
            cancel: slot.cancel.clone(),
            shutdown: inner.shutdown.clone(),
            sink: TransitionSink {
                id,
                inner: Arc::downgrade(inner),
                slot,
            },
            adapter: Arc::clone(&inner.adapter),
            launcher: Arc::clone(&inner.launcher),
            settings: inner.settings.poll.clone(),
        };
        tokio::spawn(monitor.run(start));
    }
}

impl Inner {
    fn allocate_id(&self) -> Result<SessionId, SessionError> {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        self.store.save_next_id(id + 1)?;
        *next = id + 1;
        Ok(id)
    }

    fn ensure_next_id_above(&self, id: SessionId) {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        if *next <= id {
            *next = id + 1;
        }
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<SessionId, Arc<SessionSlot>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<SessionId, Arc<SessionSlot>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>, SessionError> {
        self.read_sessions()
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    fn slots(&self) -> Vec<Arc<SessionSlot>> {
        self.read_sessions().values().cloned().collect()
    }

    fn insert(&self, session: Session) -> Arc<SessionSlot> {
        let id = session.id;
        let slot = Arc::new(SessionSlot::new(session, &self.shutdown));
        self.write_sessions().insert(id, Arc::clone(&slot));
        slot
    }

    fn spawn_terminate(&self, id: SessionId, app_id: String) {
        let handle = tokio::spawn(monitor::terminate_with_retry(
            Arc::clone(&self.adapter),
            id,
            app_id,
            self.settings.poll.clone(),
        ));
        let mut terminations = self.terminations.lock().unwrap_or_else(PoisonError::into_inner);
        terminations.retain(|pending| !pending.is_finished());
        terminations.push(handle);
    }

    /// Apply one monitor report under the session's lock. Blocks on the store.
    ///
    /// Returns the application id to kill when a launch reported back after
    /// its session was deleted.
    fn apply(
        &self,
        id: SessionId,
        slot: &SessionSlot,
        event: SessionEvent,
    ) -> Result<Option<String>, StoreError> {
        let mut guard = slot.lock();
        let previous = guard.state;
        let mut next = guard.clone();
        let transition = StateMachine::apply(&mut next, event);
        if transition == Transition::Ignored {
            return Ok(None);
        }

        if !next.deleted {
            self.store.put(&next)?;
        }

        let orphaned_app = match (&guard.app_id, &next.app_id) {
            (None, Some(app_id)) if next.state == SessionState::Killed => Some(app_id.clone()),
            _ => None,
        };

        match transition {
            Transition::Next(state) | Transition::Complete(state) => {
                info!(session_id = id, from = %previous, to = %state, "session transition");
                if state == SessionState::Dead && self.killed_elsewhere(&next) {
                    warn!(session_id = id, app_id = ?next.app_id, "application was killed outside this service");
                }
            }
            Transition::Stay | Transition::Ignored => {}
        }
        slot.commit(&mut guard, next);
        Ok(orphaned_app)
    }

    fn killed_elsewhere(&self, session: &Session) -> bool {
        self.settings
            .kill_pattern
            .as_ref()
            .is_some_and(|pattern| session.log_tail.lines().any(|line| pattern.is_match(line)))
    }
}
