//! Durable session metadata.
//!
//! [`FileSessionStore`] keeps one JSON document per session under
//! `<state_dir>/sessions/` plus a `next_id` high-water mark. Every write goes to
//! a temp file which is synced and renamed over the target, then the directory
//! itself is synced, so a successful call survives a crash.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

use crate::state_machine::{Session, SessionId};

const SESSIONS_DIR: &str = "sessions";
const NEXT_ID_FILE: &str = "next_id";
const LOCK_FILE: &str = "lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt session record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt id counter {path}: {value:?}")]
    CorruptCounter { path: PathBuf, value: String },

    #[error("state directory {path} is in use by another batchkeeper process")]
    Locked { path: PathBuf },
}

/// Durable, ordered record of session metadata.
pub trait SessionStore: Send + Sync {
    /// Insert or replace the record for `session.id`. Durable on return.
    fn put(&self, session: &Session) -> Result<(), StoreError>;

    /// Remove the record for `id`. Removing an unknown id succeeds.
    fn delete(&self, id: SessionId) -> Result<(), StoreError>;

    /// All stored sessions in ascending id order.
    fn load_all(&self) -> Result<Vec<Session>, StoreError>;

    /// One past the highest id ever issued, including deleted ones.
    fn next_id(&self) -> Result<SessionId, StoreError>;

    /// Persist the high-water mark. Never moves it backwards.
    fn save_next_id(&self, next: SessionId) -> Result<(), StoreError>;
}

/// Holds an exclusive lock on `<root>/lock` for as long as it lives, so only
/// one process at a time writes a given state directory.
pub struct FileSessionStore {
    root: PathBuf,
    sessions_dir: PathBuf,
    _lock: File,
}

impl FileSessionStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let sessions_dir = root.join(SESSIONS_DIR);
        fs::create_dir_all(&sessions_dir).map_err(|source| StoreError::Io {
            path: sessions_dir.clone(),
            source,
        })?;
        let lock = acquire_lock(&root)?;
        Ok(Self {
            root,
            sessions_dir,
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self, id: SessionId) -> PathBuf {
        self.sessions_dir.join(format!("{id:020}.json"))
    }

    fn counter_path(&self) -> PathBuf {
        self.root.join(NEXT_ID_FILE)
    }

    fn stored_counter(&self) -> Result<SessionId, StoreError> {
        let path = self.counter_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        raw.trim()
            .parse::<SessionId>()
            .map_err(|_| StoreError::CorruptCounter { path, value: raw })
    }

    fn session_ids(&self) -> Result<Vec<(SessionId, PathBuf)>, StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.sessions_dir.clone(),
            source,
        };
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<SessionId>().ok());
            if let Some(id) = id {
                ids.push((id, path));
            }
        }
        ids.sort_by_key(|(id, _)| *id);
        Ok(ids)
    }
}

impl SessionStore for FileSessionStore {
    fn put(&self, session: &Session) -> Result<(), StoreError> {
        let path = self.session_path(session.id);
        let bytes = serde_json::to_vec_pretty(session).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes)
    }

    fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        let path = self.session_path(id);
        match fs::remove_file(&path) {
            Ok(()) => sync_dir(&self.sessions_dir),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn load_all(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        for (_, path) in self.session_ids()? {
            let bytes = fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let session = serde_json::from_slice::<Session>(&bytes)
                .map_err(|source| StoreError::Corrupt { path, source })?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    fn next_id(&self) -> Result<SessionId, StoreError> {
        let from_records = self
            .session_ids()?
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or(0);
        Ok(self.stored_counter()?.max(from_records))
    }

    fn save_next_id(&self, next: SessionId) -> Result<(), StoreError> {
        if next <= self.stored_counter()? {
            return Ok(());
        }
        write_atomic(&self.counter_path(), next.to_string().as_bytes())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    };

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "record".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .map_err(io_err(&temp_path))?;
        file.write_all(bytes).map_err(io_err(&temp_path))?;
        file.sync_all().map_err(io_err(&temp_path))?;
    }

    fs::rename(&temp_path, path).map_err(io_err(path))?;
    match path.parent() {
        Some(parent) => sync_dir(parent),
        None => Ok(()),
    }
}

fn acquire_lock(root: &Path) -> Result<File, StoreError> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(file),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Err(StoreError::Locked {
            path: root.to_path_buf(),
        }),
        Err(source) => Err(StoreError::Io { path, source }),
    }
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })
}
