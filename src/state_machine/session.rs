use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::SessionState;

/// Locally assigned, strictly increasing session identifier.
pub type SessionId = u64;

/// What kind of artifact a batch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LaunchTarget {
    /// A compiled JVM artifact with an explicit entry class.
    #[serde(rename_all = "camelCase")]
    Jar { jar: String, main_class: String },
    /// A Python script plus its dependency archives.
    #[serde(rename_all = "camelCase")]
    PySpark {
        script: String,
        #[serde(default)]
        py_files: Vec<String>,
    },
}

impl LaunchTarget {
    /// `spark-submit` arguments that select this target's entry point.
    pub fn submit_args(&self) -> Vec<String> {
        match self {
            LaunchTarget::Jar { jar, main_class } => {
                vec!["--class".into(), main_class.clone(), jar.clone()]
            }
            LaunchTarget::PySpark { script, py_files } => {
                let mut args = Vec::new();
                if !py_files.is_empty() {
                    args.push("--py-files".into());
                    args.push(py_files.join(","));
                }
                args.push(script.clone());
                args
            }
        }
    }
}

/// Immutable launch parameters of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionSpec {
    pub target: LaunchTarget,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub conf: BTreeMap<String, String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl SubmissionSpec {
    pub fn new(target: LaunchTarget) -> Self {
        Self {
            target,
            args: Vec::new(),
            env: BTreeMap::new(),
            conf: BTreeMap::new(),
            name: None,
        }
    }
}

/// Bounded window of the most recent log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTail {
    capacity: usize,
    lines: VecDeque<String>,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        self.trim();
    }

    /// Change the bound, dropping the oldest lines that no longer fit.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.trim();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn trim(&mut self) {
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    pub fn extend<I>(&mut self, lines: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for line in lines {
            self.push(line);
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Local tracking record for one submitted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    /// Resource manager application id; set once the launch completes.
    pub app_id: Option<String>,
    /// Tag attached to the application so it can be found without its id.
    pub app_tag: String,
    pub state: SessionState,
    pub state_history: Vec<SessionState>,
    pub spec: SubmissionSpec,
    pub log_tail: LogTail,
    pub driver_log_url: Option<String>,
    pub tracking_url: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: SessionId, spec: SubmissionSpec, log_tail_lines: usize) -> Self {
        let now = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id,
            app_id: None,
            app_tag: format!("batchkeeper-{id}-{}", &suffix[..8]),
            state: SessionState::Starting,
            state_history: Vec::new(),
            spec,
            log_tail: LogTail::new(log_tail_lines),
            driver_log_url: None,
            tracking_url: None,
            deleted: false,
            created_at: now,
            updated_at: now,
            ended_at: None,
        }
    }
}
