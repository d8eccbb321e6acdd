//! Submission of batches to the cluster.
//!
//! The only production launcher shells out to `spark-submit` with
//! `spark.yarn.submit.waitAppCompletion=false`, so the process returns as soon
//! as YARN has accepted the application, and scrapes the application id from
//! its output.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;

use crate::state_machine::SubmissionSpec;

static APP_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"application_\d+_\d+").expect("invalid application id pattern"));

/// Output of a successful launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    pub app_id: String,
    pub log_lines: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("submit command exited with {status}: {tail}")]
    Exited { status: String, tail: String },

    #[error("no application id in submit output: {tail}")]
    NoApplicationId { tail: String },
}

/// Submits a batch and reports the resource manager's application id.
///
/// Not retried by callers; a failed launch leaves the session in `error`.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &SubmissionSpec, app_tag: &str) -> Result<Launched, LaunchError>;
}

pub struct SparkSubmitLauncher {
    command: PathBuf,
    leading_args: Vec<String>,
    master: String,
    deploy_mode: String,
}

impl SparkSubmitLauncher {
    pub fn new(command: impl Into<PathBuf>, master: impl Into<String>, deploy_mode: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            leading_args: Vec::new(),
            master: master.into(),
            deploy_mode: deploy_mode.into(),
        }
    }

    /// Arguments placed before the generated ones, for wrappers such as
    /// `sudo -u etl spark-submit`.
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    /// Full argument list passed to the submit command.
    pub fn build_args(&self, spec: &SubmissionSpec, app_tag: &str) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend([
            "--master".to_string(),
            self.master.clone(),
            "--deploy-mode".to_string(),
            self.deploy_mode.clone(),
        ]);
        if let Some(name) = &spec.name {
            args.push("--name".into());
            args.push(name.clone());
        }

        let mut push_conf = |key: &str, value: &str| {
            args.push("--conf".into());
            args.push(format!("{key}={value}"));
        };
        for (key, value) in &spec.conf {
            if key == "spark.yarn.tags" || key == "spark.yarn.submit.waitAppCompletion" {
                continue;
            }
            push_conf(key, value);
        }
        let tags = match spec.conf.get("spark.yarn.tags") {
            Some(user_tags) if !user_tags.is_empty() => format!("{user_tags},{app_tag}"),
            _ => app_tag.to_string(),
        };
        push_conf("spark.yarn.tags", &tags);
        push_conf("spark.yarn.submit.waitAppCompletion", "false");

        args.extend(spec.target.submit_args());
        args.extend(spec.args.iter().cloned());
        args
    }
}

#[async_trait]
impl Launcher for SparkSubmitLauncher {
    async fn launch(&self, spec: &SubmissionSpec, app_tag: &str) -> Result<Launched, LaunchError> {
        let args = self.build_args(spec, app_tag);
        tracing::debug!(command = %self.command.display(), ?args, "launching batch");

        let output = Command::new(&self.command)
            .args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| LaunchError::Spawn {
                command: self.command.display().to_string(),
                source,
            })?;

        let log_lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(str::to_string)
            .collect();

        if !output.status.success() {
            return Err(LaunchError::Exited {
                status: output.status.to_string(),
                tail: tail_of(&log_lines),
            });
        }

        let app_id = log_lines
            .iter()
            .find_map(|line| extract_app_id(line))
            .ok_or_else(|| LaunchError::NoApplicationId {
                tail: tail_of(&log_lines),
            })?;

        Ok(Launched { app_id, log_lines })
    }
}

/// First YARN application id mentioned in `line`.
pub fn extract_app_id(line: &str) -> Option<String> {
    APP_ID_PATTERN.find(line).map(|m| m.as_str().to_string())
}

fn tail_of(lines: &[String]) -> String {
    let skip = lines.len().saturating_sub(5);
    lines[skip..].join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::LaunchTarget;

    fn jar_spec() -> SubmissionSpec {
        let mut spec = SubmissionSpec::new(LaunchTarget::Jar {
            jar: "hdfs:///jobs/etl.jar".into(),
            main_class: "com.example.Etl".into(),
        });
        spec.args = vec!["2026-10-01".into()];
        spec.name = Some("nightly-etl".into());
        spec
    }

    // Runs the script through `sh` so it is never exec'd while still open.
    fn fake_submit(dir: &tempfile::TempDir, body: &str) -> SparkSubmitLauncher {
        let path = dir.path().join("fake-submit.sh");
        std::fs::write(&path, format!("{body}\n")).unwrap();
        SparkSubmitLauncher::new("/bin/sh", "yarn", "cluster")
            .with_leading_args(vec![path.display().to_string()])
    }

    #[test]
    fn extracts_application_id() {
        let line = "INFO Client: Submitted application application_1700000000000_0042";
        assert_eq!(
            extract_app_id(line).as_deref(),
            Some("application_1700000000000_0042")
        );
        assert_eq!(extract_app_id("no id here"), None);
    }

    #[test]
    fn build_args_orders_options_before_target() {
        let launcher = SparkSubmitLauncher::new("spark-submit", "yarn", "cluster");
        let mut spec = jar_spec();
        spec.conf.insert("spark.executor.memory".into(), "4g".into());
        let args = launcher.build_args(&spec, "batchkeeper-0-abcd1234");
        assert_eq!(
            args,
            vec![
                "--master",
                "yarn",
                "--deploy-mode",
                "cluster",
                "--name",
                "nightly-etl",
                "--conf",
                "spark.executor.memory=4g",
                "--conf",
                "spark.yarn.tags=batchkeeper-0-abcd1234",
                "--conf",
                "spark.yarn.submit.waitAppCompletion=false",
                "--class",
                "com.example.Etl",
                "hdfs:///jobs/etl.jar",
                "2026-10-01",
            ]
        );
    }

    #[test]
    fn build_args_merges_user_tags() {
        let launcher = SparkSubmitLauncher::new("spark-submit", "yarn", "cluster");
        let mut spec = jar_spec();
        spec.conf.insert("spark.yarn.tags".into(), "team-data".into());
        spec.conf
            .insert("spark.yarn.submit.waitAppCompletion".into(), "true".into());
        let args = launcher.build_args(&spec, "batchkeeper-1-abcd1234");
        assert!(args.contains(&"spark.yarn.tags=team-data,batchkeeper-1-abcd1234".to_string()));
        assert!(args.contains(&"spark.yarn.submit.waitAppCompletion=false".to_string()));
        assert!(!args.contains(&"spark.yarn.submit.waitAppCompletion=true".to_string()));
    }

    #[tokio::test]
    async fn launch_reads_app_id_from_output() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = fake_submit(
            &dir,
            "echo 'INFO Client: Requesting a new application'\n\
             echo 'INFO Client: Submitted application application_1700000000000_0007' >&2",
        );

        let launched = launcher.launch(&jar_spec(), "tag").await.unwrap();
        assert_eq!(launched.app_id, "application_1700000000000_0007");
        assert_eq!(launched.log_lines.len(), 2);
    }

    #[tokio::test]
    async fn launch_passes_environment() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = fake_submit(
            &dir,
            "echo \"tz=$TZ application_1_0001\""
        );
        let mut spec = jar_spec();
        spec.env.insert("TZ".into(), "America/Sao_Paulo".into());

        let launched = launcher.launch(&spec, "tag").await.unwrap();
        assert_eq!(launched.log_lines, vec!["tz=America/Sao_Paulo application_1_0001"]);
    }

    #[tokio::test]
    async fn launch_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = fake_submit(
            &dir,
            "echo 'Exception: jar not found' >&2\nexit 1"
        );

        let err = launcher.launch(&jar_spec(), "tag").await.unwrap_err();
        match err {
            LaunchError::Exited { tail, .. } => assert!(tail.contains("jar not found")),
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn launch_without_app_id_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = fake_submit(
            &dir,
            "echo 'nothing useful'"
        );

        let err = launcher.launch(&jar_spec(), "tag").await.unwrap_err();
        assert!(matches!(err, LaunchError::NoApplicationId { .. }));
    }

    #[tokio::test]
    async fn launch_missing_command_is_spawn_error() {
        let launcher = SparkSubmitLauncher::new("/nonexistent/spark-submit", "yarn", "cluster");
        let err = launcher.launch(&jar_spec(), "tag").await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
