//! Status snapshots and the YARN ResourceManager REST payloads they come from.
//!
//! [`AppReport`] is what the rest of the crate sees. The `Yarn*` structs mirror
//! the JSON returned by `/ws/v1/cluster/apps` and are converted via
//! [`YarnApp::into_report`].

use serde::{Deserialize, Serialize};

/// Coarse status of an application as far as session tracking cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppStatus {
    /// Accepted by the resource manager but not yet running.
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    /// The resource manager has no record of the application.
    NotFound,
}

impl AppStatus {
    /// Whether the application has exited (or is gone).
    pub fn is_final(self) -> bool {
        matches!(
            self,
            AppStatus::Succeeded | AppStatus::Failed | AppStatus::Killed | AppStatus::NotFound
        )
    }
}

/// One status snapshot of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppReport {
    pub status: AppStatus,
    pub tracking_url: Option<String>,
    pub driver_log_url: Option<String>,
    pub diagnostics: Option<String>,
}

impl AppReport {
    pub fn with_status(status: AppStatus) -> Self {
        Self {
            status,
            tracking_url: None,
            driver_log_url: None,
            diagnostics: None,
        }
    }

    pub fn not_found() -> Self {
        Self::with_status(AppStatus::NotFound)
    }
}

/// Envelope of `GET /ws/v1/cluster/apps/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct YarnAppResponse {
    pub app: YarnApp,
}

/// Envelope of `GET /ws/v1/cluster/apps?...`. YARN sends `"apps": null` when
/// nothing matches.
#[derive(Debug, Clone, Deserialize)]
pub struct YarnAppsResponse {
    pub apps: Option<YarnAppList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YarnAppList {
    #[serde(default)]
    pub app: Vec<YarnApp>,
}

/// The subset of a YARN application report this crate reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YarnApp {
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub final_status: Option<String>,
    #[serde(default)]
    pub tracking_url: Option<String>,
    #[serde(default)]
    pub am_container_logs: Option<String>,
    #[serde(default)]
    pub diagnostics: Option<String>,
}

impl YarnApp {
    /// Map YARN's `state`/`finalStatus` pair onto [`AppStatus`].
    ///
    /// A `FINISHED` application is only a success when its final status says so;
    /// the driver may exit cleanly after the job itself failed.
    pub fn status(&self) -> AppStatus {
        match self.state.as_str() {
            "NEW" | "NEW_SAVING" | "SUBMITTED" | "ACCEPTED" => AppStatus::Pending,
            "RUNNING" => AppStatus::Running,
            "FINISHED" => match self.final_status.as_deref() {
                Some("SUCCEEDED") => AppStatus::Succeeded,
                Some("KILLED") => AppStatus::Killed,
                _ => AppStatus::Failed,
            },
            "FAILED" => AppStatus::Failed,
            "KILLED" => AppStatus::Killed,
            other => {
                tracing::warn!(app_id = %self.id, state = other, "unknown YARN application state");
                AppStatus::Running
            }
        }
    }

    pub fn into_report(self) -> AppReport {
        let status = self.status();
        AppReport {
            status,
            tracking_url: self.tracking_url.filter(|url| !url.is_empty()),
            driver_log_url: self.am_container_logs.filter(|url| !url.is_empty()),
            diagnostics: self.diagnostics.filter(|text| !text.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(state: &str, final_status: Option<&str>) -> YarnApp {
        YarnApp {
            id: "application_1_0001".into(),
            state: state.into(),
            final_status: final_status.map(Into::into),
            tracking_url: None,
            am_container_logs: None,
            diagnostics: None,
        }
    }

    #[test]
    fn yarn_states_map_to_app_status() {
        assert_eq!(app("ACCEPTED", None).status(), AppStatus::Pending);
        assert_eq!(app("SUBMITTED", None).status(), AppStatus::Pending);
        assert_eq!(app("RUNNING", Some("UNDEFINED")).status(), AppStatus::Running);
        assert_eq!(app("FINISHED", Some("SUCCEEDED")).status(), AppStatus::Succeeded);
        assert_eq!(app("FINISHED", Some("FAILED")).status(), AppStatus::Failed);
        assert_eq!(app("FINISHED", Some("KILLED")).status(), AppStatus::Killed);
        assert_eq!(app("FINISHED", None).status(), AppStatus::Failed);
        assert_eq!(app("FAILED", Some("FAILED")).status(), AppStatus::Failed);
        assert_eq!(app("KILLED", Some("KILLED")).status(), AppStatus::Killed);
    }

    #[test]
    fn app_response_deserialize_from_api_format() {
        let json = r#"{
            "app": {
                "id": "application_1700000000000_0042",
                "user": "etl",
                "state": "RUNNING",
                "finalStatus": "UNDEFINED",
                "trackingUrl": "http://rm:8088/proxy/application_1700000000000_0042/",
                "amContainerLogs": "http://nm:8042/node/containerlogs/container_1/etl",
                "diagnostics": ""
            }
        }"#;
        let resp: YarnAppResponse = serde_json::from_str(json).unwrap();
        let report = resp.app.into_report();
        assert_eq!(report.status, AppStatus::Running);
        assert!(report.tracking_url.unwrap().contains("proxy"));
        assert!(report.driver_log_url.unwrap().contains("containerlogs"));
        assert_eq!(report.diagnostics, None);
    }

    #[test]
    fn apps_response_null_list() {
        let resp: YarnAppsResponse = serde_json::from_str(r#"{"apps": null}"#).unwrap();
        assert!(resp.apps.is_none());

        let resp: YarnAppsResponse =
            serde_json::from_str(r#"{"apps": {"app": [{"id": "application_1_0002", "state": "KILLED"}]}}"#)
                .unwrap();
        assert_eq!(resp.apps.unwrap().app[0].id, "application_1_0002");
    }

    #[test]
    fn final_statuses() {
        assert!(!AppStatus::Pending.is_final());
        assert!(!AppStatus::Running.is_final());
        assert!(AppStatus::Succeeded.is_final());
        assert!(AppStatus::NotFound.is_final());
    }
}
