use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;

use super::AppStatusAdapter;
use super::error::AdapterError;
use super::types::{AppReport, YarnAppResponse, YarnAppsResponse};

const APPS_PATH: &str = "ws/v1/cluster/apps";

/// [`AppStatusAdapter`] backed by the YARN ResourceManager REST API.
pub struct YarnClient {
    client: Client,
    base_url: String,
}

impl YarnClient {
    /// Create a client for the ResourceManager at `base_url`
    /// (e.g. `http://rm.example.com:8088`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    fn app_url(&self, app_id: &str) -> String {
        format!("{}/{APPS_PATH}/{app_id}", self.base_url)
    }

    async fn api_error(response: reqwest::Response) -> AdapterError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        AdapterError::Api { status, message }
    }
}

#[async_trait]
impl AppStatusAdapter for YarnClient {
    async fn query(&self, app_id: &str) -> Result<AppReport, AdapterError> {
        let response = self.client.get(self.app_url(app_id)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(AppReport::not_found());
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let body = response.json::<YarnAppResponse>().await?;
        Ok(body.app.into_report())
    }

    async fn fetch_log(&self, app_id: &str, max_lines: usize) -> Result<Vec<String>, AdapterError> {
        let report = self.query(app_id).await?;
        let Some(diagnostics) = report.diagnostics else {
            return Ok(Vec::new());
        };
        let lines: Vec<String> = diagnostics
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines.into_iter().skip(skip).collect())
    }

    async fn terminate(&self, app_id: &str) -> Result<(), AdapterError> {
        let response = self
            .client
            .put(format!("{}/state", self.app_url(app_id)))
            .json(&json!({ "state": "KILLED" }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    async fn find_by_tag(&self, tag: &str) -> Result<Option<String>, AdapterError> {
        let response = self
            .client
            .get(format!("{}/{APPS_PATH}", self.base_url))
            .query(&[("applicationTags", tag)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let body = response.json::<YarnAppsResponse>().await?;
        Ok(body
            .apps
            .and_then(|list| list.app.into_iter().next())
            .map(|app| app.id))
    }
}
