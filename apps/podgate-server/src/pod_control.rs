use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use utoipa::ToSchema;

use crate::config::PodConfig;
use crate::http_client;

#[derive(Debug, thiserror::Error)]
pub enum PodControlError {
    #[error("missing {0}")]
    MissingCredentials(&'static str),
    #[error("pod api request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("pod api returned {status}: {detail}")]
    Remote { status: u16, detail: String },
    #[error("pod api error: {0}")]
    GraphQl(String),
    #[error("pod api response malformed: {0}")]
    Decode(String),
    #[error("pod {0} not found")]
    NotFound(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub id: String,
    #[serde(default)]
    pub desired_status: Option<String>,
    #[serde(default)]
    pub runtime: Option<PodRuntime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodRuntime {
    #[serde(default)]
    pub uptime_in_seconds: Option<u64>,
    #[serde(default)]
    pub ports: Option<Vec<PodPort>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPort {
    pub private_port: Option<u32>,
    pub public_port: Option<u32>,
    pub ip: Option<String>,
}

impl PodInfo {
    /// A reported desired status other than `RUNNING` asks for a start. No
    /// reported status means nothing is known and nothing is started.
    pub fn needs_start(&self) -> bool {
        matches!(self.desired_status.as_deref(), Some(s) if s != "RUNNING")
    }
}

/// Remote compute-instance control.
#[async_trait]
pub trait PodControl: Send + Sync {
    async fn describe(&self) -> Result<PodInfo, PodControlError>;
    async fn start(&self) -> Result<(), PodControlError>;
    async fn stop(&self) -> Result<(), PodControlError>;
}

const POD_QUERY: &str = r#"
query Pod($id: String!) {
  pod(input: { podId: $id }) {
    id
    desiredStatus
    runtime {
      uptimeInSeconds
      ports { privatePort publicPort ip }
    }
  }
}"#;

const POD_RESUME: &str = r#"
mutation Start($id: String!) {
  podResume(input: { podId: $id }) { id }
}"#;

const POD_STOP: &str = r#"
mutation Stop($id: String!) {
  podStop(input: { podId: $id }) { id }
}"#;

/// GraphQL client for a RunPod-style pod API.
pub struct RunpodClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    pod_id: Option<String>,
}

impl RunpodClient {
    pub fn new(cfg: &PodConfig, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            http: http_client::client_with_timeout(timeout)?,
            api_base: cfg.api_base.clone(),
            api_key: cfg.api_key.clone(),
            pod_id: cfg.pod_id.clone(),
        })
    }

    fn pod_id(&self) -> Result<&str, PodControlError> {
        self.pod_id
            .as_deref()
            .ok_or(PodControlError::MissingCredentials("RUNPOD_POD_ID"))
    }

    async fn request(&self, query: &str, pod_id: &str) -> Result<Value, PodControlError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(PodControlError::MissingCredentials("RUNPOD_API_KEY"))?;
        let resp = self
            .http
            .post(&self.api_base)
            .bearer_auth(key)
            .json(&json!({"query": query, "variables": {"id": pod_id}}))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|v| v.get("errors"))
                .map(|e| e.to_string())
                .unwrap_or(body);
            return Err(PodControlError::Remote {
                status: status.as_u16(),
                detail,
            });
        }
        let mut doc = parsed.ok_or_else(|| PodControlError::Decode("body is not json".into()))?;
        match doc.get("errors") {
            Some(errors) if !errors.is_null() => {
                return Err(PodControlError::GraphQl(errors.to_string()))
            }
            _ => {}
        }
        Ok(doc.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PodControl for RunpodClient {
    async fn describe(&self) -> Result<PodInfo, PodControlError> {
        let pod_id = self.pod_id()?;
        let mut data = self.request(POD_QUERY, pod_id).await?;
        let pod = data.get_mut("pod").map(Value::take).unwrap_or(Value::Null);
        if pod.is_null() {
            return Err(PodControlError::NotFound(pod_id.to_string()));
        }
        serde_json::from_value(pod).map_err(|err| PodControlError::Decode(err.to_string()))
    }

    async fn start(&self) -> Result<(), PodControlError> {
        let pod_id = self.pod_id()?;
        self.request(POD_RESUME, pod_id).await?;
        debug!(target: "podgate::pod", pod_id, "podResume accepted");
        Ok(())
    }

    async fn stop(&self) -> Result<(), PodControlError> {
        let pod_id = self.pod_id()?;
        self.request(POD_STOP, pod_id).await?;
        debug!(target: "podgate::pod", pod_id, "podStop accepted");
        Ok(())
    }
}
