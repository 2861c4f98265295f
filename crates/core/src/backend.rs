use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::graph::GraphDocument;

/// Output keys searched for the produced video, most specific first.
pub const ARTIFACT_OUTPUT_KEYS: [&str; 5] = ["gifs", "videos", "video", "images", "files"];

/// HTTP client for the graph-execution backend.
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct BackendClient {
    base_url: Url,
    client_id: String,
    client: reqwest::Client,
}

/// Error from one submission attempt, tagged with whether trying again could
/// help.
#[derive(Debug)]
pub struct SubmitAttemptError {
    pub retryable: bool,
    pub error: anyhow::Error,
}

impl SubmitAttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryStatus {
    Pending,
    Success,
    Error(String),
}

/// One entry of `GET /history/{id}`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub status: HistoryStatus,
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub filename: String,
    pub subfolder: String,
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    prompt_id: String,
    #[serde(default)]
    node_errors: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHistoryEntry {
    #[serde(default)]
    status: Option<RawHistoryStatus>,
    #[serde(default)]
    outputs: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHistoryStatus {
    #[serde(default)]
    status_str: Option<String>,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    messages: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawQueue {
    #[serde(default)]
    queue_running: Vec<Value>,
    #[serde(default)]
    queue_pending: Vec<Value>,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut raw = config.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .with_context(|| format!("invalid backend base URL: {}", config.base_url))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            client_id: Uuid::new_v4().to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("failed to build backend URL for path: {path}"))
    }

    /// `GET /system_stats`, used as the health probe.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let resp = self
            .client
            .get(self.url("system_stats")?)
            .timeout(timeout)
            .send()
            .await
            .context("failed to reach backend")?;

        if !resp.status().is_success() {
            bail!("backend /system_stats returned HTTP {}", resp.status().as_u16());
        }
        Ok(())
    }

    /// `POST /prompt`. Returns the backend's job id.
    pub async fn submit(&self, graph: &GraphDocument) -> Result<String, SubmitAttemptError> {
        let url = self.url("prompt").map_err(SubmitAttemptError::fatal)?;
        let body = json!({ "prompt": graph, "client_id": self.client_id });

        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                let retryable = is_retryable_reqwest_error(&err);
                let wrapped = anyhow!(err).context("failed to reach backend job intake");
                if retryable {
                    SubmitAttemptError::retryable(wrapped)
                } else {
                    SubmitAttemptError::fatal(wrapped)
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|err| {
            SubmitAttemptError::retryable(anyhow!(err).context("failed to read job intake response"))
        })?;

        if status.is_server_error() {
            return Err(SubmitAttemptError::retryable(anyhow!(
                "backend job intake returned HTTP {}: {}",
                status.as_u16(),
                text.trim()
            )));
        }
        if status == StatusCode::BAD_REQUEST {
            return Err(SubmitAttemptError::fatal(anyhow!(
                "backend rejected the graph: {}",
                rejection_summary(&text)
            )));
        }
        if !status.is_success() {
            return Err(SubmitAttemptError::fatal(anyhow!(
                "backend job intake returned HTTP {}: {}",
                status.as_u16(),
                text.trim()
            )));
        }

        let parsed: SubmitResponse = serde_json::from_str(&text)
            .context("failed to parse job intake response")
            .map_err(SubmitAttemptError::fatal)?;
        if !parsed.node_errors.is_empty() {
            return Err(SubmitAttemptError::fatal(anyhow!(
                "backend rejected the graph: {}",
                node_error_summary(&parsed.node_errors)
            )));
        }
        Ok(parsed.prompt_id)
    }

    /// `GET /history/{id}`. `None` while the backend has no record yet.
    pub async fn history(&self, job_id: &str) -> Result<Option<HistoryRecord>> {
        let resp = self
            .client
            .get(self.url(&format!("history/{job_id}"))?)
            .send()
            .await
            .context("failed to reach backend history")?;

        if !resp.status().is_success() {
            bail!("backend /history returned HTTP {}", resp.status().as_u16());
        }

        let body: Value = resp.json().await.context("failed to parse history response")?;
        body.get(job_id).map(parse_history_entry).transpose()
    }

    /// `GET /queue`.
    pub async fn queue(&self) -> Result<QueueSnapshot> {
        let resp = self
            .client
            .get(self.url("queue")?)
            .send()
            .await
            .context("failed to reach backend queue")?;

        if !resp.status().is_success() {
            bail!("backend /queue returned HTTP {}", resp.status().as_u16());
        }

        let raw: RawQueue = resp.json().await.context("failed to parse queue response")?;
        Ok(QueueSnapshot {
            running: queue_job_ids(&raw.queue_running),
            pending: queue_job_ids(&raw.queue_pending),
        })
    }

    /// `POST /queue {"delete": [id]}`: drops a job that has not started.
    pub async fn delete_queued(&self, job_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url("queue")?)
            .json(&json!({ "delete": [job_id] }))
            .send()
            .await
            .context("failed to reach backend queue")?;

        if !resp.status().is_success() {
            bail!("backend queue delete returned HTTP {}", resp.status().as_u16());
        }
        Ok(())
    }

    /// `POST /interrupt`: stops the job currently executing.
    pub async fn interrupt(&self, job_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url("interrupt")?)
            .json(&json!({ "prompt_id": job_id }))
            .send()
            .await
            .context("failed to reach backend interrupt")?;

        if !resp.status().is_success() {
            bail!("backend /interrupt returned HTTP {}", resp.status().as_u16());
        }
        Ok(())
    }

    /// `GET /view`: downloads an output artifact.
    pub async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.url("view")?)
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .send()
            .await
            .context("failed to reach backend /view")?;

        if !resp.status().is_success() {
            bail!(
                "backend /view returned HTTP {} for {}",
                resp.status().as_u16(),
                artifact.filename
            );
        }

        let bytes = resp.bytes().await.context("failed to read artifact body")?;
        Ok(bytes.to_vec())
    }
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

fn parse_history_entry(entry: &Value) -> Result<HistoryRecord> {
    let raw: RawHistoryEntry =
        serde_json::from_value(entry.clone()).context("malformed history entry")?;
    let status = raw.status.unwrap_or_default();

    let status = match status.status_str.as_deref() {
        Some("error") => HistoryStatus::Error(execution_error_reason(&status.messages)),
        Some("success") => HistoryStatus::Success,
        _ if status.completed || !raw.outputs.is_empty() => HistoryStatus::Success,
        _ => HistoryStatus::Pending,
    };

    Ok(HistoryRecord {
        status,
        outputs: raw.outputs,
    })
}

/// Messages are `[event_name, payload]` pairs; prefer the exception text of
/// an `execution_error` event.
fn execution_error_reason(messages: &[Value]) -> String {
    let execution_error = messages.iter().find_map(|message| {
        let [event, payload] = message.as_array()?.as_slice() else {
            return None;
        };
        if event.as_str()? != "execution_error" {
            return None;
        }
        let text = payload.get("exception_message")?.as_str()?.trim();
        match payload.get("node_type").and_then(Value::as_str) {
            Some(node_type) => Some(format!("{node_type}: {text}")),
            None => Some(text.to_string()),
        }
    });

    execution_error
        .or_else(|| messages.first().map(Value::to_string))
        .unwrap_or_else(|| "backend reported an execution error".to_string())
}

fn rejection_summary(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };

    let message = parsed
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("invalid graph")
        .to_string();
    match parsed.get("node_errors").and_then(Value::as_object) {
        Some(nodes) if !nodes.is_empty() => format!("{message} ({})", node_error_summary(nodes)),
        _ => message,
    }
}

fn node_error_summary(node_errors: &Map<String, Value>) -> String {
    node_errors
        .iter()
        .map(|(node_id, detail)| {
            let first = detail
                .pointer("/errors/0/message")
                .and_then(Value::as_str)
                .unwrap_or("error");
            format!("node {node_id}: {first}")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn queue_job_ids(entries: &[Value]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| entry.get(1)?.as_str().map(str::to_string))
        .collect()
}

/// First video-like artifact in a completed job's outputs.
pub fn find_artifact(outputs: &Map<String, Value>) -> Option<ArtifactRef> {
    ARTIFACT_OUTPUT_KEYS.iter().find_map(|key| {
        outputs
            .values()
            .find_map(|node_output| match node_output.get(*key)? {
                Value::Array(entries) => entries.iter().find_map(artifact_from_entry),
                single => artifact_from_entry(single),
            })
    })
}

fn artifact_from_entry(entry: &Value) -> Option<ArtifactRef> {
    match entry {
        Value::String(filename) if !filename.is_empty() => Some(ArtifactRef {
            filename: filename.clone(),
            subfolder: String::new(),
            kind: "output".to_string(),
        }),
        Value::Object(fields) => {
            let filename = fields.get("filename")?.as_str()?;
            if filename.is_empty() {
                return None;
            }
            Some(ArtifactRef {
                filename: filename.to_string(),
                subfolder: fields
                    .get("subfolder")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                kind: fields
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("output")
                    .to_string(),
            })
        }
        _ => None,
    }
}
