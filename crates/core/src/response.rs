//! Response assembly: turns a terminal job result into the caller-visible
//! success or error envelope.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{ArtifactRef, BackendClient};
use crate::binder::{BoundGraph, EffectiveParams};
use crate::codec::encode_output;
use crate::error::HandlerError;
use crate::lifecycle::{CompletedJob, JobResult};
use crate::templates::Mode;

pub const VIDEO_EXTENSIONS: [&str; 5] = ["mp4", "webm", "gif", "avi", "mov"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub video: String,
    pub seed: u64,
    /// Present only for custom-audio requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    pub parameters: EffectiveParams,
    pub elapsed_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub error: &'static str,
    pub message: String,
    pub elapsed_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip)]
    cause: HandlerError,
}

impl ErrorEnvelope {
    pub fn new(cause: HandlerError, job_id: Option<String>, started: Instant) -> Self {
        Self {
            error: cause.kind(),
            message: cause.to_string(),
            elapsed_time: elapsed_secs(started),
            job_id,
            cause,
        }
    }

    pub fn cause(&self) -> &HandlerError {
        &self.cause
    }
}

pub type HandlerReply = Result<ResponseEnvelope, ErrorEnvelope>;

/// Seconds since `started`, rounded to hundredths.
pub fn elapsed_secs(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    backend: BackendClient,
    output_dir: PathBuf,
}

impl ResponseAssembler {
    pub fn new(backend: BackendClient, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            output_dir: output_dir.into(),
        }
    }

    pub async fn assemble(&self, result: JobResult, bound: &BoundGraph, started: Instant) -> HandlerReply {
        let elapsed_time = elapsed_secs(started);

        let job = match result {
            JobResult::Completed(job) => job,
            JobResult::Failed { job_id, reason } => {
                return Err(ErrorEnvelope::new(HandlerError::JobFailed(reason), job_id, started));
            }
            JobResult::Unreachable { reason } => {
                return Err(ErrorEnvelope::new(
                    HandlerError::BackendUnreachable(reason),
                    None,
                    started,
                ));
            }
            JobResult::TimedOut { job_id } => {
                let timeout_secs = bound.params().timeout;
                return Err(ErrorEnvelope::new(
                    HandlerError::JobTimedOut { timeout_secs },
                    job_id,
                    started,
                ));
            }
            JobResult::Cancelled { job_id } => {
                return Err(ErrorEnvelope::new(
                    HandlerError::JobCancelled("request cancelled before the job finished".into()),
                    job_id,
                    started,
                ));
            }
        };

        let bytes = self
            .read_artifact(&job, bound.output_prefix())
            .await
            .map_err(|err| ErrorEnvelope::new(err, Some(job.job_id.clone()), started))?;

        info!(
            job_id = %job.job_id,
            size = bytes.len(),
            elapsed_time,
            "Assembled video response"
        );

        let custom = bound.mode() == Mode::CustomAudio;
        Ok(ResponseEnvelope {
            video: encode_output(&bytes),
            seed: bound.seed(),
            mode: custom.then_some(Mode::CustomAudio),
            audio_duration: if custom { bound.audio_duration_secs() } else { None },
            parameters: bound.params().clone(),
            elapsed_time,
        })
    }

    async fn read_artifact(&self, job: &CompletedJob, output_prefix: &str) -> Result<Vec<u8>, HandlerError> {
        let mut view_error = None;
        if let Some(artifact) = &job.artifact {
            if let Some(path) = self.local_artifact_path(artifact) {
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    debug!(path = %path.display(), "Reading artifact from output directory");
                    return read_local(&path).await;
                }
            }

            match self.backend.view(artifact).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    warn!(
                        job_id = %job.job_id,
                        error = %format!("{err:#}"),
                        "Artifact download failed, scanning output directory"
                    );
                    view_error = Some(format!(
                        "output {} could not be retrieved: {err:#}",
                        artifact.filename
                    ));
                }
            }
        }

        match find_prefixed_video(&self.output_dir, output_prefix).await {
            Some(path) => {
                debug!(path = %path.display(), "Using artifact found by output prefix");
                read_local(&path).await
            }
            None => Err(HandlerError::JobFailed(
                view_error.unwrap_or_else(|| "no video output generated".to_string()),
            )),
        }
    }

    /// Location of an `output`-type artifact on the shared volume. Names
    /// that would escape the output directory are ignored.
    fn local_artifact_path(&self, artifact: &ArtifactRef) -> Option<PathBuf> {
        if artifact.kind != "output" {
            return None;
        }
        let relative = Path::new(&artifact.subfolder).join(&artifact.filename);
        let confined = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        confined.then(|| self.output_dir.join(relative))
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, HandlerError> {
    tokio::fs::read(path)
        .await
        .map_err(|err| HandlerError::Internal(format!("failed to read {}: {err}", path.display())))
}

/// Newest-named video under `output_dir` whose path starts with `prefix`
/// (for example `ltxgate/<request-id>`).
pub async fn find_prefixed_video(output_dir: &Path, prefix: &str) -> Option<PathBuf> {
    let prefix_path = Path::new(prefix);
    let name_prefix = prefix_path.file_name()?.to_str()?.to_string();
    let dir = match prefix_path.parent() {
        Some(parent) => output_dir.join(parent),
        None => output_dir.to_path_buf(),
    };

    let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let is_video = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if is_video && name.starts_with(&name_prefix) {
            candidates.push(path);
        }
    }

    candidates.sort();
    candidates.pop()
}
