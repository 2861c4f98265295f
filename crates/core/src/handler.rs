use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio::time::timeout_at;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::binder::{bind, BindInputs, BoundGraph, StagedAudio};
use crate::codec::{audio_duration_secs, audio_extension, decode_input, image_extension, StagedInputs};
use crate::config::{AppConfig, JobsConfig};
use crate::error::HandlerError;
use crate::lifecycle::{deadline_after, JobLifecycle};
use crate::readiness::BackendReady;
use crate::request::{mode_for_input, JobRequest, RequestVariant};
use crate::response::{ErrorEnvelope, HandlerReply, ResponseAssembler};
use crate::templates::{GraphTemplate, TemplateStore};

/// Handles one request end to end. Holds no per-request state, so a single
/// instance serves concurrent requests.
#[derive(Debug, Clone)]
pub struct Handler {
    templates: Arc<TemplateStore>,
    lifecycle: JobLifecycle,
    assembler: ResponseAssembler,
    input_dir: PathBuf,
    ffprobe: PathBuf,
    jobs: JobsConfig,
}

struct PreparedJob {
    bound: BoundGraph,
    staged: StagedInputs,
}

impl Handler {
    /// Requires proof that the readiness gate passed.
    pub fn new(ready: BackendReady, config: &AppConfig, templates: Arc<TemplateStore>) -> Self {
        let backend = ready.into_backend();
        Self {
            templates,
            lifecycle: JobLifecycle::new(backend.clone(), config.jobs.clone()),
            assembler: ResponseAssembler::new(backend, config.backend.output_dir.clone()),
            input_dir: config.backend.input_dir.clone(),
            ffprobe: config.paths.ffprobe.clone(),
            jobs: config.jobs.clone(),
        }
    }

    /// `caller_id` is only used for log correlation.
    pub async fn handle(
        &self,
        input: &Value,
        caller_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> HandlerReply {
        let request_id = Uuid::new_v4().simple().to_string();
        let span = info_span!(
            "request",
            request_id = %request_id,
            caller_id = caller_id.unwrap_or("-")
        );
        self.handle_inner(&request_id, input, cancel)
            .instrument(span)
            .await
    }

    async fn handle_inner(
        &self,
        request_id: &str,
        input: &Value,
        cancel: &CancellationToken,
    ) -> HandlerReply {
        let started = Instant::now();

        let (template, request) = match self.parse(input) {
            Ok(parsed) => parsed,
            Err(err) => return Err(reject(err, started)),
        };

        // The budget covers staging and audio measurement as well as the job.
        let deadline = deadline_after(Duration::from_secs(request.timeout_secs));
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HandlerError::JobCancelled(
                "request cancelled while staging inputs".into(),
            )),
            prepared = timeout_at(deadline, self.prepare(request_id, template, &request)) => {
                prepared.unwrap_or(Err(HandlerError::JobTimedOut {
                    timeout_secs: request.timeout_secs,
                }))
            }
        };
        let PreparedJob { bound, staged } = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return Err(reject(err, started)),
        };

        info!(
            mode = %bound.mode(),
            seed = bound.seed(),
            frame_count = bound.params().frame_count,
            timeout_secs = bound.params().timeout,
            "Request bound"
        );

        let result = self.lifecycle.submit_and_await(&bound, deadline, cancel).await;
        let reply = self.assembler.assemble(result, &bound, started).await;
        drop(staged);

        match &reply {
            Ok(response) => info!(elapsed_time = response.elapsed_time, "Request succeeded"),
            Err(envelope) => warn!(
                kind = envelope.error,
                job_id = envelope.job_id.as_deref().unwrap_or("-"),
                message = %envelope.message,
                "Request failed"
            ),
        }
        reply
    }

    fn parse(&self, input: &Value) -> Result<(&GraphTemplate, JobRequest), HandlerError> {
        let mode = mode_for_input(input)?;
        let template = self.templates.get(mode);
        let request = JobRequest::parse(input, template.defaults(), &self.jobs)?;
        Ok((template, request))
    }

    /// Decoding, staging, audio measurement and binding. Nothing here talks
    /// to the backend. Dropping the future removes whatever was staged.
    async fn prepare(
        &self,
        request_id: &str,
        template: &GraphTemplate,
        request: &JobRequest,
    ) -> Result<PreparedJob, HandlerError> {
        let image = decode_input("image", &request.image)?;
        let audio = match &request.variant {
            RequestVariant::CustomAudio { audio, .. } => Some(decode_input("audio", audio)?),
            RequestVariant::GeneratedAudio { .. } => None,
        };

        let mut staged = StagedInputs::new(&self.input_dir, request_id);
        let image_file = staged.stage("image", image_extension(&image), &image).await?;

        let staged_audio = match audio {
            Some(bytes) => {
                let file = staged.stage("audio", audio_extension(&bytes), &bytes).await?;
                let duration_secs = audio_duration_secs(&bytes, &file.path, &self.ffprobe).await?;
                Some(StagedAudio {
                    file_name: file.file_name,
                    duration_secs,
                })
            }
            None => None,
        };

        let bound = bind(
            template,
            request,
            &BindInputs {
                image_file: image_file.file_name,
                audio: staged_audio,
                output_prefix: format!("ltxgate/{request_id}"),
            },
        )?;

        Ok(PreparedJob { bound, staged })
    }
}

fn reject(err: HandlerError, started: Instant) -> ErrorEnvelope {
    if err.is_local() {
        warn!(kind = err.kind(), error = %err, "Request rejected before submission");
    } else {
        error!(kind = err.kind(), error = %err, "Request aborted before submission");
    }
    ErrorEnvelope::new(err, None, started)
}
