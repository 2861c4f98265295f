//! Job lifecycle: submit a bound graph, follow it through the backend queue,
//! and stop at the first terminal state or at the deadline.

use std::fmt;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{find_artifact, ArtifactRef, BackendClient, HistoryStatus};
use crate::binder::BoundGraph;
use crate::config::JobsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitting,
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Submitting => "submitting",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    pub job_id: String,
    /// `None` when the record names no artifact; the output directory is
    /// then scanned by prefix.
    pub artifact: Option<ArtifactRef>,
}

/// Terminal outcome of one submission. Produced exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Completed(CompletedJob),
    Failed {
        job_id: Option<String>,
        reason: String,
    },
    /// Submission never reached the backend within the retry budget.
    Unreachable { reason: String },
    TimedOut { job_id: Option<String> },
    Cancelled { job_id: Option<String> },
}

impl JobResult {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobResult::Completed(job) => Some(job.job_id.as_str()),
            JobResult::Failed { job_id, .. }
            | JobResult::TimedOut { job_id }
            | JobResult::Cancelled { job_id } => job_id.as_deref(),
            JobResult::Unreachable { .. } => None,
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            JobResult::Completed(_) => JobState::Completed,
            JobResult::Failed { .. } | JobResult::Unreachable { .. } => JobState::Failed,
            JobResult::TimedOut { .. } => JobState::TimedOut,
            JobResult::Cancelled { .. } => JobState::Cancelled,
        }
    }
}

enum SubmitFailure {
    Rejected(String),
    Unreachable(String),
}

#[derive(Debug, Clone)]
pub struct JobLifecycle {
    backend: BackendClient,
    config: JobsConfig,
}

impl JobLifecycle {
    pub fn new(backend: BackendClient, config: JobsConfig) -> Self {
        Self { backend, config }
    }

    /// Submits `bound` and waits for a terminal state. `deadline` is the
    /// request's wall-clock budget, fixed when the request arrived; on
    /// timeout or cancellation the backend job is cancelled in the background.
    pub async fn submit_and_await(
        &self,
        bound: &BoundGraph,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> JobResult {
        let started = Instant::now();

        debug!(mode = %bound.mode(), nodes = bound.graph().len(), state = %JobState::Submitting, "Submitting job");
        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return JobResult::Cancelled { job_id: None },
            _ = sleep_until(deadline) => return JobResult::TimedOut { job_id: None },
            submitted = self.submit_with_retry(bound) => submitted,
        };

        let job_id = match submitted {
            Ok(job_id) => job_id,
            Err(SubmitFailure::Rejected(reason)) => {
                return JobResult::Failed {
                    job_id: None,
                    reason,
                }
            }
            Err(SubmitFailure::Unreachable(reason)) => return JobResult::Unreachable { reason },
        };
        info!(job_id = %job_id, mode = %bound.mode(), seed = bound.seed(), "Job submitted");

        let mut guard = CancelOnDrop::new(self.backend.clone(), job_id.clone(), self.config.cancel_timeout());

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => JobResult::Cancelled { job_id: Some(job_id.clone()) },
            _ = sleep_until(deadline) => JobResult::TimedOut { job_id: Some(job_id.clone()) },
            result = self.poll_until_terminal(&job_id, started) => result,
        };

        match result.state() {
            JobState::Completed | JobState::Failed => guard.disarm(),
            state => warn!(
                job_id = %job_id,
                %state,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job did not finish; requesting backend cancellation"
            ),
        }

        result
    }

    async fn submit_with_retry(&self, bound: &BoundGraph) -> Result<String, SubmitFailure> {
        let max_attempts = self.config.submit_max_retries.saturating_add(1);

        for attempt in 1..=max_attempts {
            match self.backend.submit(bound.graph()).await {
                Ok(job_id) => return Ok(job_id),
                Err(attempt_error) if !attempt_error.retryable => {
                    return Err(SubmitFailure::Rejected(format!("{:#}", attempt_error.error)));
                }
                Err(attempt_error) if attempt < max_attempts => {
                    let delay = retry_delay(self.config.submit_backoff(), attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{:#}", attempt_error.error),
                        "Job submission failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(attempt_error) => {
                    return Err(SubmitFailure::Unreachable(format!(
                        "{:#} (after {max_attempts} attempts)",
                        attempt_error.error
                    )));
                }
            }
        }

        Err(SubmitFailure::Unreachable("no submission attempted".to_string()))
    }

    async fn poll_until_terminal(&self, job_id: &str, started: Instant) -> JobResult {
        let mut state = JobState::Queued;
        let mut last_progress_log = Instant::now();
        let mut failed_polls: u32 = 0;

        loop {
            match self.backend.history(job_id).await {
                Ok(Some(record)) => match record.status {
                    HistoryStatus::Success => {
                        info!(
                            job_id,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Job completed"
                        );
                        return JobResult::Completed(CompletedJob {
                            job_id: job_id.to_string(),
                            artifact: find_artifact(&record.outputs),
                        });
                    }
                    HistoryStatus::Error(reason) => {
                        warn!(job_id, reason = %reason, "Backend reported job failure");
                        return JobResult::Failed {
                            job_id: Some(job_id.to_string()),
                            reason,
                        };
                    }
                    HistoryStatus::Pending => {
                        failed_polls = 0;
                        state = JobState::Running;
                    }
                },
                Ok(None) => {
                    failed_polls = 0;
                    if state == JobState::Queued {
                        state = self.queue_state(job_id).await.unwrap_or(state);
                    }
                }
                Err(err) => {
                    failed_polls += 1;
                    debug!(job_id, failed_polls, error = %format!("{err:#}"), "Status poll failed");
                }
            }

            if last_progress_log.elapsed() >= self.config.progress_log_interval() {
                info!(
                    job_id,
                    %state,
                    elapsed_secs = started.elapsed().as_secs(),
                    failed_polls,
                    "Job still in progress"
                );
                last_progress_log = Instant::now();
            }

            sleep(self.config.poll_interval()).await;
        }
    }

    async fn queue_state(&self, job_id: &str) -> Option<JobState> {
        match self.backend.queue().await {
            Ok(queue) if queue.running.iter().any(|id| id == job_id) => {
                debug!(job_id, "Job is running");
                Some(JobState::Running)
            }
            Ok(_) => Some(JobState::Queued),
            Err(err) => {
                debug!(job_id, error = %format!("{err:#}"), "Queue poll failed");
                None
            }
        }
    }
}

/// Deadline `timeout` from now. Budgets too large to represent are capped at
/// one year.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

/// Linear backoff: `attempt` × `backoff`, saturating.
fn retry_delay(backoff: Duration, attempt: u32) -> Duration {
    backoff.saturating_mul(attempt)
}

/// Requests backend cancellation for a job unless disarmed first. Fires on
/// timeout, on cancellation, and when the awaiting future itself is dropped.
struct CancelOnDrop {
    backend: BackendClient,
    job_id: String,
    timeout: Duration,
    armed: bool,
}

impl CancelOnDrop {
    fn new(backend: BackendClient, job_id: String, timeout: Duration) -> Self {
        Self {
            backend,
            job_id,
            timeout,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(job_id = %self.job_id, "No runtime available to cancel backend job");
            return;
        };

        let backend = self.backend.clone();
        let job_id = std::mem::take(&mut self.job_id);
        let timeout = self.timeout;
        handle.spawn(async move {
            match tokio::time::timeout(timeout, cancel_backend_job(&backend, &job_id)).await {
                Ok(Ok(())) => info!(job_id = %job_id, "Backend job cancelled"),
                Ok(Err(err)) => warn!(job_id = %job_id, error = %format!("{err:#}"), "Backend job cancellation failed"),
                Err(_) => warn!(job_id = %job_id, "Backend job cancellation timed out"),
            }
        });
    }
}

/// Drops the job from the pending queue, and interrupts it if it is the one
/// currently executing.
pub async fn cancel_backend_job(backend: &BackendClient, job_id: &str) -> anyhow::Result<()> {
    let queue = backend.queue().await?;
    if queue.running.iter().any(|id| id == job_id) {
        backend.interrupt(job_id).await?;
    }
    if queue.pending.iter().any(|id| id == job_id) {
        backend.delete_queued(job_id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_result_accessors() {
        let completed = JobResult::Completed(CompletedJob {
            job_id: "a".to_string(),
            artifact: None,
        });
        assert_eq!(completed.job_id(), Some("a"));
        assert_eq!(completed.state(), JobState::Completed);

        let unreachable = JobResult::Unreachable {
            reason: "refused".to_string(),
        };
        assert_eq!(unreachable.job_id(), None);
        assert_eq!(unreachable.state(), JobState::Failed);

        let timed_out = JobResult::TimedOut {
            job_id: Some("b".to_string()),
        };
        assert_eq!(timed_out.job_id(), Some("b"));
        assert_eq!(timed_out.state().to_string(), "timed_out");
    }

    #[test]
    fn huge_budgets_do_not_overflow() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(60 * 60));

        assert_eq!(
            retry_delay(Duration::from_millis(500), 3),
            Duration::from_millis(1_500)
        );
        assert_eq!(retry_delay(Duration::MAX, 4), Duration::MAX);
    }
}
