//! Startup barrier: nothing may be submitted until the backend has answered
//! a health probe once.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendClient;
use crate::config::ReadinessConfig;
use crate::error::HandlerError;

/// Proof that the readiness gate passed. Only [`wait_until_ready`] creates
/// one, and a request handler cannot be built without it.
#[derive(Debug, Clone)]
pub struct BackendReady {
    backend: BackendClient,
}

impl BackendReady {
    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }

    pub fn into_backend(self) -> BackendClient {
        self.backend
    }
}

#[derive(Debug)]
pub enum Readiness {
    Ready(BackendReady),
    Unready { attempts: u32, last_error: String },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn into_result(self) -> Result<BackendReady, HandlerError> {
        match self {
            Self::Ready(ready) => Ok(ready),
            Self::Unready {
                attempts,
                last_error,
            } => Err(HandlerError::StartupNotReady {
                attempts,
                reason: last_error,
            }),
        }
    }
}

/// Probes `GET /system_stats` up to `max_attempts` times, `interval` apart.
/// Cancelling the token ends the wait as unready.
pub async fn wait_until_ready(
    backend: BackendClient,
    config: &ReadinessConfig,
    cancel: &CancellationToken,
) -> Readiness {
    let started = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = String::from("no probe attempted");

    info!(
        backend = %backend.base_url(),
        max_attempts,
        interval_ms = config.interval_ms,
        "Waiting for backend to become ready"
    );

    for attempt in 1..=max_attempts {
        match backend.probe(config.probe_timeout()).await {
            Ok(()) => {
                info!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backend is ready"
                );
                return Readiness::Ready(BackendReady { backend });
            }
            Err(err) => {
                last_error = format!("{err:#}");
                debug!(attempt, max_attempts, error = %last_error, "Backend probe failed");
            }
        }

        if attempt == max_attempts {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(attempt, "Readiness wait cancelled");
                return Readiness::Unready { attempts: attempt, last_error };
            }
            _ = tokio::time::sleep(config.interval()) => {}
        }
    }

    warn!(
        attempts = max_attempts,
        elapsed_ms = started.elapsed().as_millis() as u64,
        error = %last_error,
        "Backend never became ready"
    );
    Readiness::Unready {
        attempts: max_attempts,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn spawn_health_server(healthy_after: u32) -> (String, Arc<AtomicU32>) {
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();
        let app = Router::new().route(
            "/system_stats",
            get(move || {
                let counter = counter.clone();
                async move {
                    let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if seen >= healthy_after {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), probes)
    }

    fn fast_config(max_attempts: u32) -> ReadinessConfig {
        ReadinessConfig {
            max_attempts,
            interval_ms: 10,
            probe_timeout_ms: 500,
        }
    }

    fn client(base_url: String) -> BackendClient {
        BackendClient::new(&BackendConfig {
            base_url,
            ..BackendConfig::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn ready_after_backend_recovers() {
        let (url, probes) = spawn_health_server(3).await;
        let readiness =
            wait_until_ready(client(url), &fast_config(5), &CancellationToken::new()).await;

        assert!(readiness.is_ready());
        assert_eq!(probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unready_after_exhausting_attempts() {
        let (url, probes) = spawn_health_server(u32::MAX).await;
        let readiness =
            wait_until_ready(client(url), &fast_config(4), &CancellationToken::new()).await;

        match readiness {
            Readiness::Unready {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("HTTP 503"));
            }
            Readiness::Ready(_) => panic!("backend never reported healthy"),
        }
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn unreachable_backend_maps_to_startup_not_ready() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = wait_until_ready(
            client(format!("http://{addr}")),
            &fast_config(2),
            &CancellationToken::new(),
        )
        .await
        .into_result()
        .expect_err("nothing listens on the port");
        assert_eq!(err.kind(), "startup_not_ready");
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let (url, _) = spawn_health_server(u32::MAX).await;
        let cancel = CancellationToken::new();
        let config = ReadinessConfig {
            max_attempts: 1_000,
            interval_ms: 50,
            probe_timeout_ms: 500,
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let readiness = wait_until_ready(client(url), &config, &cancel).await;
        assert!(!readiness.is_ready());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
