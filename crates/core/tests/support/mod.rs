//! In-process fake of the graph-execution backend, plus fixtures.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ltxgate_core::backend::BackendClient;
use ltxgate_core::config::AppConfig;
use ltxgate_core::{wait_until_ready, Handler, TemplateStore};

/// 1x1 transparent PNG.
pub const ONE_PIXEL_PNG: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completes on the given poll and lists the artifact in its outputs.
    Complete { after_polls: u32 },
    /// Completes, writes the artifact, but lists nothing in its outputs.
    CompleteUnlisted { after_polls: u32 },
    /// Completes, writes the artifact, but lists a file that is not on disk
    /// and cannot be downloaded.
    CompleteMislisted { after_polls: u32 },
    Fail,
    Never,
}

#[derive(Debug)]
pub struct FakeState {
    pub healthy: bool,
    pub outcome: Outcome,
    pub failing_submits: u32,
    pub failing_polls: u32,
    pub reject_submissions: bool,
    pub submit_attempts: u32,
    pub graphs: Vec<Value>,
    pub staged_image_present: Vec<bool>,
    pub polls: HashMap<String, u32>,
    pub deleted: Vec<String>,
    pub interrupted: Vec<String>,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Clone)]
pub struct FakeBackend {
    pub state: Arc<Mutex<FakeState>>,
    pub url: String,
}

impl FakeBackend {
    pub async fn spawn(outcome: Outcome, input_dir: &Path, output_dir: &Path) -> Self {
        let state = Arc::new(Mutex::new(FakeState {
            healthy: true,
            outcome,
            failing_submits: 0,
            failing_polls: 0,
            reject_submissions: false,
            submit_attempts: 0,
            graphs: Vec::new(),
            staged_image_present: Vec::new(),
            polls: HashMap::new(),
            deleted: Vec::new(),
            interrupted: Vec::new(),
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        }));

        let app = Router::new()
            .route("/system_stats", get(system_stats))
            .route("/prompt", post(submit))
            .route("/history/{id}", get(history))
            .route("/queue", get(queue).post(queue_delete))
            .route("/interrupt", post(interrupt))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake backend");
        let addr = listener.local_addr().expect("fake backend addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            state,
            url: format!("http://{addr}"),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut guard = self.state.lock().expect("fake state lock");
        f(&mut guard)
    }

    pub fn submissions(&self) -> usize {
        self.with(|state| state.graphs.len())
    }

    pub fn last_graph(&self) -> Value {
        self.with(|state| state.graphs.last().cloned().expect("a submitted graph"))
    }
}

type Shared = State<Arc<Mutex<FakeState>>>;

async fn system_stats(State(state): Shared) -> impl IntoResponse {
    if state.lock().expect("lock").healthy {
        (StatusCode::OK, Json(json!({"system": {"os": "posix"}, "devices": []})))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({})))
    }
}

async fn submit(State(state): Shared, Json(body): Json<Value>) -> impl IntoResponse {
    let mut state = state.lock().expect("lock");
    state.submit_attempts += 1;

    if state.failing_submits > 0 {
        state.failing_submits -= 1;
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "restarting"})));
    }
    if state.reject_submissions {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {"type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation"},
                "node_errors": {"98": {"errors": [{"message": "Invalid image file"}]}}
            })),
        );
    }

    let graph = body["prompt"].clone();
    let image_present = graph["98"]["inputs"]["image"]
        .as_str()
        .is_some_and(|name| state.input_dir.join(name).is_file());
    state.staged_image_present.push(image_present);
    state.graphs.push(graph);

    let job_id = format!("job-{}", state.graphs.len());
    (
        StatusCode::OK,
        Json(json!({"prompt_id": job_id, "number": state.graphs.len(), "node_errors": {}})),
    )
}

async fn history(State(state): Shared, UrlPath(id): UrlPath<String>) -> impl IntoResponse {
    let mut state = state.lock().expect("lock");
    if state.failing_polls > 0 {
        state.failing_polls -= 1;
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})));
    }

    let polls = {
        let count = state.polls.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    };

    let body = match state.outcome {
        Outcome::Complete { after_polls }
        | Outcome::CompleteUnlisted { after_polls }
        | Outcome::CompleteMislisted { after_polls }
            if polls >= after_polls =>
        {
            let index: usize = id
                .trim_start_matches("job-")
                .parse::<usize>()
                .expect("job index")
                - 1;
            let prefix = state.graphs[index]["92:99"]["inputs"]["filename_prefix"]
                .as_str()
                .expect("filename prefix")
                .to_string();
            let file = state.output_dir.join(format!("{prefix}_00001_.mp4"));
            std::fs::create_dir_all(file.parent().expect("parent")).expect("output dir");
            std::fs::write(&file, fake_video_bytes(&prefix)).expect("write output");

            let (subfolder, stem) = prefix.rsplit_once('/').unwrap_or(("", prefix.as_str()));
            let listed_name = match state.outcome {
                Outcome::Complete { .. } => Some(format!("{stem}_00001_.mp4")),
                Outcome::CompleteMislisted { .. } => Some(format!("{stem}_99999_.mp4")),
                _ => None,
            };
            let outputs = match listed_name {
                Some(filename) => json!({"92:99": {
                    "images": [{"filename": filename, "subfolder": subfolder, "type": "output"}],
                    "animated": [true]
                }}),
                None => json!({}),
            };
            json!({ id.clone(): {
                "status": {"status_str": "success", "completed": true, "messages": []},
                "outputs": outputs
            }})
        }
        Outcome::Fail => json!({ id.clone(): {
            "status": {
                "status_str": "error",
                "completed": false,
                "messages": [["execution_error", {"node_type": "VAEDecode", "exception_message": "CUDA out of memory"}]]
            },
            "outputs": {}
        }}),
        _ => json!({}),
    };
    (StatusCode::OK, Json(body))
}

async fn queue(State(state): Shared) -> Json<Value> {
    let state = state.lock().expect("lock");
    let pending: Vec<Value> = (1..=state.graphs.len())
        .map(|n| format!("job-{n}"))
        .filter(|id| !state.deleted.contains(id))
        .map(|id| json!([0, id, {}, {}, []]))
        .collect();
    Json(json!({"queue_running": [], "queue_pending": pending}))
}

async fn queue_delete(State(state): Shared, Json(body): Json<Value>) -> StatusCode {
    let mut state = state.lock().expect("lock");
    for id in body["delete"].as_array().into_iter().flatten() {
        if let Some(id) = id.as_str() {
            state.deleted.push(id.to_string());
        }
    }
    StatusCode::OK
}

async fn interrupt(State(state): Shared, Json(body): Json<Value>) -> StatusCode {
    let mut state = state.lock().expect("lock");
    let id = body["prompt_id"].as_str().unwrap_or_default().to_string();
    state.interrupted.push(id);
    StatusCode::OK
}

pub fn fake_video_bytes(prefix: &str) -> Vec<u8> {
    format!("fake-mp4:{prefix}").into_bytes()
}

pub fn decode_b64(text: &str) -> Vec<u8> {
    STANDARD.decode(text).expect("valid base64")
}

pub fn wav_base64(sample_rate: u32, samples: u32) -> String {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for index in 0..samples {
            writer.write_sample((index % 64) as i16).expect("sample");
        }
        writer.finalize().expect("finalize");
    }
    STANDARD.encode(cursor.into_inner())
}

pub struct Harness {
    pub dir: TempDir,
    pub config: AppConfig,
    pub backend: FakeBackend,
}

impl Harness {
    pub async fn new(outcome: Outcome) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let input_dir = dir.path().join("input");
        let output_dir = dir.path().join("output");
        std::fs::create_dir_all(&input_dir).expect("input dir");
        std::fs::create_dir_all(&output_dir).expect("output dir");

        let backend = FakeBackend::spawn(outcome, &input_dir, &output_dir).await;

        let mut config = AppConfig::default();
        config.backend.base_url = backend.url.clone();
        config.backend.input_dir = input_dir;
        config.backend.output_dir = output_dir;
        config.backend.request_timeout_ms = 2_000;
        config.readiness.max_attempts = 5;
        config.readiness.interval_ms = 10;
        config.readiness.probe_timeout_ms = 500;
        config.jobs.poll_interval_ms = 20;
        config.jobs.submit_backoff_ms = 10;
        config.jobs.cancel_timeout_ms = 1_000;
        config.jobs.progress_log_interval_secs = 1;

        Self {
            dir,
            config,
            backend,
        }
    }

    pub fn client(&self) -> BackendClient {
        BackendClient::new(&self.config.backend).expect("backend client")
    }

    pub async fn handler(&self) -> Handler {
        let ready = wait_until_ready(self.client(), &self.config.readiness, &CancellationToken::new())
            .await
            .into_result()
            .expect("fake backend is healthy");
        let templates = TemplateStore::builtin().expect("built-in templates");
        Handler::new(ready, &self.config, Arc::new(templates))
    }

    pub fn staged_inputs_left(&self) -> usize {
        std::fs::read_dir(&self.config.backend.input_dir)
            .expect("input dir")
            .count()
    }

    /// Waits briefly for background work such as backend cancellation.
    pub async fn eventually(&self, mut check: impl FnMut(&FakeState) -> bool) -> bool {
        for _ in 0..100 {
            if self.backend.with(|state| check(state)) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

/// An ID3-tagged payload; its duration can only be measured by ffprobe.
pub fn mp3_base64() -> String {
    let mut bytes = b"ID3\x04\x00\x00\x00\x00\x00\x00".to_vec();
    bytes.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
    bytes.resize(4096, 0);
    STANDARD.encode(bytes)
}

/// Writes an executable shell script standing in for ffprobe.
#[cfg(unix)]
pub fn fake_ffprobe(dir: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffprobe");
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).expect("write ffprobe stub");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod ffprobe stub");
    path
}
