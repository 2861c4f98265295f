//! Payload codec: base64 media in and out, input staging into the backend's
//! input directory, and audio duration measurement.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::HandlerError;

/// Accepts input with or without trailing `=` padding.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decodes a caller-supplied base64 payload. A leading `data:<mime>;base64,`
/// prefix and embedded whitespace are tolerated; anything else malformed, or
/// an empty result, is a codec error.
pub fn decode_input(field: &str, encoded: &str) -> Result<Vec<u8>, HandlerError> {
    let trimmed = encoded.trim();
    let body = if trimmed.starts_with("data:") {
        trimmed
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| HandlerError::codec(field, "data URI has no payload"))?
    } else {
        trimmed
    };

    let cleaned: String = body.chars().filter(|ch| !ch.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(HandlerError::codec(field, "payload is empty"));
    }

    let bytes = LENIENT_BASE64
        .decode(cleaned.as_bytes())
        .map_err(|err| HandlerError::codec(field, format!("malformed base64: {err}")))?;
    if bytes.is_empty() {
        return Err(HandlerError::codec(field, "payload decodes to zero bytes"));
    }

    Ok(bytes)
}

pub fn encode_output(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn image_extension(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "png",
        [0xFF, 0xD8, 0xFF, ..] => "jpg",
        [b'G', b'I', b'F', b'8', ..] => "gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        [b'B', b'M', ..] => "bmp",
        _ => "png",
    }
}

pub fn audio_extension(bytes: &[u8]) -> &'static str {
    match bytes {
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "wav",
        [b'I', b'D', b'3', ..] => "mp3",
        [0xFF, second, ..] if second & 0xE0 == 0xE0 => "mp3",
        [b'O', b'g', b'g', b'S', ..] => "ogg",
        [b'f', b'L', b'a', b'C', ..] => "flac",
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => "m4a",
        _ => "mp3",
    }
}

/// Duration of a WAV payload read from its header.
pub fn wav_duration_secs(bytes: &[u8]) -> Result<f64> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).context("invalid WAV header")?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        bail!("WAV header declares a zero sample rate");
    }
    Ok(f64::from(reader.duration()) / f64::from(spec.sample_rate))
}

#[derive(Debug, Deserialize)]
struct FfprobeFormatOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

pub fn parse_ffprobe_duration(json: &[u8]) -> Result<f64> {
    let probe: FfprobeFormatOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;
    let raw = probe
        .format
        .duration
        .context("ffprobe reported no container duration")?;
    raw.trim()
        .parse::<f64>()
        .with_context(|| format!("ffprobe duration '{raw}' is not a number"))
}

/// Upper bound on one ffprobe run, independent of the request budget.
pub const FFPROBE_TIMEOUT: Duration = Duration::from_secs(30);

async fn ffprobe_duration_secs(ffprobe: &Path, path: &Path) -> Result<f64> {
    let mut command = tokio::process::Command::from(crate::runtime::command_for_path(ffprobe));
    command
        .args(["-v", "quiet", "-print_format", "json", "-show_entries", "format=duration"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(FFPROBE_TIMEOUT, command.output())
        .await
        .map_err(|_| anyhow!("ffprobe did not finish within {}s", FFPROBE_TIMEOUT.as_secs()))?
        .with_context(|| format!("failed to execute {} (is FFmpeg installed?)", ffprobe.display()))?;

    if !output.status.success() {
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    parse_ffprobe_duration(&output.stdout)
}

/// Determines the playback length of staged audio. WAV is read in-process;
/// other containers go through `ffprobe` on the staged file. Dropping the
/// future kills a running ffprobe.
pub async fn audio_duration_secs(bytes: &[u8], staged: &Path, ffprobe: &Path) -> Result<f64, HandlerError> {
    let measured = if audio_extension(bytes) == "wav" {
        wav_duration_secs(bytes)
    } else {
        ffprobe_duration_secs(ffprobe, staged).await
    };

    let duration =
        measured.map_err(|err| HandlerError::codec("audio", format!("cannot read duration: {err:#}")))?;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(HandlerError::codec(
            "audio",
            format!("audio duration must be positive, got {duration}"),
        ));
    }

    debug!(duration_secs = duration, "Measured audio duration");
    Ok(duration)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Name the backend's loader nodes resolve inside their input directory.
    pub file_name: String,
    pub path: PathBuf,
}

/// Files written into the backend input directory for one request. They are
/// removed when this value is dropped.
#[derive(Debug)]
pub struct StagedInputs {
    dir: PathBuf,
    request_id: String,
    files: Vec<PathBuf>,
}

impl StagedInputs {
    pub fn new(dir: impl Into<PathBuf>, request_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            request_id: request_id.into(),
            files: Vec::new(),
        }
    }

    pub async fn stage(&mut self, role: &str, extension: &str, bytes: &[u8]) -> Result<StagedFile> {
        tokio::fs::create_dir_all(&self.dir).await.with_context(|| {
            format!("failed to create backend input directory: {}", self.dir.display())
        })?;

        let file_name = format!("ltxgate-{}-{role}.{extension}", self.request_id);
        let path = self.dir.join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to stage {role} input: {}", path.display()))?;
        self.files.push(path.clone());

        debug!(path = %path.display(), size = bytes.len(), "Staged {role} input");
        Ok(StagedFile { file_name, path })
    }

}

impl Drop for StagedInputs {
    fn drop(&mut self) {
        for path in self.files.drain(..) {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "Failed to remove staged input");
                }
            }
        }
    }
}
