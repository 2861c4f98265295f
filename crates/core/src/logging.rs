//! Logging setup helpers: filter selection, the rolling file sink, and a
//! writer that scrubs credentials and media payloads before they hit disk.

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "hyper=warn,reqwest=warn,h2=warn";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "ltxgate";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

/// Runs of base64 alphabet at least this long are treated as media payloads.
pub const BASE64_ELISION_THRESHOLD: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Fallback {
                attempted_log_dir, ..
            } => attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready { .. } => None,
            Self::Fallback { reason, .. } => Some(reason.as_str()),
        }
    }
}

/// Filter precedence: `--log-filter`, then `-v`/`-vv`, then `RUST_LOG`, then
/// the default. The noise filter is prepended only when the user did not pick
/// a filter explicitly on the command line.
pub fn compose_log_filter(options: &LoggingOptions) -> String {
    let explicit = options.cli_log_filter.is_some() || options.verbose > 0;

    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    };

    if explicit || options.noise_filter.trim().is_empty() {
        user_filter
    } else {
        format!("{},{user_filter}", options.noise_filter)
    }
}

pub fn build_file_sink_plan(options: &LoggingOptions) -> FileSinkPlan {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready { log_dir, appender },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

#[derive(Debug)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }

    fn make_writer_for(&'a self, metadata: &Metadata<'_>) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer_for(metadata))
    }
}

/// Buffers until a full line is available so a secret split across two
/// `write` calls is still caught.
#[derive(Debug)]
pub struct RedactingWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    fn emit(&mut self, chunk: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(chunk);
        self.inner.write_all(scrub_log_text(&text).as_bytes())
    }

    fn drain_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.pending);
        self.emit(&chunk)
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.emit(&line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_pending()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.drain_pending();
        let _ = self.inner.flush();
    }
}

/// Masks credentials and elides inline media before text is persisted.
pub fn scrub_log_text(input: &str) -> String {
    let without_userinfo = redact_url_userinfo(input);
    let without_secrets = redact_secret_assignments(&without_userinfo);
    elide_base64_payloads(&without_secrets)
}

fn redact_url_userinfo(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(scheme_end) = rest.find("://") {
        let authority_start = scheme_end + 3;
        let authority_len = rest[authority_start..]
            .find(|ch: char| ch.is_whitespace() || matches!(ch, '/' | '?' | '#' | '"' | '\''))
            .unwrap_or(rest.len() - authority_start);
        let authority = &rest[authority_start..authority_start + authority_len];

        output.push_str(&rest[..authority_start]);
        match authority.rfind('@') {
            Some(at) if at > 0 => {
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&authority[at..]);
            }
            _ => output.push_str(authority),
        }
        rest = &rest[authority_start + authority_len..];
    }

    output.push_str(rest);
    output
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    matches!(key.as_str(), "key" | "pwd" | "passwd" | "authorization")
        || key.contains("token")
        || key.contains("secret")
        || key.contains("password")
        || key.ends_with("_key")
        || key.ends_with("-key")
        || key.ends_with("apikey")
}

fn redact_secret_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut copied_to = 0;
    let mut index = 0;

    while index < bytes.len() {
        if !matches!(bytes[index], b'=' | b':') {
            index += 1;
            continue;
        }

        let key_start = input[..index]
            .rfind(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'))
            .map_or(0, |pos| pos + 1);
        if key_start == index || !is_secret_key(&input[key_start..index]) {
            index += 1;
            continue;
        }

        let mut value_start = index + 1;
        while value_start < bytes.len() && bytes[value_start] == b' ' {
            value_start += 1;
        }
        if input[value_start..]
            .get(..7)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bearer "))
        {
            value_start += 7;
        }
        if value_start < bytes.len() && matches!(bytes[value_start], b'"' | b'\'') {
            value_start += 1;
        }

        let value_end = input[value_start..]
            .find(|ch: char| {
                ch.is_whitespace() || matches!(ch, '&' | ',' | ';' | ')' | ']' | '}' | '"' | '\'')
            })
            .map_or(input.len(), |pos| value_start + pos);

        if value_end > value_start {
            output.push_str(&input[copied_to..value_start]);
            output.push_str(REDACTION_PLACEHOLDER);
            copied_to = value_end;
        }
        index = value_end.max(index + 1);
    }

    output.push_str(&input[copied_to..]);
    output
}

fn is_base64_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=')
}

fn elide_base64_payloads(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len().min(1024));
    let mut copied_to = 0;
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index..].starts_with(b"data:") {
            if let Some(marker) = input[index..]
                .find(";base64,")
                .filter(|offset| !input[index..index + offset].contains(char::is_whitespace))
            {
                let payload_start = index + marker + ";base64,".len();
                let payload_end = bytes[payload_start..]
                    .iter()
                    .position(|byte| !is_base64_byte(*byte))
                    .map_or(bytes.len(), |pos| payload_start + pos);
                output.push_str(&input[copied_to..payload_start]);
                output.push_str(&format!("<{} base64 chars elided>", payload_end - payload_start));
                copied_to = payload_end;
                index = payload_end;
                continue;
            }
        }

        if is_base64_byte(bytes[index]) {
            let run_end = bytes[index..]
                .iter()
                .position(|byte| !is_base64_byte(*byte))
                .map_or(bytes.len(), |pos| index + pos);
            if run_end - index >= BASE64_ELISION_THRESHOLD {
                output.push_str(&input[copied_to..index]);
                output.push_str(&format!("<{} base64 chars elided>", run_end - index));
                copied_to = run_end;
                index = run_end;
                continue;
            }
        }

        index += 1;
    }

    output.push_str(&input[copied_to..]);
    output
}
