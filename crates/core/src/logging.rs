//! Log filter selection, the rolling file sink, secret redaction and the
//! crash-artifact panic hook. The binary wires these into a
//! `tracing_subscriber` registry.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::{self, Write},
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing::Metadata;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriter;

use crate::accumulate::TILE_LOG_TARGET;

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str =
    "ort=error,reqwest=warn,hyper_util=warn,tilerefine::tiles=info";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "tilerefine";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";
pub const REDACTION_PLACEHOLDER: &str = "***REDACTED***";

static PANIC_HOOK_INSTALL_LOCK: Mutex<()> = Mutex::new(());
static PANIC_HOOK_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_HOOK_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_ARTIFACT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub include_noise_filter_when_implicit: bool,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            include_noise_filter_when_implicit: true,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingFilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready {
        log_dir: PathBuf,
        retention_files: usize,
        appender: RollingFileAppender,
    },
    Fallback {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookInstallPlan {
    Installed {
        crash_dir: PathBuf,
    },
    AlreadyInstalled {
        crash_dir: PathBuf,
    },
    Fallback {
        attempted_crash_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Filter precedence: `--log-filter` > `-v`/`-vv` > `RUST_LOG` > default.
/// The noise filter is prepended only when the filter was picked
/// implicitly; the file sink always keeps per-tile records at `debug`.
pub fn compose_logging_filters(options: &LoggingInitOptions) -> LoggingFilterPlan {
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

    let implicit = options.include_noise_filter_when_implicit
        && options.cli_log_filter.is_none()
        && options.verbose == 0;

    let console_filter = if implicit {
        prepend_directives(&options.noise_filter, &user_filter)
    } else {
        user_filter.clone()
    };
    let file_filter = if implicit {
        prepend_directives(&file_noise_filter(&options.noise_filter), &user_filter)
    } else {
        user_filter.clone()
    };

    LoggingFilterPlan {
        user_filter,
        console_filter,
        file_filter,
    }
}

fn prepend_directives(directives: &str, user_filter: &str) -> String {
    if directives.trim().is_empty() {
        user_filter.to_string()
    } else {
        format!("{directives},{user_filter}")
    }
}

/// The noise filter with any tile-target directive replaced by `debug`.
fn file_noise_filter(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .filter(|directive| {
            directive
                .split_once('=')
                .map_or(true, |(target, _)| target.trim() != TILE_LOG_TARGET)
        })
        .map(ToString::to_string)
        .collect();
    directives.push(format!("{TILE_LOG_TARGET}=debug"));
    directives.join(",")
}

/// Daily rolling appender under `<data_dir>/logs`.
pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

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

    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files)
        .build(&log_dir);

    match built {
        Ok(appender) => FileSinkPlan::Ready {
            log_dir,
            retention_files,
            appender,
        },
        Err(error) => FileSinkPlan::Fallback {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

/// Wraps a `MakeWriter` so every line is passed through
/// [`redact_sensitive_text`].
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

/// Buffers until a newline so secrets split across writes are still caught.
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
        self.inner
            .write_all(redact_sensitive_text(&text).as_bytes())
    }

    fn drain_pending(&mut self, complete_lines_only: bool) -> io::Result<()> {
        let end = if complete_lines_only {
            match self.pending.iter().rposition(|byte| *byte == b'\n') {
                Some(index) => index + 1,
                None => return Ok(()),
            }
        } else {
            self.pending.len()
        };
        if end == 0 {
            return Ok(());
        }
        let chunk: Vec<u8> = self.pending.drain(..end).collect();
        for line in chunk.split_inclusive(|byte| *byte == b'\n') {
            self.emit(line)?;
        }
        Ok(())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.drain_pending(true)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain_pending(false)?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.drain_pending(false);
        let _ = self.inner.flush();
    }
}

/// Mask URL userinfo, `key=value` / `key: value` pairs whose key looks like a
/// credential, and bearer tokens.
pub fn redact_sensitive_text(input: &str) -> String {
    redact_sensitive_assignments(&redact_url_credentials(input))
}

fn redact_url_credentials(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(offset) = rest.find("://") {
        let authority_start = offset + 3;
        output.push_str(&rest[..authority_start]);
        let tail = &rest[authority_start..];
        let authority_len = tail
            .find(|ch: char| {
                matches!(ch, '/' | '?' | '#' | '"' | '\'' | '<' | '>') || ch.is_whitespace()
            })
            .unwrap_or(tail.len());
        let authority = &tail[..authority_len];

        match authority.rfind('@') {
            Some(at) if at > 0 => {
                output.push_str(REDACTION_PLACEHOLDER);
                output.push_str(&authority[at..]);
            }
            _ => output.push_str(authority),
        }
        rest = &tail[authority_len..];
    }

    output.push_str(rest);
    output
}

fn redact_sensitive_assignments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut copied = 0usize;
    let mut index = 0usize;

    while index < bytes.len() {
        if !matches!(bytes[index], b'=' | b':') {
            index += 1;
            continue;
        }

        let key_start = input[..index]
            .char_indices()
            .rev()
            .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-'))
            .map_or(0, |(pos, ch)| pos + ch.len_utf8());
        if key_start == index || !is_sensitive_key(&input[key_start..index].to_ascii_lowercase()) {
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

        let (secret_start, secret_end) = match bytes.get(value_start) {
            Some(&quote @ (b'"' | b'\'')) => {
                let start = value_start + 1;
                let end = input[start..]
                    .find(quote as char)
                    .map_or(input.len(), |offset| start + offset);
                (start, end)
            }
            Some(_) => {
                let end = input[value_start..]
                    .find(|ch: char| {
                        ch.is_whitespace() || matches!(ch, '&' | ',' | ';' | ')' | ']' | '}' | '"' | '\'')
                    })
                    .map_or(input.len(), |offset| value_start + offset);
                (value_start, end)
            }
            None => (value_start, value_start),
        };

        if secret_end > secret_start {
            output.push_str(&input[copied..secret_start]);
            output.push_str(REDACTION_PLACEHOLDER);
            copied = secret_end;
            index = secret_end;
        } else {
            index += 1;
        }
    }

    output.push_str(&input[copied..]);
    output
}

fn is_sensitive_key(key: &str) -> bool {
    matches!(key, "key" | "pwd" | "passwd" | "authorization")
        || ["token", "secret", "password"]
            .iter()
            .any(|needle| key.contains(needle))
        || ["_key", "-key", "apikey"]
            .iter()
            .any(|suffix| key.ends_with(suffix))
}

/// Install a hook that writes `panic-<timestamp>-<seq>.log` under
/// `<data_dir>/logs/crash` and then chains to the previous hook.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookInstallPlan {
    if let Some(crash_dir) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: crash_dir.clone(),
        };
    }

    let Some(data_dir) = data_dir else {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: None,
            reason: "panic hook disabled: data_dir is not configured".to_string(),
        };
    };

    let crash_dir = data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookInstallPlan::Fallback {
            attempted_crash_dir: Some(crash_dir),
            reason: format!("failed to create crash artifact directory: {error}"),
        };
    }

    let _install_guard = PANIC_HOOK_INSTALL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_HOOK_CRASH_DIR.get() {
        return PanicHookInstallPlan::AlreadyInstalled {
            crash_dir: existing.clone(),
        };
    }

    let previous_hook = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        write_panic_artifact_guarded(&hook_dir, info);
        previous_hook(info);
    }));

    let _ = PANIC_HOOK_CRASH_DIR.set(crash_dir.clone());
    PanicHookInstallPlan::Installed { crash_dir }
}

#[derive(Debug)]
struct PanicArtifact {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

/// Never panics itself; a nested panic while writing is swallowed.
fn write_panic_artifact_guarded(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    if PANIC_HOOK_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        write_panic_artifact(crash_dir, &PanicArtifact::capture(info))
    }));
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_HOOK_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

impl PanicArtifact {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1/full to enable)",
                "<disabled by backtrace policy>".to_string(),
            ),
            _ => ("unsupported", "<backtrace unavailable>".to_string()),
        };

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: panic_payload_to_string(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }
}

fn write_panic_artifact(crash_dir: &Path, artifact: &PanicArtifact) -> io::Result<PathBuf> {
    fs::create_dir_all(crash_dir)?;

    let sequence = PANIC_ARTIFACT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let path = crash_dir.join(format!(
        "panic-{}-{sequence:06}.log",
        artifact.timestamp.format("%Y%m%d-%H%M%S-%f")
    ));

    let mut file = fs::File::create(&path)?;
    writeln!(file, "timestamp_utc={}", artifact.timestamp.to_rfc3339())?;
    writeln!(file, "thread={}", artifact.thread_name)?;
    writeln!(file, "location={}", artifact.location)?;
    writeln!(file, "payload={}", artifact.payload)?;
    writeln!(file, "backtrace_policy={}", artifact.backtrace_policy)?;
    writeln!(file, "backtrace:")?;
    writeln!(file, "{}", artifact.backtrace)?;
    file.flush()?;

    Ok(path)
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(payload) = payload.downcast_ref::<&str>() {
        (*payload).to_string()
    } else if let Some(payload) = payload.downcast_ref::<String>() {
        payload.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
