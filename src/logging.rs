//! Structured logging: JSON lines to a size-rotated file plus console
//! output, and the query used by the logs API endpoint.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Rotate the log file once it crosses this size, keeping one backup.
const MAX_LOG_SIZE: u64 = 100 * 1024 * 1024;

/// The newest-first log query never returns more than this many lines.
pub const MAX_LOG_LINES: usize = 200;

struct RollingFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RollingFile {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
        })
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        let backup = self.path.with_extension("log.1");
        let _ = std::fs::remove_file(&backup);
        std::fs::rename(&self.path, &backup)?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

/// `Write` handle shared between the tracing layer and rotation state.
#[derive(Clone)]
pub struct RollingWriter(Arc<Mutex<RollingFile>>);

impl RollingWriter {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self(Arc::new(Mutex::new(RollingFile::open(path)?))))
    }
}

impl Write for RollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.0.lock();
        if inner.written + buf.len() as u64 > MAX_LOG_SIZE {
            inner.rotate()?;
        }
        let n = inner.file.write(buf)?;
        inner.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().file.flush()
    }
}

/// Installs the global subscriber: JSON lines to the rotated log file, human
/// output on the console. `dev` raises the default level to debug.
pub fn init(log_path: &Path, dev: bool) -> Result<()> {
    let writer = RollingWriter::open(log_path)?;
    let default_filter = if dev {
        "bangumid=debug,tower_http=debug"
    } else {
        "bangumid=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(move || writer.clone()),
        )
        .init();
    Ok(())
}

/// One line of the JSON log file, as served by the logs endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Deserialize)]
struct RawLine {
    timestamp: String,
    level: String,
    #[serde(default)]
    target: String,
    #[serde(default)]
    fields: RawFields,
}

#[derive(Default, Deserialize)]
struct RawFields {
    #[serde(default)]
    message: String,
}

/// Tails the structured log file: optional level and keyword filters,
/// newest first, `limit` capped at [`MAX_LOG_LINES`].
pub fn query_logs(
    log_path: &Path,
    level: Option<&str>,
    keyword: Option<&str>,
    limit: usize,
    offset: usize,
) -> Result<Vec<LogEntry>> {
    let file = match File::open(log_path) {
        Ok(f) => f,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).context("open log file"),
    };

    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("read log file")?;
        let Ok(raw) = serde_json::from_str::<RawLine>(&line) else {
            continue;
        };
        if let Some(level) = level {
            if !raw.level.eq_ignore_ascii_case(level) {
                continue;
            }
        }
        if let Some(keyword) = keyword {
            let keyword = keyword.to_lowercase();
            if !raw.fields.message.to_lowercase().contains(&keyword)
                && !raw.target.to_lowercase().contains(&keyword)
            {
                continue;
            }
        }
        entries.push(LogEntry {
            timestamp: raw.timestamp,
            level: raw.level,
            target: raw.target,
            message: raw.fields.message,
        });
    }

    entries.reverse();
    let limit = limit.clamp(1, MAX_LOG_LINES);
    Ok(entries.into_iter().skip(offset).take(limit).collect())
}
