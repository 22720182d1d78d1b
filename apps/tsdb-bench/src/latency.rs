use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("latency file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("latency recorder is closed")]
    Closed,
    #[error("latency recorder lock poisoned")]
    Poisoned,
    #[error("latency write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A timed operation that has started but not yet been persisted.
#[derive(Debug, Clone)]
pub struct QueryLatency {
    key: String,
    start: DateTime<Utc>,
}

impl QueryLatency {
    pub fn new(key: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            start,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// One persisted observation: `<rfc3339 start>,<key>,<elapsed ms>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyLine {
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub elapsed_ms: i64,
}

impl LatencyLine {
    fn finish(latency: QueryLatency, now: DateTime<Utc>) -> Self {
        let elapsed_ms = (now - latency.start).num_milliseconds().max(0);
        Self {
            timestamp: latency.start,
            key: latency.key,
            elapsed_ms,
        }
    }
}

impl fmt::Display for LatencyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.key,
            self.elapsed_ms
        )
    }
}

/// Append-only latency log shared by every in-flight operation.
///
/// The file handle lives for the whole run; each record is a single
/// `write_all` under the lock so concurrent lines never interleave.
#[derive(Debug)]
pub struct LatencyRecorder {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LatencyRecorder {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, latency: QueryLatency) -> Result<LatencyLine, RecorderError> {
        let line = LatencyLine::finish(latency, Utc::now());
        let text = format!("{line}\n");
        tracing::info!(key = %line.key, elapsed_ms = line.elapsed_ms, "{}", text.trim_end());

        let mut guard = self.file.lock().map_err(|_| RecorderError::Poisoned)?;
        let file = guard.as_mut().ok_or(RecorderError::Closed)?;
        file.write_all(text.as_bytes())?;
        Ok(line)
    }

    pub fn close(&self) -> Result<(), RecorderError> {
        let file = {
            let mut guard = self.file.lock().map_err(|_| RecorderError::Poisoned)?;
            guard.take()
        };
        if let Some(file) = file {
            file.sync_all()?;
            tracing::debug!(path = %self.path.display(), "closed latency recorder");
        }
        Ok(())
    }
}
