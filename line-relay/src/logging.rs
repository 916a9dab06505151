//! Log output for the relay: a console layer plus a file layer that rolls over
//! to a new file every time bucket.
//!
//! The file side is a [`RollingFile`] behind `tracing_appender::non_blocking`,
//! so relay tasks never block on disk and the single worker thread keeps
//! writes strictly one at a time.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
};

use chrono::{Local, NaiveDateTime, NaiveTime, Timelike};
use clap::ValueEnum;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Granularity at which [`RollingFile`] starts a new file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Rotation {
    Second,
    Minute,
    Hour,
    Day,
}

impl Rotation {
    /// Truncates `now` to the start of its bucket.
    ///
    /// Two instants share a file exactly when their buckets are equal, which
    /// also covers rollovers of the larger units (10:05 and 11:05 are
    /// different minute buckets even though the minute field matches).
    pub fn bucket(self, now: NaiveDateTime) -> NaiveDateTime {
        let (hour, minute, second) = match self {
            Rotation::Second => (now.hour(), now.minute(), now.second()),
            Rotation::Minute => (now.hour(), now.minute(), 0),
            Rotation::Hour => (now.hour(), 0, 0),
            Rotation::Day => (0, 0, 0),
        };
        NaiveTime::from_hms_opt(hour, minute, second)
            .map_or(now, |time| now.date().and_time(time))
    }

    fn suffix(self, bucket: NaiveDateTime) -> String {
        // `;` rather than `:` keeps the names valid on every filesystem.
        let format = match self {
            Rotation::Second => "%Y-%m-%d_%H;%M;%S",
            Rotation::Minute => "%Y-%m-%d_%H;%M",
            Rotation::Hour => "%Y-%m-%d_%H",
            Rotation::Day => "%Y-%m-%d",
        };
        bucket.format(format).to_string()
    }
}

#[derive(Debug, Error)]
pub enum LogSinkError {
    #[error("log file name must not be empty")]
    EmptyName,
    #[error("log file name {0:?} must not contain path separators")]
    InvalidName(String),
    #[error("failed to create log directory {}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to open log file {}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file writer that switches to `<dir>/<name>_<bucket>.log` whenever the
/// local time enters a new [`Rotation`] bucket.
///
/// Each `write` call lands entirely in one file. The `fmt` layer formats a
/// whole event before writing it, so a log line is never split across files.
#[derive(Debug)]
pub struct RollingFile {
    dir: PathBuf,
    name: String,
    rotation: Rotation,
    current: Option<(NaiveDateTime, File)>,
}

impl RollingFile {
    pub fn new(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        rotation: Rotation,
    ) -> Result<Self, LogSinkError> {
        let dir = dir.into();
        let name = name.into();
        if name.is_empty() {
            return Err(LogSinkError::EmptyName);
        }
        if name.contains(['/', '\\']) {
            return Err(LogSinkError::InvalidName(name));
        }
        fs::create_dir_all(&dir).map_err(|source| LogSinkError::CreateDir {
            path: dir.clone(),
            source,
        })?;

        Ok(Self {
            dir,
            name,
            rotation,
            current: None,
        })
    }

    /// Opens the file for the current bucket now instead of on first write,
    /// so an unwritable destination shows up at startup.
    pub fn open_current(&mut self) -> Result<PathBuf, LogSinkError> {
        let bucket = self.rotation.bucket(Local::now().naive_local());
        let path = self.path_for(bucket);
        let file = open_append(&self.dir, &path).map_err(|source| LogSinkError::Open {
            path: path.clone(),
            source,
        })?;
        self.current = Some((bucket, file));
        Ok(path)
    }

    pub fn path_for(&self, bucket: NaiveDateTime) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.log",
            self.name,
            self.rotation.suffix(bucket)
        ))
    }

    fn write_at(&mut self, now: NaiveDateTime, buf: &[u8]) -> io::Result<usize> {
        let bucket = self.rotation.bucket(now);
        if self.current.as_ref().map(|(current, _)| *current) != Some(bucket) {
            // Drop the old handle first so it is closed before the next opens.
            self.current = None;
            let file = open_append(&self.dir, &self.path_for(bucket))?;
            self.current = Some((bucket, file));
        }

        if let Some((_, file)) = self.current.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(Local::now().naive_local(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

fn open_append(dir: &Path, path: &Path) -> io::Result<File> {
    // The directory may have been removed underneath a long-running relay.
    fs::create_dir_all(dir)?;
    OpenOptions::new().create(true).append(true).open(path)
}

/// Where and how often the relay writes its log files.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub dir: PathBuf,
    pub name: String,
    pub rotation: Rotation,
}

/// Installs console and rotating-file logging for the relay.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for as long as the process should log.
pub fn init(config: &LogConfig) -> Result<WorkerGuard, LogSinkError> {
    let mut file = RollingFile::new(&config.dir, &config.name, config.rotation)?;
    file.open_current()?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer()
        .with_target(false)
        .with_ansi(io::stdout().is_terminal());
    let file_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(file_writer);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init();

    Ok(guard)
}

/// Console-only logging on stderr, for modes where stdout carries data.
pub fn init_console() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
