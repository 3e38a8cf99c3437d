//! File logger for mftkit
//!
//! Library code logs through the `log` facade. This module supplies the sink:
//! timestamped lines written to a log file (or stderr when no file is given),
//! installed once per process with [`init`].

use crate::error::Result;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;

/// Global logger instance
static LOGGER: OnceLock<MftLogger> = OnceLock::new();

enum Sink {
    File(File),
    Stderr,
}

pub struct MftLogger {
    sink: Mutex<Sink>,
    level: LevelFilter,
}

impl MftLogger {
    /// Log to `path`, truncated first; stderr when `path` is `None`
    pub fn new(path: Option<&Path>, level: LevelFilter) -> Result<Self> {
        let sink = match path {
            Some(path) => Sink::File(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true) // Start fresh each run
                    .open(path)?,
            ),
            None => Sink::Stderr,
        };
        Ok(Self {
            sink: Mutex::new(sink),
            level,
        })
    }

    fn write_line(&self, line: &str) {
        match &mut *self.sink.lock() {
            Sink::File(file) => {
                let _ = file.write_all(line.as_bytes());
            }
            Sink::Stderr => eprint!("{}", line),
        }
    }
}

/// `[millis] [LEVEL] [target] message`
pub fn format_line(timestamp_ms: u128, level: log::Level, target: &str, message: &str) -> String {
    format!("[{:013}] [{:5}] [{}] {}\n", timestamp_ms, level, target, message)
}

impl Log for MftLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let line = format_line(
            timestamp,
            record.level(),
            record.target(),
            &record.args().to_string(),
        );
        self.write_line(&line);
    }

    fn flush(&self) {
        if let Sink::File(file) = &mut *self.sink.lock() {
            let _ = file.flush();
        }
    }
}

/// Install the global logger. Later calls keep the first logger.
pub fn init(path: Option<&Path>, level: LevelFilter) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    if LOGGER.set(MftLogger::new(path, level)?).is_err() {
        return Ok(());
    }
    if let Some(logger) = LOGGER.get() {
        if log::set_logger(logger).is_ok() {
            log::set_max_level(level);
        }
    }
    if let Some(path) = path {
        eprintln!("[mftkit] Logging to: {}", path.display());
    }
    Ok(())
}

/// Flush the log file
pub fn flush() {
    if let Some(logger) = LOGGER.get() {
        logger.flush();
    }
}

/// Write a separator line for readability
pub fn separator(label: &str) {
    log::info!(target: "---", "========== {} ==========", label);
}
