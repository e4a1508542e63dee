//!
//! Per-slide run log.
//!
//! Each step of a slide run appends timestamped lines to its own file in the
//! slide directory. A [`RunLog`] is opened when the step starts, handed to the
//! stage by reference and closed when the step ends. Every line is also sent
//! to the `log` facade.
//!
#![allow(missing_docs)]

use anyhow::{Context, Result};
use chrono::Local;
use log::{log, warn, Level};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S,%3f";

pub struct RunLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RunLog {
    /// Open `path` for appending, creating it and its directory if needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("While creating {dir:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("While opening run log {path:?}"))?;
        Ok(RunLog {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A failure to write the log itself is reported through `log` and
    /// otherwise ignored.
    pub fn record(&self, level: Level, message: &str) {
        log!(level, "{message}");
        let timestamp = Local::now().format(TIMESTAMP_FORMAT);
        let written = match self.writer.lock() {
            Ok(mut writer) => writeln!(writer, "{timestamp} - {level} - {message}")
                .and_then(|()| writer.flush()),
            Err(_) => return,
        };
        if let Err(err) = written {
            warn!("unable to write to {:?}: {err}", self.path);
        }
    }

    pub fn info(&self, message: &str) {
        self.record(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.record(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.record(Level::Error, message);
    }

    pub fn close(self) -> Result<()> {
        let path = self.path;
        let mut writer = self
            .writer
            .into_inner()
            .map_err(|_| anyhow::anyhow!("run log {path:?} was poisoned"))?;
        writer
            .flush()
            .with_context(|| format!("While closing run log {path:?}"))
    }
}
