//! JSON-lines event logs
//!
//! One [`EventParts`] object per line. Recorded logical clocks are kept in
//! the file for reference but replayed events always get fresh clocks from
//! the replaying process's factory.

use devflow_core::{DeviceEvent, DevflowError, DevflowResult, EventFactory, EventKind, EventParts};
use devflow_engine::EventSink;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Sink writing every event it receives to a JSON-lines file
pub struct EventRecorder {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    include_shutdown: bool,
}

impl EventRecorder {
    /// Create (or truncate) the log at `path`
    pub fn create(path: impl AsRef<Path>) -> DevflowResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| source_error(&path, e))?;
        info!(path = %path.display(), "recording events");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            include_shutdown: false,
        })
    }

    /// Also record the ShutDown sentinel
    pub fn with_shutdown(mut self) -> Self {
        self.include_shutdown = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> DevflowResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.flush().map_err(|e| source_error(&self.path, e))
    }
}

impl EventSink for EventRecorder {
    fn push(&self, event: DeviceEvent) -> DevflowResult<()> {
        let shutdown = event.is_shutdown();
        if shutdown && !self.include_shutdown {
            return self.flush();
        }
        let line = serde_json::to_string(&event.into_parts()).map_err(|e| DevflowError::Source {
            reason: format!("cannot encode event: {}", e),
        })?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", line).map_err(|e| source_error(&self.path, e))?;
        if shutdown {
            writer.flush().map_err(|e| source_error(&self.path, e))?;
        }
        Ok(())
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Reader of a JSON-lines event log
pub struct EventReplay {
    path: PathBuf,
    events: Arc<EventFactory>,
    skip_shutdown: bool,
}

impl EventReplay {
    pub fn open(path: impl AsRef<Path>, events: Arc<EventFactory>) -> DevflowResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(DevflowError::Source {
                reason: format!("{} is not a file", path.display()),
            });
        }
        Ok(Self {
            path,
            events,
            skip_shutdown: true,
        })
    }

    /// Replay recorded ShutDown sentinels instead of dropping them
    pub fn keep_shutdown(mut self) -> Self {
        self.skip_shutdown = false;
        self
    }

    /// Read and validate every event of the log
    ///
    /// Blank lines are skipped; the first malformed line fails the whole read
    /// with its line number.
    pub fn read_all(&self) -> DevflowResult<Vec<DeviceEvent>> {
        let mut events = Vec::new();
        self.for_each(|event| {
            events.push(event);
            Ok(())
        })?;
        Ok(events)
    }

    /// Push every event of the log into `sink`, returning how many were sent
    pub fn replay_into(&self, sink: &dyn EventSink) -> DevflowResult<usize> {
        let mut sent = 0;
        self.for_each(|event| {
            sink.push(event)?;
            sent += 1;
            Ok(())
        })?;
        debug!(path = %self.path.display(), sent, "replay finished");
        Ok(sent)
    }

    fn for_each(&self, mut visit: impl FnMut(DeviceEvent) -> DevflowResult<()>) -> DevflowResult<()> {
        let file = File::open(&self.path).map_err(|e| source_error(&self.path, e))?;
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| source_error(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let mut parts: EventParts = serde_json::from_str(&line).map_err(|e| DevflowError::InvalidSource {
                reason: format!("{} line {}: {}", self.path.display(), index + 1, e),
            })?;
            if self.skip_shutdown && parts.kind == EventKind::ShutDown.code() {
                continue;
            }
            parts.logical_clock = 0;
            let event = self.events.from_parts(parts).map_err(|e| DevflowError::InvalidSource {
                reason: format!("{} line {}: {}", self.path.display(), index + 1, e),
            })?;
            visit(event)?;
        }
        Ok(())
    }
}

fn source_error(path: &Path, error: std::io::Error) -> DevflowError {
    DevflowError::Source {
        reason: format!("{}: {}", path.display(), error),
    }
}
