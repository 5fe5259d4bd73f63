//! Fire-and-forget scheduling trace events.
//!
//! The scheduler emits a [`SchedEvent`] at each interesting transition. Sinks
//! must not block for long and must swallow their own failures: tracing is
//! an observer and never influences scheduling.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{trace, warn};

use crate::error::SchedError;

/// Default capacity of [`RingSink`].
pub const DEFAULT_RING_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedEventKind {
    /// Registered by submit.
    Created,
    /// Picked up by a processor.
    SwapIn,
    /// Returned from a step.
    SwapOut,
    /// Moved out of DATA_WAIT by notify.
    NotifyIn,
    Finished,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedEvent {
    pub kind: SchedEventKind,
    pub routine_id: u64,
    pub processor_id: Option<usize>,
    pub timestamp: DateTime<Utc>,
}

impl SchedEvent {
    pub fn now(kind: SchedEventKind, routine_id: u64, processor_id: Option<usize>) -> Self {
        Self {
            kind,
            routine_id,
            processor_id,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of scheduling events.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: SchedEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TraceSink for NullSink {
    fn record(&self, _event: SchedEvent) {}
}

/// Forwards events to `tracing` at TRACE level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn record(&self, event: SchedEvent) {
        trace!(
            kind = ?event.kind,
            routine_id = event.routine_id,
            processor_id = ?event.processor_id,
            "sched event"
        );
    }
}

/// Keeps the most recent events in memory.
#[derive(Debug)]
pub struct RingSink {
    events: Mutex<VecDeque<SchedEvent>>,
    capacity: usize,
}

impl Default for RingSink {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl RingSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Events from oldest to newest.
    pub fn events(&self) -> Vec<SchedEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn count(&self, kind: SchedEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl TraceSink for RingSink {
    fn record(&self, event: SchedEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Appends one JSON object per event to a file.
///
/// The first write error is logged; later ones are dropped silently.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
    failed: AtomicBool,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SchedError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            failed: AtomicBool::new(false),
        })
    }

    pub fn flush(&self) -> Result<(), SchedError> {
        self.writer.lock().flush()?;
        Ok(())
    }

    fn write_event(&self, event: &SchedEvent) -> Result<(), SchedError> {
        let line = serde_json::to_string(event).map_err(|e| SchedError::Trace(e.to_string()))?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

impl TraceSink for JsonLinesSink {
    fn record(&self, event: SchedEvent) {
        if let Err(e) = self.write_event(&event) {
            if !self.failed.swap(true, Ordering::Relaxed) {
                warn!(error = %e, "trace sink write failed, dropping further errors");
            }
        }
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}
