//! Trigger-event sink. The core fires one event per automatic trigger and
//! moves on; retries and storage formats live entirely on this side of the
//! trait so a sink failure can never disturb playback or capture.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

const WRITE_ATTEMPTS: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_millis(50);
const CSV_HEADER: &str = "timestamp,dbfs\n";

/// One automatic trigger: the loudness that crossed the threshold and when.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub dbfs: f32,
    pub timestamp: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn now(dbfs: f32) -> Self {
        Self {
            dbfs,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget recording of automatic triggers.
pub trait TriggerLog: Send + Sync {
    fn record(&self, event: &TriggerEvent);
}

/// Appends `timestamp,dbfs` rows to a CSV file, retrying a few times before
/// giving up with a warning.
#[derive(Debug, Clone)]
pub struct CsvTriggerLog {
    path: PathBuf,
}

impl CsvTriggerLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let fresh = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if fresh {
            file.write_all(CSV_HEADER.as_bytes())?;
        }
        file.write_all(line.as_bytes())
    }
}

impl TriggerLog for CsvTriggerLog {
    fn record(&self, event: &TriggerEvent) {
        let line = format!(
            "{},{:.1}\n",
            event.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            event.dbfs
        );
        for attempt in 1..=WRITE_ATTEMPTS {
            match self.append(&line) {
                Ok(()) => return,
                Err(err) if attempt < WRITE_ATTEMPTS => {
                    tracing::debug!("trigger log write failed (attempt {attempt}): {err}");
                    thread::sleep(RETRY_PAUSE);
                }
                Err(err) => {
                    tracing::warn!(
                        "dropping trigger event after {WRITE_ATTEMPTS} attempts: {err}"
                    );
                }
            }
        }
    }
}

/// Sink for embedders and tests that want trigger events discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTriggerLog;

impl TriggerLog for NullTriggerLog {
    fn record(&self, _event: &TriggerEvent) {}
}
