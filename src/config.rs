//! Command-line parsing, runtime echo parameters, and durable persistence.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_CONFIG_FILE: &str = "echo_config.json";

const DEFAULT_THRESHOLD_DBFS: f32 = -25.0;
const DEFAULT_LOCKOUT_SEC: f32 = 2.0;
const DEFAULT_DELAY_SEC: f32 = 0.25;
const DEFAULT_TAPS: u32 = 3;
const DEFAULT_FEEDBACK: f32 = 0.5;
const DEFAULT_START_VOL: f32 = 1.0;
const DEFAULT_END_VOL: f32 = 0.3;
const DEFAULT_FRAME_DURATION: f32 = 1.5;

/// CLI options for the echo monitor service. Validated values keep the audio
/// pipeline and persistence paths safe.
#[derive(Debug, Parser, Clone)]
#[command(about = "Loudness-triggered echo monitor", author, version)]
pub struct AppConfig {
    /// Path of the persisted parameter file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    pub config_path: PathBuf,

    /// Preferred audio input device name
    #[arg(long)]
    pub input_device: Option<String>,

    /// Preferred audio output device name
    #[arg(long)]
    pub output_device: Option<String>,

    /// Capture and playback sample rate (Hz)
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    pub sample_rate: u32,

    /// Append automatic trigger events to this CSV file
    #[arg(long)]
    pub trigger_log: Option<PathBuf>,

    /// Print detected audio devices and exit
    #[arg(long = "list-devices", default_value_t = false)]
    pub list_devices: bool,

    /// Print a diagnostic report and exit
    #[arg(long, default_value_t = false)]
    pub doctor: bool,

    /// Write JSON-lines trace output to a file instead of stderr
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}

impl AppConfig {
    /// Check CLI values before any device or file is touched.
    pub fn validate(&self) -> Result<()> {
        if !(8_000..=96_000).contains(&self.sample_rate) {
            bail!(
                "--sample-rate must be between 8000 and 96000 Hz, got {}",
                self.sample_rate
            );
        }
        if self.config_path.as_os_str().is_empty() {
            bail!("--config-path cannot be empty");
        }
        Ok(())
    }
}

/// Runtime-mutable echo parameters, persisted as JSON. Fields absent from the
/// file fall back to their defaults during deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoParams {
    /// Loudness that arms an automatic trigger (dBFS)
    pub threshold_dbfs: f32,
    /// Advisory lockout length; re-enablement is playback-driven
    pub lockout_sec: f32,
    /// Gap between echo taps (seconds)
    pub delay_sec: f32,
    /// Number of delayed copies, at least 1
    pub taps: u32,
    /// Fraction of the previous tap folded into the next
    pub feedback: f32,
    /// Envelope volume at the first tap
    pub start_vol: f32,
    /// Envelope volume at the last tap
    pub end_vol: f32,
    /// Length of one captured frame (seconds)
    pub frame_duration: f32,
}

impl Default for EchoParams {
    fn default() -> Self {
        Self {
            threshold_dbfs: DEFAULT_THRESHOLD_DBFS,
            lockout_sec: DEFAULT_LOCKOUT_SEC,
            delay_sec: DEFAULT_DELAY_SEC,
            taps: DEFAULT_TAPS,
            feedback: DEFAULT_FEEDBACK,
            start_vol: DEFAULT_START_VOL,
            end_vol: DEFAULT_END_VOL,
            frame_duration: DEFAULT_FRAME_DURATION,
        }
    }
}

/// Partial update applied through the control surface. Every field is
/// optional; absent fields are left untouched.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ParamsUpdate {
    pub threshold_dbfs: Option<f32>,
    pub lockout_sec: Option<f32>,
    pub delay_sec: Option<f32>,
    pub taps: Option<u32>,
    pub feedback: Option<f32>,
    pub start_vol: Option<f32>,
    pub end_vol: Option<f32>,
    pub frame_duration: Option<f32>,
}

impl ParamsUpdate {
    pub fn is_empty(&self) -> bool {
        self.threshold_dbfs.is_none()
            && self.lockout_sec.is_none()
            && self.delay_sec.is_none()
            && self.taps.is_none()
            && self.feedback.is_none()
            && self.start_vol.is_none()
            && self.end_vol.is_none()
            && self.frame_duration.is_none()
    }
}

/// One field the store refused to apply, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldRejection {
    pub field: &'static str,
    pub reason: String,
}

impl FieldRejection {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl EchoParams {
    /// Apply a partial update field by field. Valid fields land even when
    /// others are rejected; the rejections come back with reasons. Returns
    /// whether anything changed.
    pub fn apply(&mut self, update: &ParamsUpdate) -> (bool, Vec<FieldRejection>) {
        let mut changed = false;
        let mut rejected = Vec::new();

        if let Some(v) = update.threshold_dbfs {
            if v.is_finite() {
                self.threshold_dbfs = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("threshold_dbfs", "must be a finite number"));
            }
        }
        if let Some(v) = update.lockout_sec {
            if v.is_finite() && v >= 0.0 {
                self.lockout_sec = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("lockout_sec", "must be a non-negative number"));
            }
        }
        if let Some(v) = update.delay_sec {
            if v.is_finite() && v >= 0.0 {
                self.delay_sec = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("delay_sec", "must be a non-negative number"));
            }
        }
        if let Some(v) = update.taps {
            if v >= 1 {
                self.taps = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("taps", "must be at least 1"));
            }
        }
        if let Some(v) = update.feedback {
            if v.is_finite() {
                self.feedback = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("feedback", "must be a finite number"));
            }
        }
        if let Some(v) = update.start_vol {
            if v.is_finite() {
                self.start_vol = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("start_vol", "must be a finite number"));
            }
        }
        if let Some(v) = update.end_vol {
            if v.is_finite() {
                self.end_vol = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("end_vol", "must be a finite number"));
            }
        }
        if let Some(v) = update.frame_duration {
            if v.is_finite() && v > 0.0 {
                self.frame_duration = v;
                changed = true;
            } else {
                rejected.push(FieldRejection::new("frame_duration", "must be a positive number"));
            }
        }

        (changed, rejected)
    }
}

/// Durable storage for the runtime parameters.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load persisted parameters. A missing file yields the defaults; an
    /// unreadable or malformed file is an error so a bad deploy is noticed.
    pub fn load(&self) -> Result<EchoParams> {
        if !self.path.exists() {
            return Ok(EchoParams::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read parameter file '{}'", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse parameter file '{}'", self.path.display()))
    }

    /// Write the full parameter set back out, pretty-printed for hand edits.
    pub fn save(&self, params: &EchoParams) -> Result<()> {
        let raw = serde_json::to_string_pretty(params)
            .context("failed to serialize echo parameters")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("failed to write parameter file '{}'", self.path.display()))
    }
}
