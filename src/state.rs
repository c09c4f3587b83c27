//! Shared mutable state: runtime parameters, the latest loudness measurement,
//! and the capture/playback lockout flags.
//!
//! Each structure sits behind its own mutex; the only cross-field atomic
//! update is the lockout flag pair, which always flips inside one critical
//! section. Locks are held just long enough to read or write a value, never
//! across device I/O or sleeps.

use crate::config::{EchoParams, FieldRejection, ParamsUpdate};
use crate::meter::Reading;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Latest loudness measurement, overwritten each capture cycle.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Measurement {
    pub rms: f32,
    pub dbfs: f32,
    /// Unix timestamp (seconds) of the capture that produced this reading.
    pub updated: f64,
}

impl Default for Measurement {
    fn default() -> Self {
        Self {
            rms: 0.0,
            dbfs: f32::NEG_INFINITY,
            updated: 0.0,
        }
    }
}

/// Capture/playback exclusivity flags plus the animated echo level.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LockoutState {
    pub capture_enabled: bool,
    pub playback_active: bool,
    pub echo_level: f32,
}

impl Default for LockoutState {
    fn default() -> Self {
        Self {
            capture_enabled: true,
            playback_active: false,
            echo_level: 0.0,
        }
    }
}

/// Outcome of a partial parameter update: the resulting snapshot, whether
/// anything changed, and the fields that were refused.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub params: EchoParams,
    pub changed: bool,
    pub rejected: Vec<FieldRejection>,
}

/// Thread-safe holder shared by the capture loop, playback workers, and the
/// control surface.
#[derive(Debug)]
pub struct SharedState {
    params: Mutex<EchoParams>,
    measurement: Mutex<Measurement>,
    lockout: Mutex<LockoutState>,
}

impl SharedState {
    pub fn new(params: EchoParams) -> Self {
        Self {
            params: Mutex::new(params),
            measurement: Mutex::new(Measurement::default()),
            lockout: Mutex::new(LockoutState::default()),
        }
    }

    /// Snapshot of the current parameters.
    pub fn params(&self) -> EchoParams {
        self.params
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Apply a partial update under the parameter lock. Valid fields land
    /// even when others are rejected.
    pub fn update_params(&self, update: &ParamsUpdate) -> UpdateOutcome {
        let mut guard = self
            .params
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (changed, rejected) = guard.apply(update);
        UpdateOutcome {
            params: guard.clone(),
            changed,
            rejected,
        }
    }

    /// Publish the reading from the frame just captured.
    pub fn publish_measurement(&self, reading: Reading) {
        let mut guard = self
            .measurement
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Measurement {
            rms: reading.rms,
            dbfs: reading.dbfs,
            updated: unix_now(),
        };
    }

    pub fn measurement(&self) -> Measurement {
        *self
            .measurement
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn lockout(&self) -> LockoutState {
        *self
            .lockout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capture_enabled(&self) -> bool {
        self.lockout().capture_enabled
    }

    /// Try to enter the lockout. Exactly one caller wins when several race;
    /// the losers observe capture already disabled and back off.
    pub fn begin_lockout(&self) -> bool {
        let mut guard = self
            .lockout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.capture_enabled {
            return false;
        }
        guard.capture_enabled = false;
        guard.playback_active = true;
        true
    }

    /// Leave the lockout. Called on every playback exit path, successful or
    /// not, so capture can never stay disabled.
    pub fn end_lockout(&self) {
        let mut guard = self
            .lockout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.playback_active = false;
        guard.capture_enabled = true;
    }

    /// Update the animated envelope level read by status queries.
    pub fn set_echo_level(&self, level: f32) {
        let mut guard = self
            .lockout
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.echo_level = level;
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lockout_starts_open() {
        let state = SharedState::new(EchoParams::default());
        let lockout = state.lockout();
        assert!(lockout.capture_enabled);
        assert!(!lockout.playback_active);
        assert_eq!(lockout.echo_level, 0.0);
    }

    #[test]
    fn begin_and_end_flip_both_flags_together() {
        let state = SharedState::new(EchoParams::default());
        assert!(state.begin_lockout());
        let locked = state.lockout();
        assert!(!locked.capture_enabled);
        assert!(locked.playback_active);

        state.end_lockout();
        let open = state.lockout();
        assert!(open.capture_enabled);
        assert!(!open.playback_active);
    }

    #[test]
    fn second_lockout_attempt_is_refused() {
        let state = SharedState::new(EchoParams::default());
        assert!(state.begin_lockout());
        assert!(!state.begin_lockout());
    }

    #[test]
    fn concurrent_lockout_attempts_admit_exactly_one() {
        let state = Arc::new(SharedState::new(EchoParams::default()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(thread::spawn(move || state.begin_lockout()));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(wins, 1);
        assert!(!state.capture_enabled());
    }

    #[test]
    fn measurement_snapshot_tracks_publishes() {
        let state = SharedState::new(EchoParams::default());
        assert_eq!(state.measurement().dbfs, f32::NEG_INFINITY);

        state.publish_measurement(Reading {
            rms: 0.5,
            dbfs: -6.0,
        });
        let m = state.measurement();
        assert_eq!(m.rms, 0.5);
        assert_eq!(m.dbfs, -6.0);
        assert!(m.updated > 0.0);
    }

    #[test]
    fn update_params_applies_under_the_lock() {
        let state = SharedState::new(EchoParams::default());
        let outcome = state.update_params(&ParamsUpdate {
            threshold_dbfs: Some(-12.0),
            taps: Some(0),
            ..ParamsUpdate::default()
        });
        assert!(outcome.changed);
        assert_eq!(outcome.params.threshold_dbfs, -12.0);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(state.params().threshold_dbfs, -12.0);
    }

    #[test]
    fn echo_level_is_readable_through_lockout_snapshot() {
        let state = SharedState::new(EchoParams::default());
        state.set_echo_level(0.7);
        assert_eq!(state.lockout().echo_level, 0.7);
    }
}
