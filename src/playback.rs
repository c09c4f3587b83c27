//! Playback controller: owns the lockout life cycle for one echo.
//!
//! A trigger atomically disables capture, synthesizes the echo from a
//! parameter snapshot, plays it while animating the envelope level, and
//! re-enables capture when everything is done. The re-enable runs from a
//! drop guard, so no fault path can leave capture disabled.

use crate::audio::AudioOutput;
use crate::config::EchoParams;
use crate::events::{TriggerEvent, TriggerLog};
use crate::state::SharedState;
use crate::synth;
use anyhow::{bail, Result};
use crossbeam_channel::RecvTimeoutError;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Extra wait on top of the animation's nominal duration before the
/// completion wait is abandoned.
const COMPLETION_SLACK: Duration = Duration::from_secs(2);

/// Whether the loudness monitor or an operator started this echo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerOrigin {
    /// Raised by the capture loop; carries the loudness that crossed the
    /// threshold and is the only origin that reaches the event sink.
    Automatic { dbfs: f32 },
    Manual,
}

/// Why a trigger request was refused before any playback started.
#[derive(Debug)]
pub enum TriggerError {
    /// Capture is disabled because another playback is in progress. A
    /// defined rejection, not a fault; requests are never queued.
    LockedOut,
    /// The input device failed while capturing the frame for a manual
    /// trigger.
    Device(anyhow::Error),
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerError::LockedOut => write!(f, "capture is locked out by an active playback"),
            TriggerError::Device(err) => write!(f, "audio capture failed: {err:#}"),
        }
    }
}

impl std::error::Error for TriggerError {}

/// Re-enables capture when the playback attempt ends, however it ends.
struct LockoutGuard {
    state: Arc<SharedState>,
}

impl Drop for LockoutGuard {
    fn drop(&mut self) {
        self.state.end_lockout();
        tracing::info!("capture re-enabled after lockout");
    }
}

/// Enter the lockout and spawn the playback task for one captured frame.
///
/// Exactly one trigger can hold the lockout; a request that loses the race
/// is rejected with [`TriggerError::LockedOut`]. The parameter snapshot is
/// taken here so concurrent updates cannot corrupt the in-flight echo.
pub fn spawn_echo(
    state: Arc<SharedState>,
    output: Arc<dyn AudioOutput>,
    trigger_log: Arc<dyn TriggerLog>,
    frame: Vec<f32>,
    sample_rate: u32,
    origin: TriggerOrigin,
) -> Result<thread::JoinHandle<()>, TriggerError> {
    if !state.begin_lockout() {
        return Err(TriggerError::LockedOut);
    }
    let params = state.params();

    let handle = thread::spawn(move || {
        let _guard = LockoutGuard {
            state: state.clone(),
        };
        if let TriggerOrigin::Automatic { dbfs } = origin {
            trigger_log.record(&TriggerEvent::now(dbfs));
        }
        match play_once(&state, output.as_ref(), &frame, &params, sample_rate) {
            Ok(()) => tracing::info!("echo playback finished"),
            Err(err) => tracing::warn!("echo playback failed: {err:#}"),
        }
    });
    Ok(handle)
}

/// Synthesize, play, and animate one echo. Every error routes back to the
/// caller so the lockout guard can release capture.
fn play_once(
    state: &SharedState,
    output: &dyn AudioOutput,
    frame: &[f32],
    params: &EchoParams,
    sample_rate: u32,
) -> Result<()> {
    let (buffer, envelope) = synth::synthesize(frame, params, sample_rate)?;
    let buffer = synth::clip(buffer);
    let completion = output.play(buffer)?;

    // The animation approximates perceived playback: one frame's worth of
    // dry signal, then one delay gap per remaining tap. It shares nothing
    // with the device beyond the echo level and the completion wait below.
    for (i, level) in envelope.iter().enumerate() {
        state.set_echo_level(*level);
        let pause = if i == 0 {
            params.frame_duration
        } else {
            params.delay_sec
        };
        thread::sleep(Duration::from_secs_f32(pause));
    }
    state.set_echo_level(params.end_vol);

    let bound = Duration::from_secs_f32(
        params.frame_duration + params.delay_sec * envelope.len() as f32,
    ) + COMPLETION_SLACK;
    match completion.recv_timeout(bound) {
        Ok(()) => Ok(()),
        Err(RecvTimeoutError::Timeout) => {
            bail!("output device did not signal completion within {bound:?}")
        }
        Err(RecvTimeoutError::Disconnected) => {
            bail!("output device dropped its completion channel")
        }
    }
}
