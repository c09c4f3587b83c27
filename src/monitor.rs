//! Capture loop: samples the input while capture is enabled, measures
//! loudness, publishes the reading, and raises automatic triggers.

use crate::audio::{AudioInput, AudioOutput};
use crate::events::TriggerLog;
use crate::meter;
use crate::playback::{self, TriggerError, TriggerOrigin};
use crate::state::SharedState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Poll interval while capture is locked out; no audio resources are touched
/// in this state.
const IDLE_POLL: Duration = Duration::from_millis(50);
/// Pause after a failed acquisition before trying the device again.
const ACQUISITION_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Run the capture/trigger loop until `shutdown` is raised. The binary never
/// raises it; tests do.
///
/// Acquisition faults are recovered here: logged, a short pause, then the
/// device is retried indefinitely. Nothing in this loop can disable capture
/// permanently.
pub fn run_capture_loop(
    state: Arc<SharedState>,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    trigger_log: Arc<dyn TriggerLog>,
    sample_rate: u32,
    shutdown: Arc<AtomicBool>,
) {
    tracing::info!("capture loop started");
    while !shutdown.load(Ordering::Relaxed) {
        if !state.capture_enabled() {
            thread::sleep(IDLE_POLL);
            continue;
        }

        // Fresh snapshot each cycle so parameter updates take effect on the
        // next frame.
        let params = state.params();
        let frames = (params.frame_duration as f64 * sample_rate as f64).max(1.0) as usize;

        let frame = match input.acquire(frames) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("audio capture failed: {err:#}");
                thread::sleep(ACQUISITION_RETRY_PAUSE);
                continue;
            }
        };

        let reading = meter::measure(&frame);
        state.publish_measurement(reading);

        if reading.dbfs > params.threshold_dbfs {
            tracing::info!(
                dbfs = reading.dbfs,
                threshold = params.threshold_dbfs,
                "threshold exceeded, triggering echo"
            );
            match playback::spawn_echo(
                state.clone(),
                output.clone(),
                trigger_log.clone(),
                frame,
                sample_rate,
                TriggerOrigin::Automatic {
                    dbfs: reading.dbfs,
                },
            ) {
                Ok(_handle) => {}
                // A concurrent manual trigger won the race; fall back to
                // idling until the lockout clears.
                Err(TriggerError::LockedOut) => {}
                Err(err) => tracing::warn!("automatic trigger failed: {err}"),
            }
        }
    }
    tracing::info!("capture loop stopped");
}
