//! Core-facing control surface. The transport layer (HTTP, IPC, whatever)
//! is expected to call these operations and marshal the snapshots; nothing
//! here knows about routing or request formats.

use crate::audio::{AudioInput, AudioOutput};
use crate::config::{ConfigStore, EchoParams, ParamsUpdate};
use crate::events::TriggerLog;
use crate::monitor;
use crate::playback::{self, TriggerError, TriggerOrigin};
use crate::state::{Measurement, SharedState, UpdateOutcome};
use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

/// Echo-parameter block inside a status snapshot, including the live
/// playback indicators.
#[derive(Debug, Clone, Serialize)]
pub struct EchoStatus {
    pub delay_sec: f32,
    pub taps: u32,
    pub feedback: f32,
    pub start_vol: f32,
    pub end_vol: f32,
    pub frame_duration: f32,
    pub active: bool,
    pub level: f32,
}

/// Full status snapshot answered to `getStatus` queries.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub mic_enabled: bool,
    pub last_rms: f32,
    pub last_dbfs: f32,
    pub updated: f64,
    pub threshold_dbfs: f32,
    pub echo_params: EchoStatus,
    pub lockout_sec: f32,
}

/// Wires the shared state, audio devices, event sink, and parameter store
/// into the operations the control API needs.
#[derive(Clone)]
pub struct Service {
    state: Arc<SharedState>,
    input: Arc<dyn AudioInput>,
    output: Arc<dyn AudioOutput>,
    trigger_log: Arc<dyn TriggerLog>,
    store: Arc<ConfigStore>,
    sample_rate: u32,
}

impl Service {
    pub fn new(
        state: Arc<SharedState>,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        trigger_log: Arc<dyn TriggerLog>,
        store: Arc<ConfigStore>,
        sample_rate: u32,
    ) -> Self {
        Self {
            state,
            input,
            output,
            trigger_log,
            store,
            sample_rate,
        }
    }

    /// Spawn the capture loop on its own thread. `shutdown` stops it; the
    /// binary passes a flag it never raises.
    pub fn spawn_monitor(&self, shutdown: Arc<AtomicBool>) -> thread::JoinHandle<()> {
        let state = self.state.clone();
        let input = self.input.clone();
        let output = self.output.clone();
        let trigger_log = self.trigger_log.clone();
        let sample_rate = self.sample_rate;
        thread::spawn(move || {
            monitor::run_capture_loop(state, input, output, trigger_log, sample_rate, shutdown)
        })
    }

    pub fn status(&self) -> StatusSnapshot {
        let params = self.state.params();
        let measurement = self.state.measurement();
        let lockout = self.state.lockout();
        StatusSnapshot {
            mic_enabled: lockout.capture_enabled,
            last_rms: measurement.rms,
            last_dbfs: measurement.dbfs,
            updated: measurement.updated,
            threshold_dbfs: params.threshold_dbfs,
            echo_params: EchoStatus {
                delay_sec: params.delay_sec,
                taps: params.taps,
                feedback: params.feedback,
                start_vol: params.start_vol,
                end_vol: params.end_vol,
                frame_duration: params.frame_duration,
                active: lockout.playback_active,
                level: lockout.echo_level,
            },
            lockout_sec: params.lockout_sec,
        }
    }

    pub fn measurement(&self) -> Measurement {
        self.state.measurement()
    }

    pub fn params(&self) -> EchoParams {
        self.state.params()
    }

    /// Apply a partial parameter update and persist the accepted fields.
    /// The write is synchronous; the caller returns as soon as it lands.
    pub fn update_params(&self, update: &ParamsUpdate) -> Result<UpdateOutcome> {
        let outcome = self.state.update_params(update);
        if outcome.changed {
            self.store.save(&outcome.params)?;
            tracing::info!("echo parameters updated");
        }
        for rejection in &outcome.rejected {
            tracing::warn!(
                field = rejection.field,
                reason = %rejection.reason,
                "rejected parameter update"
            );
        }
        Ok(outcome)
    }

    /// Capture one fresh frame and play it back as an echo. Refused while a
    /// playback holds the lockout; never logged to the event sink.
    pub fn trigger_manual(&self) -> Result<(), TriggerError> {
        if !self.state.capture_enabled() {
            return Err(TriggerError::LockedOut);
        }
        let params = self.state.params();
        let frames = (params.frame_duration as f64 * self.sample_rate as f64).max(1.0) as usize;
        let frame = self
            .input
            .acquire(frames)
            .map_err(TriggerError::Device)?;
        playback::spawn_echo(
            self.state.clone(),
            self.output.clone(),
            self.trigger_log.clone(),
            frame,
            self.sample_rate,
            TriggerOrigin::Manual,
        )?;
        tracing::info!("manual echo triggered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullTriggerLog, TriggerEvent, TriggerLog};
    use anyhow::Result;
    use crossbeam_channel::{bounded, Receiver};
    use std::env;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_config_path(tag: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        env::temp_dir().join(format!("echomon_{tag}_{unique}.json"))
    }

    struct LoudInput;

    impl AudioInput for LoudInput {
        fn acquire(&self, frames: usize) -> Result<Vec<f32>> {
            Ok(vec![0.5; frames])
        }
    }

    struct InstantOutput {
        plays: AtomicUsize,
    }

    impl InstantOutput {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                plays: AtomicUsize::new(0),
            })
        }
    }

    impl AudioOutput for InstantOutput {
        fn play(&self, _buffer: Vec<f32>) -> Result<Receiver<()>> {
            self.plays.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = bounded(1);
            tx.send(()).unwrap();
            Ok(rx)
        }
    }

    struct RecordingLog {
        events: Mutex<Vec<TriggerEvent>>,
    }

    impl TriggerLog for RecordingLog {
        fn record(&self, event: &TriggerEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    fn fast_params() -> EchoParams {
        EchoParams {
            delay_sec: 0.01,
            taps: 2,
            frame_duration: 0.01,
            ..EchoParams::default()
        }
    }

    fn service_with(
        params: EchoParams,
        output: Arc<dyn AudioOutput>,
        log: Arc<dyn TriggerLog>,
        store_path: &PathBuf,
    ) -> (Service, Arc<SharedState>) {
        let state = Arc::new(SharedState::new(params));
        let service = Service::new(
            state.clone(),
            Arc::new(LoudInput),
            output,
            log,
            Arc::new(ConfigStore::new(store_path)),
            16_000,
        );
        (service, state)
    }

    #[test]
    fn status_mirrors_state_and_params() {
        let path = temp_config_path("status");
        let (service, state) = service_with(
            fast_params(),
            InstantOutput::new(),
            Arc::new(NullTriggerLog),
            &path,
        );
        state.publish_measurement(crate::meter::Reading {
            rms: 0.4,
            dbfs: -8.0,
        });

        let status = service.status();
        assert!(status.mic_enabled);
        assert_eq!(status.last_rms, 0.4);
        assert_eq!(status.last_dbfs, -8.0);
        assert_eq!(status.threshold_dbfs, fast_params().threshold_dbfs);
        assert_eq!(status.echo_params.taps, 2);
        assert!(!status.echo_params.active);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn accepted_update_is_persisted_synchronously() {
        let path = temp_config_path("persist");
        let (service, _state) = service_with(
            fast_params(),
            InstantOutput::new(),
            Arc::new(NullTriggerLog),
            &path,
        );

        let outcome = service
            .update_params(&ParamsUpdate {
                threshold_dbfs: Some(-10.0),
                ..ParamsUpdate::default()
            })
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(service.params().threshold_dbfs, -10.0);

        let persisted = ConfigStore::new(&path).load().unwrap();
        assert_eq!(persisted.threshold_dbfs, -10.0);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rejected_fields_are_not_persisted() {
        let path = temp_config_path("reject");
        let (service, _state) = service_with(
            fast_params(),
            InstantOutput::new(),
            Arc::new(NullTriggerLog),
            &path,
        );

        let outcome = service
            .update_params(&ParamsUpdate {
                taps: Some(0),
                ..ParamsUpdate::default()
            })
            .unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(!path.exists(), "nothing accepted, nothing written");
    }

    #[test]
    fn manual_trigger_plays_and_skips_the_event_sink() {
        let path = temp_config_path("manual");
        let output = InstantOutput::new();
        let log = Arc::new(RecordingLog {
            events: Mutex::new(Vec::new()),
        });
        let (service, state) = service_with(fast_params(), output.clone(), log.clone(), &path);

        service.trigger_manual().unwrap();
        // Playback runs on its own thread; wait for the lockout to clear.
        let start = std::time::Instant::now();
        while !state.capture_enabled() && start.elapsed() < std::time::Duration::from_secs(2) {
            thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(state.capture_enabled());
        assert_eq!(output.plays.load(Ordering::SeqCst), 1);
        assert!(log.events.lock().unwrap().is_empty(), "manual triggers are not logged");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn manual_trigger_is_rejected_while_locked_out() {
        let path = temp_config_path("locked");
        let (service, state) = service_with(
            fast_params(),
            InstantOutput::new(),
            Arc::new(NullTriggerLog),
            &path,
        );
        assert!(state.begin_lockout());

        assert!(matches!(
            service.trigger_manual(),
            Err(TriggerError::LockedOut)
        ));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn concurrent_manual_triggers_admit_exactly_one() {
        let path = temp_config_path("race");
        let output = InstantOutput::new();
        let (service, _state) = service_with(
            // long frame keeps the first playback alive while the second
            // request races it
            EchoParams {
                frame_duration: 0.3,
                delay_sec: 0.01,
                taps: 2,
                ..EchoParams::default()
            },
            output.clone(),
            Arc::new(NullTriggerLog),
            &path,
        );

        let mut handles = Vec::new();
        for _ in 0..2 {
            let service = service.clone();
            handles.push(thread::spawn(move || service.trigger_manual()));
        }
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one trigger may enter the lockout");
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(TriggerError::LockedOut))));
        let _ = fs::remove_file(&path);
    }
}
