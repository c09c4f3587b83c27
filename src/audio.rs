//! Audio device plumbing: a blocking capture source and an asynchronous
//! playback sink, both behind traits so the capture loop and playback
//! controller can run against test doubles.
//!
//! Everything that touches cpal converts to mono f32 normalized to
//! [-1.0, 1.0] up front so the rest of the pipeline stays format-agnostic.

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Extra wait beyond the buffer's nominal duration before the output worker
/// gives up on the device draining.
const DRAIN_SLACK: Duration = Duration::from_secs(2);
/// Short tail after the last sample is handed to the device, so its final
/// buffer is not cut off by dropping the stream.
const FLUSH_TAIL: Duration = Duration::from_millis(100);

/// Blocking acquisition of mono samples at the configured rate.
pub trait AudioInput: Send + Sync {
    fn acquire(&self, frames: usize) -> Result<Vec<f32>>;
}

/// Asynchronous playback: returns immediately with a channel that signals
/// once the device has consumed the whole buffer.
pub trait AudioOutput: Send + Sync {
    fn play(&self, buffer: Vec<f32>) -> Result<Receiver<()>>;
}

/// List microphone names so the CLI can expose a human-friendly selector.
pub fn input_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host.input_devices().context("no input devices available")?;
    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

/// List playback device names.
pub fn output_device_names() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .context("no output devices available")?;
    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

fn resolve_input_device(preferred: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match preferred {
        Some(name) => {
            let mut devices = host.input_devices().context("no input devices available")?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow!("input device '{name}' not found"))
        }
        None => host
            .default_input_device()
            .context("no default input device available"),
    }
}

fn resolve_output_device(preferred: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match preferred {
        Some(name) => {
            let mut devices = host
                .output_devices()
                .context("no output devices available")?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow!("output device '{name}' not found"))
        }
        None => host
            .default_output_device()
            .context("no default output device available"),
    }
}

/// Microphone-backed capture source. Each `acquire` opens a short-lived
/// input stream, collects for the frame's duration, and normalizes the
/// result to mono f32 at the configured rate.
pub struct MicSource {
    device: cpal::Device,
    sample_rate: u32,
}

impl MicSource {
    /// Create a source, optionally forcing a specific device so users can
    /// pick the right microphone when several inputs are exposed.
    pub fn new(preferred: Option<&str>, sample_rate: u32) -> Result<Self> {
        let device = resolve_input_device(preferred)?;
        Ok(Self {
            device,
            sample_rate,
        })
    }

    /// Get the name of the active capture device.
    pub fn device_name(&self) -> String {
        self.device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string())
    }
}

impl AudioInput for MicSource {
    fn acquire(&self, frames: usize) -> Result<Vec<f32>> {
        let frames = frames.max(1);
        let default_config = self.device.default_input_config()?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let device_sample_rate = device_config.sample_rate.0;
        let channels = usize::from(device_config.channels.max(1));
        let device_name = self.device_name();

        // cpal delivers samples on a callback thread; collect them in a
        // shared buffer so ownership stays on the caller side.
        let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
        let buffer_clone = buffer.clone();
        let err_fn = |err| tracing::debug!("audio stream error: {err}");

        let stream = match format {
            SampleFormat::F32 => self.device.build_input_stream(
                &device_config,
                move |data: &[f32], _| {
                    if let Ok(mut buf) = buffer_clone.lock() {
                        append_downmixed_samples(&mut buf, data, channels, |sample| sample);
                    }
                },
                err_fn,
                None,
            )?,
            SampleFormat::I16 => self.device.build_input_stream(
                &device_config,
                move |data: &[i16], _| {
                    if let Ok(mut buf) = buffer_clone.lock() {
                        append_downmixed_samples(&mut buf, data, channels, |sample| {
                            sample as f32 / 32_768.0_f32
                        });
                    }
                },
                err_fn,
                None,
            )?,
            SampleFormat::U16 => self.device.build_input_stream(
                &device_config,
                move |data: &[u16], _| {
                    if let Ok(mut buf) = buffer_clone.lock() {
                        append_downmixed_samples(&mut buf, data, channels, |sample| {
                            (sample as f32 - 32_768.0_f32) / 32_768.0_f32
                        });
                    }
                },
                err_fn,
                None,
            )?,
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        };

        stream.play()?;
        thread::sleep(Duration::from_secs_f64(
            frames as f64 / self.sample_rate as f64,
        ));
        if let Err(err) = stream.pause() {
            tracing::debug!("failed to pause audio stream: {err}");
        }
        drop(stream);

        let samples = buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if samples.is_empty() {
            return Err(anyhow!(
                "no samples captured from '{device_name}'; check microphone permissions and availability"
            ));
        }

        let processed = resample(&samples, device_sample_rate, self.sample_rate);
        Ok(adjust_frame_length(processed, frames))
    }
}

/// Speaker-backed playback sink. Each `play` hands the buffer to a worker
/// thread that owns the output stream for the duration of the clip; the
/// returned channel fires once the device has consumed everything.
pub struct Speaker {
    preferred: Option<String>,
    name: String,
    sample_rate: u32,
}

impl Speaker {
    pub fn new(preferred: Option<&str>, sample_rate: u32) -> Result<Self> {
        // Resolve once up front so a bad device name fails at startup, even
        // though each playback re-resolves on its own thread.
        let device = resolve_output_device(preferred)?;
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());
        Ok(Self {
            preferred: preferred.map(str::to_string),
            name,
            sample_rate,
        })
    }

    pub fn device_name(&self) -> String {
        self.name.clone()
    }
}

impl AudioOutput for Speaker {
    fn play(&self, buffer: Vec<f32>) -> Result<Receiver<()>> {
        let (done_tx, done_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let preferred = self.preferred.clone();
        let sample_rate = self.sample_rate;

        // cpal streams are not Send, so the stream lives entirely on this
        // worker; build failures are reported back before play() returns.
        thread::spawn(move || {
            run_playback_stream(preferred.as_deref(), sample_rate, buffer, ready_tx, done_tx);
        });

        ready_rx
            .recv()
            .context("output worker exited before reporting readiness")??;
        Ok(done_rx)
    }
}

fn run_playback_stream(
    preferred: Option<&str>,
    sample_rate: u32,
    buffer: Vec<f32>,
    ready_tx: Sender<Result<()>>,
    done_tx: Sender<()>,
) {
    let setup = || -> Result<(cpal::Stream, Receiver<()>, Duration)> {
        let device = resolve_output_device(preferred)?;
        let default_config = device.default_output_config()?;
        let format = default_config.sample_format();
        let device_config: StreamConfig = default_config.into();
        let device_rate = device_config.sample_rate.0.max(1);
        let channels = usize::from(device_config.channels.max(1));

        let samples = resample(&buffer, sample_rate, device_rate);
        let nominal = Duration::from_secs_f64(samples.len() as f64 / device_rate as f64);
        let (drained_tx, drained_rx) = bounded::<()>(1);
        let feed = Arc::new(Mutex::new(PlaybackFeed::new(samples, channels, drained_tx)));
        let err_fn = |err| tracing::debug!("audio stream error: {err}");

        let stream = match format {
            SampleFormat::F32 => {
                let feed = feed.clone();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [f32], _| {
                        if let Ok(mut feed) = feed.lock() {
                            feed.fill(data, |sample| sample);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            SampleFormat::I16 => {
                let feed = feed.clone();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [i16], _| {
                        if let Ok(mut feed) = feed.lock() {
                            feed.fill(data, |sample| (sample * 32_767.0) as i16);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            SampleFormat::U16 => {
                let feed = feed.clone();
                device.build_output_stream(
                    &device_config,
                    move |data: &mut [u16], _| {
                        if let Ok(mut feed) = feed.lock() {
                            feed.fill(data, |sample| (sample * 32_767.0 + 32_768.0) as u16);
                        }
                    },
                    err_fn,
                    None,
                )?
            }
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        };
        stream.play()?;
        Ok((stream, drained_rx, nominal))
    };

    match setup() {
        Ok((stream, drained_rx, nominal)) => {
            let _ = ready_tx.send(Ok(()));
            let bound = nominal + DRAIN_SLACK;
            if drained_rx.recv_timeout(bound).is_err() {
                tracing::warn!("output stream did not drain within {bound:?}");
            }
            thread::sleep(FLUSH_TAIL);
            if let Err(err) = stream.pause() {
                tracing::debug!("failed to pause output stream: {err}");
            }
            drop(stream);
            let _ = done_tx.send(());
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
        }
    }
}

/// Pulls samples into the output callback, duplicating mono across the
/// device's channels and signalling once the buffer is exhausted.
struct PlaybackFeed {
    samples: Vec<f32>,
    pos: usize,
    channels: usize,
    drained: Option<Sender<()>>,
}

impl PlaybackFeed {
    fn new(samples: Vec<f32>, channels: usize, drained: Sender<()>) -> Self {
        Self {
            samples,
            pos: 0,
            channels: channels.max(1),
            drained: Some(drained),
        }
    }

    fn fill<T, F>(&mut self, out: &mut [T], mut convert: F)
    where
        T: Copy,
        F: FnMut(f32) -> T,
    {
        for frame in out.chunks_mut(self.channels) {
            let sample = self.samples.get(self.pos).copied().unwrap_or(0.0);
            for slot in frame.iter_mut() {
                *slot = convert(sample);
            }
            if self.pos < self.samples.len() {
                self.pos += 1;
                if self.pos == self.samples.len() {
                    if let Some(sender) = self.drained.take() {
                        let _ = sender.try_send(());
                    }
                }
            }
        }
    }
}

/// Downmix multi-channel input to mono while applying the provided converter
/// so the pipeline sees a single channel regardless of microphone layout.
fn append_downmixed_samples<T, F>(buf: &mut Vec<f32>, data: &[T], channels: usize, mut convert: F)
where
    T: Copy,
    F: FnMut(T) -> f32,
{
    if channels <= 1 {
        buf.extend(data.iter().copied().map(&mut convert));
        return;
    }

    // Average each interleaved frame to produce a mono representation.
    let mut acc = 0.0f32;
    let mut count = 0usize;
    for sample in data.iter().copied() {
        acc += convert(sample);
        count += 1;
        if count == channels {
            buf.push(acc / channels as f32);
            acc = 0.0;
            count = 0;
        }
    }
    if count > 0 {
        buf.push(acc / count as f32);
    }
}

/// Convert between sample rates with a linear interpolator, low-passing
/// first when decimating so speech doesn't alias.
pub(crate) fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == 0 || to_rate == 0 {
        return input.to_vec(); // avoid div-by-zero elsewhere
    }
    if input.is_empty() || from_rate == to_rate {
        return input.to_vec();
    }

    let ratio = to_rate as f32 / from_rate as f32;
    let filtered = if from_rate > to_rate {
        let taps = downsampling_tap_count(from_rate, to_rate);
        low_pass_fir(input, from_rate, to_rate, taps)
    } else {
        input.to_vec()
    };
    resample_linear(&filtered, ratio)
}

/// Lightweight linear resampler used after optional filtering; fine for
/// short room-noise frames where phase accuracy matters less than latency.
fn resample_linear(input: &[f32], ratio: f32) -> Vec<f32> {
    let input_len = input.len();
    let output_len = (input_len as f32 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_idx = i as f32 / ratio;
        let idx = src_idx.floor() as usize;
        let frac = src_idx - idx as f32;

        if idx + 1 < input_len {
            let sample = input[idx] * (1.0 - frac) + input[idx + 1] * frac;
            output.push(sample);
        } else if idx < input_len {
            output.push(input[idx]);
        } else {
            let pad = input.last().copied().unwrap_or(0.0);
            output.push(pad);
        }
    }

    output
}

/// Pick a tap count based on the decimation ratio so the FIR stays short for
/// near-equal sample rates and longer when collapsing 48 kHz into 16 kHz.
fn downsampling_tap_count(from_rate: u32, to_rate: u32) -> usize {
    let decimation_ratio = from_rate as f32 / to_rate as f32;
    let mut taps = (decimation_ratio * 4.0).ceil().max(11.0) as usize;
    if taps % 2 == 0 {
        taps += 1;
    }
    taps
}

/// Basic FIR low-pass that tames frequencies above the target Nyquist before
/// samples are dropped.
fn low_pass_fir(input: &[f32], from_rate: u32, to_rate: u32, taps: usize) -> Vec<f32> {
    if input.is_empty() || taps <= 1 {
        return input.to_vec();
    }

    let normalized_cutoff = (to_rate as f32 * 0.5 / from_rate as f32).min(0.499);
    let coeffs = design_low_pass(normalized_cutoff, taps);
    let half = taps / 2;
    let mut output = Vec::with_capacity(input.len());

    for n in 0..input.len() {
        let mut acc = 0.0;
        for (k, coeff) in coeffs.iter().enumerate() {
            if let Some(idx) = n.checked_add(k).and_then(|sum| sum.checked_sub(half)) {
                if let Some(sample) = input.get(idx) {
                    acc += *sample * coeff;
                }
            }
        }
        output.push(acc);
    }

    output
}

/// Build the normalized Hamming-windowed sinc taps used by the FIR filter.
fn design_low_pass(normalized_cutoff: f32, taps: usize) -> Vec<f32> {
    let mut coeffs = Vec::with_capacity(taps);
    let m = (taps - 1) as f32;

    for n in 0..taps {
        let centered = n as f32 - m / 2.0;
        let x = 2.0 * PI * normalized_cutoff * centered;
        let sinc = if centered == 0.0 {
            2.0 * normalized_cutoff
        } else {
            (x.sin() / (PI * centered)).min(1.0)
        };
        let window = 0.54 - 0.46 * (2.0 * PI * n as f32 / m).cos();
        coeffs.push(sinc * window);
    }

    let sum: f32 = coeffs.iter().sum();
    if sum.abs() > f32::EPSILON {
        for coeff in &mut coeffs {
            *coeff /= sum;
        }
    }
    coeffs
}

/// Trim or pad a frame to the exact sample count the caller asked for.
fn adjust_frame_length(mut data: Vec<f32>, desired: usize) -> Vec<f32> {
    if data.len() > desired {
        data.truncate(desired);
    } else if data.len() < desired {
        let pad = *data.last().unwrap_or(&0.0);
        data.resize(desired, pad);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_interleaved_channels() {
        let mut buf = Vec::new();
        append_downmixed_samples(&mut buf, &[1.0f32, 0.0, 0.5, 0.5], 2, |s| s);
        assert_eq!(buf, vec![0.5, 0.5]);
    }

    #[test]
    fn downmix_passes_mono_through() {
        let mut buf = Vec::new();
        append_downmixed_samples(&mut buf, &[1i16, -1], 1, |s| s as f32);
        assert_eq!(buf, vec![1.0, -1.0]);
    }

    #[test]
    fn resample_is_identity_at_equal_rates() {
        let input = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample(&input, 16_000, 16_000), input);
    }

    #[test]
    fn resample_scales_length_by_rate_ratio() {
        let input = vec![0.5f32; 1600];
        let up = resample(&input, 16_000, 48_000);
        assert_eq!(up.len(), 4800);
        let down = resample(&input, 16_000, 8_000);
        assert_eq!(down.len(), 800);
    }

    #[test]
    fn adjust_frame_length_truncates_and_pads() {
        assert_eq!(adjust_frame_length(vec![1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(adjust_frame_length(vec![1.0], 3), vec![1.0, 1.0, 1.0]);
        assert_eq!(adjust_frame_length(Vec::new(), 2), vec![0.0, 0.0]);
    }

    #[test]
    fn playback_feed_duplicates_mono_and_signals_drain() {
        let (tx, rx) = bounded(1);
        let mut feed = PlaybackFeed::new(vec![0.25, -0.25], 2, tx);

        let mut out = [0.0f32; 4];
        feed.fill(&mut out, |s| s);
        assert_eq!(out, [0.25, 0.25, -0.25, -0.25]);
        assert!(rx.try_recv().is_ok(), "drain should fire at the last sample");

        let mut tail = [1.0f32; 4];
        feed.fill(&mut tail, |s| s);
        assert_eq!(tail, [0.0; 4], "exhausted feed must emit silence");
    }

    #[test]
    fn playback_feed_converts_to_integer_formats() {
        let (tx, _rx) = bounded(1);
        let mut feed = PlaybackFeed::new(vec![1.0, -1.0], 1, tx);
        let mut out = [0i16; 2];
        feed.fill(&mut out, |s| (s * 32_767.0) as i16);
        assert_eq!(out, [32_767, -32_767]);
    }
}
