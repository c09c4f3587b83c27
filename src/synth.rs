//! Multi-tap echo buffer synthesis.
//!
//! Builds the full output waveform for one triggering frame: the dry signal
//! followed by `taps` delayed, attenuated copies. With feedback enabled each
//! tap after the first folds in a fraction of the buffer content one delay
//! block behind it, so the echoes cascade instead of staying discrete.

use crate::config::EchoParams;
use crate::envelope::envelope;
use anyhow::{bail, Result};

/// Synthesize the echo buffer for `input` using a parameter snapshot taken at
/// trigger time. Returns the accumulated (pre-clipping) buffer and the
/// envelope that shaped it.
///
/// Taps whose placement window would run past the end of the buffer are
/// silently dropped; the buffer is never grown to fit them.
pub fn synthesize(input: &[f32], params: &EchoParams, sample_rate: u32) -> Result<(Vec<f32>, Vec<f32>)> {
    if input.is_empty() {
        bail!("cannot synthesize an echo from an empty frame");
    }

    let n_samples = input.len();
    let delay_samples = (params.delay_sec as f64 * sample_rate as f64) as usize;
    let env = envelope(params.taps, params.start_vol, params.end_vol);

    let mut out = vec![0.0f32; n_samples + delay_samples * params.taps as usize];
    for (slot, sample) in out.iter_mut().zip(input.iter()) {
        *slot += sample;
    }

    for (i, gain) in env.iter().enumerate() {
        let start = delay_samples * (i + 1);
        let end = start + n_samples;
        if end > out.len() {
            break;
        }
        let mut wet: Vec<f32> = input.iter().map(|s| s * gain).collect();
        if params.feedback > 0.0 && i > 0 {
            let prev_start = start - delay_samples;
            for (j, slot) in wet.iter_mut().enumerate() {
                *slot += out[prev_start + j] * params.feedback;
            }
        }
        for (j, sample) in wet.iter().enumerate() {
            out[start + j] += sample;
        }
    }

    Ok((out, env))
}

/// Hard-clip a buffer to the valid sample range. Deliberate distortion policy:
/// clamp, never rescale.
pub fn clip(mut buffer: Vec<f32>) -> Vec<f32> {
    for sample in &mut buffer {
        *sample = sample.clamp(-1.0, 1.0);
    }
    buffer
}
