//! Per-tap volume envelope for the synthesized echo.

/// Build the sequence of per-tap volume multipliers.
///
/// A single tap collapses to `[start_vol]`; otherwise the taps are linearly
/// interpolated from `start_vol` to `end_vol` with both endpoints exact.
pub fn envelope(taps: u32, start_vol: f32, end_vol: f32) -> Vec<f32> {
    if taps <= 1 {
        return vec![start_vol];
    }
    let span = end_vol - start_vol;
    let last = (taps - 1) as f32;
    (0..taps)
        .map(|i| {
            if i == taps - 1 {
                end_vol
            } else {
                start_vol + span * (i as f32 / last)
            }
        })
        .collect()
}
