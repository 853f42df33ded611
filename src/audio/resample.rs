//! Sample-rate conversion
//!
//! Capture resamples the device rate down to the 16 kHz wire rate before
//! encoding; playback resamples 24 kHz chunks up to the output device rate.

/// Resample `samples` from `from_rate` to `to_rate` by linear interpolation.
///
/// Returns the input unchanged when the rates already match. Device rates
/// are rarely integer multiples of the wire rates (44.1 kHz vs 24 kHz), so
/// interpolation is used rather than decimation.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    if from_rate == 0 || to_rate == 0 {
        log::warn!("Resample: invalid rates {} -> {}", from_rate, to_rate);
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = if idx + 1 < samples.len() {
            samples[idx + 1]
        } else {
            a
        };
        out.push(a + (b - a) * frac);
    }

    out
}
