// Sample rate conversion using rubato
// Stems are converted once, at load, to the output device's rate
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

use crate::error::PlayerError;

/// Resample interleaved audio from `input_rate` to `output_rate`.
/// Returns the input untouched when the rates already match.
pub fn resample(
    input: Vec<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
) -> Result<Vec<f32>, PlayerError> {
    if input_rate == output_rate || channels == 0 || input.len() < channels {
        return Ok(input);
    }

    debug!(
        "Resampling from {}Hz to {}Hz ({} channels)",
        input_rate, output_rate, channels
    );

    let planar = deinterleave(&input, channels);
    let frames = planar[0].len();

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Cubic,
        frames,
        channels,
    )
    .map_err(|e| PlayerError::Decode(format!("Failed to create resampler: {}", e)))?;

    let output = resampler
        .process(&planar, None)
        .map_err(|e| PlayerError::Decode(format!("Resampling failed: {}", e)))?;

    Ok(interleave(&output))
}

fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            planar[ch].push(*sample);
        }
    }
    planar
}

fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let frames = planar.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * planar.len());
    for frame in 0..frames {
        for channel in planar {
            out.push(channel[frame]);
        }
    }
    out
}
