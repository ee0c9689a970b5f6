use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use thiserror::Error;

/// Rate the Live service speaks at, and the rate the playback clock runs at.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Frames per resampler call when converting a whole chunk.
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("failed to build resampler: {0}")]
    Construction(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed: {0}")]
    Process(#[from] rubato::ResampleError),
}

/// Creates a mono resampler converting `in_sampling_rate` to `out_sampling_rate`.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, ResampleError> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Resamples one self-contained mono buffer.
///
/// The resampler delay is trimmed and the tail flushed, so the output starts
/// at the first input sample and holds `len * to / from` frames (rounded).
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>, ResampleError> {
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = create_resampler(from as f64, to as f64, RESAMPLE_CHUNK)?;
    let expected = (samples.len() as f64 * to as f64 / from as f64).round() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pos = 0;
    while samples.len() - pos >= resampler.input_frames_next() {
        let n = resampler.input_frames_next();
        let block = [&samples[pos..pos + n]];
        let frames = resampler.process(&block[..], None)?;
        out.extend_from_slice(&frames[0]);
        pos += n;
    }
    if pos < samples.len() {
        let tail = [&samples[pos..]];
        let frames = resampler.process_partial(Some(&tail[..]), None)?;
        out.extend_from_slice(&frames[0]);
    }
    while out.len() < expected + delay {
        let frames = resampler.process_partial::<&[f32]>(None, None)?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    out.drain(..delay.min(out.len()));
    out.truncate(expected);
    Ok(out)
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Number of frames covering `ms` milliseconds at `sample_rate`.
pub fn frames_for_ms(sample_rate: u32, ms: u64) -> usize {
    (sample_rate as u64 * ms / 1000) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(16000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 24000.0, 1024).is_ok());
        assert!(create_resampler(48000.0, 24000.0, 1024).is_ok());
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let input = vec![0.1f32, -0.2, 0.3];
        assert_eq!(resample(&input, 24_000, 24_000).unwrap(), input);
        assert!(resample(&[], 16_000, 24_000).unwrap().is_empty());
    }

    #[test]
    fn test_resample_output_length() {
        // 100 ms at 16 kHz becomes 100 ms at 24 kHz
        let input = vec![0.25f32; 1600];
        let output = resample(&input, 16_000, 24_000).unwrap();
        assert_eq!(output.len(), 2400);

        let output = resample(&vec![0.25f32; 4800], 48_000, 24_000).unwrap();
        assert_eq!(output.len(), 2400);
    }

    #[test]
    fn test_resample_preserves_level_of_constant_signal() {
        let output = resample(&vec![0.5f32; 3200], 16_000, 24_000).unwrap();
        // skip the edges, where the interpolation sees the implicit silence
        for sample in &output[100..output.len() - 100] {
            assert_abs_diff_eq!(*sample, 0.5, epsilon = 0.01);
        }
    }

    #[test]
    fn test_convert_i16_to_f32() {
        let input = vec![i16::MAX, i16::MIN, 0i16, 16384i16];
        let result = convert_i16_to_f32(&input);

        assert_eq!(result.len(), 4);
        assert_abs_diff_eq!(result[0], i16::MAX as f32 / 32768.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[1], -1.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[2], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(result[3], 0.5, epsilon = 0.0001);
        assert!(convert_i16_to_f32(&[]).is_empty());
    }

    #[test]
    fn test_frames_for_ms() {
        assert_eq!(frames_for_ms(24_000, 10), 240);
        assert_eq!(frames_for_ms(44_100, 10), 441);
        assert_eq!(frames_for_ms(24_000, 60_000), 1_440_000);
    }
}
