//! Output level metering.

/// Tracks the loudness of what is being played.
///
/// Each block yields its RMS; the reported level is the larger of that RMS
/// and the previous level times `decay`, so peaks fall off smoothly.
#[derive(Debug, Clone)]
pub struct VolumeMeter {
    level: f32,
    decay: f32,
}

pub const DEFAULT_DECAY: f32 = 0.7;

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY)
    }
}

impl VolumeMeter {
    pub fn new(decay: f32) -> Self {
        Self { level: 0.0, decay }
    }

    /// Feeds one rendered block and returns the updated level in `[0, 1]`.
    pub fn process(&mut self, block: &[f32]) -> f32 {
        let rms = rms(block);
        self.level = rms.max(self.level * self.decay).clamp(0.0, 1.0);
        self.level
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

pub fn rms(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f32 = block.iter().map(|s| s * s).sum();
    (sum / block.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn rms_of_known_signals() {
        assert_eq!(rms(&[]), 0.0);
        assert_abs_diff_eq!(rms(&[0.5; 64]), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(rms(&[1.0, -1.0, 1.0, -1.0]), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn level_decays_after_a_peak() {
        let mut meter = VolumeMeter::default();
        assert_abs_diff_eq!(meter.process(&[0.8; 10]), 0.8, epsilon = 1e-6);
        assert_abs_diff_eq!(meter.process(&[0.0; 10]), 0.56, epsilon = 1e-6);
        assert_abs_diff_eq!(meter.process(&[0.0; 10]), 0.392, epsilon = 1e-6);
        // a louder block takes over immediately
        assert_abs_diff_eq!(meter.process(&[0.9; 10]), 0.9, epsilon = 1e-6);
    }

    #[test]
    fn silence_converges_to_zero() {
        let mut meter = VolumeMeter::default();
        meter.process(&[1.0; 10]);
        for _ in 0..100 {
            meter.process(&[0.0; 10]);
        }
        assert!(meter.level() < 1e-6);
    }

    #[test]
    fn reset_zeroes_the_level() {
        let mut meter = VolumeMeter::default();
        meter.process(&[0.4; 10]);
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }
}
