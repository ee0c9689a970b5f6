//! The seam between the session controller and audio output.

use tokio::sync::watch;
use vozia_native_utils::AudioPipeline;

/// Where decoded model speech goes.
///
/// Implemented by [`AudioPipeline`]; tests substitute a mock.
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackSink: Send + Sync {
    /// Queues a chunk of mono PCM16 behind everything already queued.
    fn add_pcm16(&self, samples: &[i16], sample_rate: u32);

    /// Drops all queued audio and silences output now.
    fn stop(&self);

    /// Output level in `[0, 1]`.
    fn volume(&self) -> watch::Receiver<f32>;
}

impl PlaybackSink for AudioPipeline {
    fn add_pcm16(&self, samples: &[i16], sample_rate: u32) {
        AudioPipeline::add_pcm16(self, samples, sample_rate);
    }

    fn stop(&self) {
        AudioPipeline::stop(self);
    }

    fn volume(&self) -> watch::Receiver<f32> {
        AudioPipeline::volume(self)
    }
}
