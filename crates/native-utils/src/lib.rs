//! Native audio output for the Vozia client.
//!
//! Incoming PCM16 chunks are scheduled back to back on an audio-frame clock,
//! metered for a live volume level and played on the default output device
//! (or rendered on demand when running headless).

pub mod audio_utils;
pub mod device;
pub mod meter;
pub mod pipeline;
pub mod scheduler;

pub use device::{DeviceInfo, DeviceInitError, DeviceState};
pub use meter::VolumeMeter;
pub use pipeline::{AudioPipeline, PipelineConfig};
pub use scheduler::{PlaybackScheduler, PlaybackStats, ScheduledChunk};
