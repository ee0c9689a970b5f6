//! Audio output pipeline: PCM16 chunks in, gapless playback and an output
//! level out.
//!
//! A pipeline runs either headless, where the host drives the clock through
//! [`AudioPipeline::pull`], or against the default output device, which is
//! opened on the first chunk and pulls audio in real time.

use crate::audio_utils::{PLAYBACK_SAMPLE_RATE, convert_i16_to_f32, frames_for_ms, resample};
use crate::device::{BLOCK_MS, DeviceInfo, DeviceInitError, DeviceState, OutputDevice};
use crate::meter::{DEFAULT_DECAY, VolumeMeter};
use crate::scheduler::{PlaybackScheduler, PlaybackStats, ScheduledChunk};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

/// Cap on unplayed audio before the oldest chunks are dropped.
pub const DEFAULT_MAX_BUFFERED: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rate of the playback clock. Chunks at other rates are resampled.
    pub sample_rate: u32,
    pub max_buffered: Duration,
    pub volume_decay: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: PLAYBACK_SAMPLE_RATE,
            max_buffered: DEFAULT_MAX_BUFFERED,
            volume_decay: DEFAULT_DECAY,
        }
    }
}

/// State shared between the pipeline handle and the audio thread.
pub(crate) struct Shared {
    sample_rate: u32,
    block_frames: usize,
    scheduler: Mutex<PlaybackScheduler>,
    meter: Mutex<VolumeMeter>,
    volume: watch::Sender<f32>,
    device: watch::Sender<DeviceState>,
    flush: Arc<AtomicBool>,
    /// Bumped by every stop, under the scheduler lock.
    generation: AtomicU64,
}

impl Shared {
    pub(crate) fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub(crate) fn flush_flag(&self) -> Arc<AtomicBool> {
        self.flush.clone()
    }

    pub(crate) fn set_device_state(&self, state: DeviceState) {
        self.device.send_replace(state);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Asks the device callback to drop everything queued in its ring.
    pub(crate) fn request_flush(&self) {
        self.flush.store(true, Ordering::Release);
    }

    /// Renders the next frames and meters them in 10 ms blocks.
    ///
    /// Returns the frames played and the stop generation they belong to.
    pub(crate) fn render(&self, out: &mut [f32]) -> (usize, u64) {
        let mut scheduler = lock(&self.scheduler);
        let generation = self.generation();
        let played = scheduler.render(out);
        let level = {
            let mut meter = lock(&self.meter);
            for block in out.chunks(self.block_frames) {
                meter.process(block);
            }
            meter.level()
        };
        drop(scheduler);
        self.publish_volume(level);
        (played, generation)
    }

    fn publish_volume(&self, level: f32) {
        self.volume.send_if_modified(|current| {
            if *current == level {
                false
            } else {
                *current = level;
                true
            }
        });
    }
}

pub struct AudioPipeline {
    shared: Arc<Shared>,
    device: Mutex<Option<OutputDevice>>,
}

impl AudioPipeline {
    /// A pipeline with no output device. Audio plays only as fast as
    /// [`pull`](Self::pull) is called.
    pub fn headless(config: PipelineConfig) -> Self {
        Self::build(config, DeviceState::Disabled)
    }

    /// A pipeline that opens the default output device on the first chunk.
    pub fn with_device(config: PipelineConfig) -> Self {
        Self::build(config, DeviceState::Idle)
    }

    fn build(config: PipelineConfig, device: DeviceState) -> Self {
        let max_frames = (config.max_buffered.as_secs_f64() * config.sample_rate as f64) as usize;
        let shared = Shared {
            sample_rate: config.sample_rate,
            block_frames: frames_for_ms(config.sample_rate, BLOCK_MS).max(1),
            scheduler: Mutex::new(PlaybackScheduler::new(max_frames)),
            meter: Mutex::new(VolumeMeter::new(config.volume_decay)),
            volume: watch::Sender::new(0.0),
            device: watch::Sender::new(device),
            flush: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            device: Mutex::new(None),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// Queues one chunk of mono PCM16 right after everything already queued.
    ///
    /// # Arguments
    /// * `samples` - Mono PCM16 samples
    /// * `sample_rate` - Rate of `samples`; converted when it differs from the pipeline rate
    ///
    /// # Returns
    /// Where the chunk landed on the playback clock, or `None` if it was empty
    /// or could not be converted.
    pub fn add_pcm16(&self, samples: &[i16], sample_rate: u32) -> Option<ScheduledChunk> {
        if samples.is_empty() {
            return None;
        }
        let mut pcm = convert_i16_to_f32(samples);
        if sample_rate != self.shared.sample_rate {
            pcm = match resample(&pcm, sample_rate, self.shared.sample_rate) {
                Ok(converted) => converted,
                Err(e) => {
                    error!(
                        error = %e,
                        from = sample_rate,
                        to = self.shared.sample_rate,
                        "Dropping audio chunk"
                    );
                    return None;
                }
            };
        }

        let scheduled = lock(&self.shared.scheduler).enqueue(pcm);
        if let Some(chunk) = scheduled {
            trace!(start = chunk.start_frame, frames = chunk.frames, "Scheduled audio chunk");
        }
        self.ensure_device();
        scheduled
    }

    /// Stops playback immediately: queued audio is discarded, the device ring
    /// is flushed and the volume drops to 0.
    pub fn stop(&self) {
        let discarded = {
            let mut scheduler = lock(&self.shared.scheduler);
            let discarded = scheduler.stop();
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            lock(&self.shared.meter).reset();
            self.shared.publish_volume(0.0);
            discarded
        };
        self.shared.request_flush();
        debug!(discarded_frames = discarded, "Playback stopped");
    }

    /// Renders the next `out.len()` frames, advancing the playback clock.
    ///
    /// This is how a headless pipeline is played. With a running device the
    /// frames pulled here are taken away from the device.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        self.shared.render(out).0
    }

    /// Current output level in `[0, 1]`, updated per rendered block.
    pub fn volume(&self) -> watch::Receiver<f32> {
        self.shared.volume.subscribe()
    }

    pub fn stats(&self) -> PlaybackStats {
        lock(&self.shared.scheduler).stats()
    }

    pub fn device_state(&self) -> DeviceState {
        self.shared.device.borrow().clone()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Opens the output device now and waits until it is ready or has failed.
    pub async fn open_device(&self) -> Result<DeviceInfo, DeviceInitError> {
        self.ensure_device();
        let mut rx = self.shared.device.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, DeviceState::Idle | DeviceState::Starting))
            .await
            .map_err(|_| DeviceInitError::Aborted)?;
        match &*state {
            DeviceState::Ready(info) => Ok(*info),
            DeviceState::Failed(e) => Err(e.clone()),
            DeviceState::Disabled => Err(DeviceInitError::Disabled),
            DeviceState::Idle | DeviceState::Starting => Err(DeviceInitError::Aborted),
        }
    }

    /// Starts the audio thread once. Failures are reported by the thread, a
    /// single time, and the pipeline keeps running without sound.
    fn ensure_device(&self) {
        if !matches!(*self.shared.device.borrow(), DeviceState::Idle) {
            return;
        }
        let mut slot = lock(&self.device);
        if slot.is_some() {
            return;
        }
        self.shared.set_device_state(DeviceState::Starting);
        match OutputDevice::spawn(self.shared.clone()) {
            Ok(device) => *slot = Some(device),
            Err(e) => {
                warn!(error = %e, "Audio output unavailable, continuing without playback");
                self.shared.set_device_state(DeviceState::Failed(e));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
