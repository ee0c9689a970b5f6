//! Output device backend.
//!
//! A dedicated thread owns the cpal stream (streams are not `Send` on every
//! host). It renders 10 ms blocks from the scheduler, converts them to the
//! device rate and channel layout, and keeps a lock-free ring topped up for
//! the realtime callback.

use crate::audio_utils::{create_resampler, frames_for_ms};
use crate::pipeline::Shared;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig, SupportedStreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rubato::{FastFixedIn, Resampler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Size of one rendered block, and the cadence of volume updates.
pub const BLOCK_MS: u64 = 10;
/// How much converted audio the feeder keeps ahead of the callback.
const LEAD_MS: u64 = 80;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceInitError {
    #[error("pipeline was created without an output device")]
    Disabled,
    #[error("no default output device")]
    NoOutputDevice,
    #[error("no usable output configuration: {0}")]
    Config(String),
    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to build output stream: {0}")]
    BuildStream(String),
    #[error("failed to start output stream: {0}")]
    Play(String),
    #[error("failed to build device resampler: {0}")]
    Resampler(String),
    #[error("failed to spawn audio thread: {0}")]
    Thread(String),
    #[error("audio thread exited before the device was ready")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    /// Headless pipeline; audio is only rendered through `pull`.
    Disabled,
    /// Not opened yet. The device is opened on the first chunk.
    Idle,
    Starting,
    Ready(DeviceInfo),
    Failed(DeviceInitError),
}

/// Handle to the audio thread. Dropping it stops the stream and joins the thread.
pub(crate) struct OutputDevice {
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputDevice {
    pub(crate) fn spawn(shared: Arc<Shared>) -> Result<Self, DeviceInitError> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("vozia-audio-out".into())
            .spawn(move || run(shared, shutdown_rx))
            .map_err(|e| DeviceInitError::Thread(e.to_string()))?;
        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run(shared: Arc<Shared>, shutdown: mpsc::Receiver<()>) {
    let (stream, mut feeder) = match open(&shared) {
        Ok(opened) => opened,
        Err(e) => {
            warn!(error = %e, "Audio output unavailable, continuing without playback");
            shared.set_device_state(DeviceState::Failed(e));
            return;
        }
    };
    info!(
        sample_rate = feeder.info.sample_rate,
        channels = feeder.info.channels,
        "Audio output started"
    );
    shared.set_device_state(DeviceState::Ready(feeder.info));

    let tick = Duration::from_millis(BLOCK_MS / 2);
    loop {
        feeder.fill(&shared);
        match shutdown.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(stream);
    debug!("Audio output stopped");
}

struct Feeder {
    info: DeviceInfo,
    producer: HeapProd<f32>,
    resampler: Option<FastFixedIn<f32>>,
    block: Vec<f32>,
    lead_samples: usize,
    /// Stop generation of the last rendered block.
    generation: u64,
}

impl Feeder {
    fn fill(&mut self, shared: &Shared) {
        while self.producer.occupied_len() < self.lead_samples {
            let (_, generation) = shared.render(&mut self.block);
            if !self.push_block(shared, generation) {
                return;
            }
        }
    }

    /// Converts the current block and queues it for the callback. A block
    /// rendered before the latest stop is dropped. Returns false on a
    /// conversion error.
    fn push_block(&mut self, shared: &Shared, generation: u64) -> bool {
        if generation != self.generation {
            self.generation = generation;
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.reset();
            }
        }
        let frames = match self.resampler.as_mut() {
            Some(resampler) => match resampler.process(&[&self.block[..]][..], None) {
                Ok(mut out) => out.swap_remove(0),
                Err(e) => {
                    warn!(error = %e, "Failed to resample output block");
                    return false;
                }
            },
            None => self.block.clone(),
        };
        if shared.generation() != generation {
            return true;
        }
        let channels = self.info.channels as usize;
        let interleaved: Vec<f32> = frames
            .iter()
            .flat_map(|s| std::iter::repeat_n(*s, channels))
            .collect();
        self.producer.push_slice(&interleaved);
        // a stop raced the push; its flush may already have been consumed
        if shared.generation() != generation {
            shared.request_flush();
        }
        true
    }
}

fn open(shared: &Shared) -> Result<(cpal::Stream, Feeder), DeviceInitError> {
    let source_rate = shared.sample_rate();
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceInitError::NoOutputDevice)?;
    let supported = choose_config(&device, source_rate)?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let info = DeviceInfo {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let block_frames = frames_for_ms(source_rate, BLOCK_MS);
    let resampler = if info.sample_rate != source_rate {
        let resampler = create_resampler(source_rate as f64, info.sample_rate as f64, block_frames)
            .map_err(|e| DeviceInitError::Resampler(e.to_string()))?;
        Some(resampler)
    } else {
        None
    };

    let lead_samples = frames_for_ms(info.sample_rate, LEAD_MS) * info.channels as usize;
    let (producer, consumer) = HeapRb::<f32>::new(lead_samples * 4).split();
    let flush = shared.flush_flag();
    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, flush),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, flush),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer, flush),
        other => Err(DeviceInitError::UnsupportedFormat(format!("{other:?}"))),
    }?;
    stream
        .play()
        .map_err(|e| DeviceInitError::Play(e.to_string()))?;

    let feeder = Feeder {
        info,
        producer,
        resampler,
        block: vec![0.0; block_frames],
        lead_samples,
        generation: shared.generation(),
    };
    Ok((stream, feeder))
}

/// Prefers a config at the playback rate (f32, fewest channels), falling back
/// to the device default.
fn choose_config(
    device: &cpal::Device,
    rate: u32,
) -> Result<SupportedStreamConfig, DeviceInitError> {
    let preferred = device.supported_output_configs().ok().and_then(|configs| {
        let mut candidates: Vec<_> = configs
            .filter(|c| c.channels() > 0)
            .filter(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
            .collect();
        candidates.sort_by_key(|c| (c.sample_format() != SampleFormat::F32, c.channels()));
        candidates
            .into_iter()
            .next()
            .map(|c| c.with_sample_rate(cpal::SampleRate(rate)))
    });
    match preferred {
        Some(config) => Ok(config),
        None => device
            .default_output_config()
            .map_err(|e| DeviceInitError::Config(e.to_string())),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
    flush: Arc<AtomicBool>,
) -> Result<cpal::Stream, DeviceInitError>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if flush.swap(false, Ordering::AcqRel) {
                    let stale = consumer.occupied_len();
                    consumer.skip(stale);
                }
                for sample in data.iter_mut() {
                    *sample = T::from_sample(consumer.try_pop().unwrap_or(0.0));
                }
            },
            |err| warn!(error = %err, "Audio output stream error"),
            None,
        )
        .map_err(|e| DeviceInitError::BuildStream(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AudioPipeline, PipelineConfig};

    fn feeder(shared: &Shared, resampler: Option<FastFixedIn<f32>>) -> (Feeder, HeapCons<f32>) {
        let (producer, consumer) = HeapRb::<f32>::new(4800).split();
        let feeder = Feeder {
            info: DeviceInfo {
                sample_rate: 24_000,
                channels: 2,
            },
            producer,
            resampler,
            block: vec![0.0; 240],
            lead_samples: 960,
            generation: shared.generation(),
        };
        (feeder, consumer)
    }

    fn drain(consumer: &mut HeapCons<f32>) -> Vec<f32> {
        std::iter::from_fn(|| consumer.try_pop()).collect()
    }

    #[test]
    fn fill_interleaves_queued_audio_up_to_the_lead() {
        let pipeline = AudioPipeline::headless(PipelineConfig::default());
        pipeline.add_pcm16(&[16384; 2400], 24_000);
        let shared = pipeline.shared();
        let (mut feeder, mut consumer) = feeder(shared, None);

        feeder.fill(shared);

        let queued = drain(&mut consumer);
        assert_eq!(queued.len(), 960);
        assert!(queued.iter().all(|s| *s == 0.5));
    }

    #[test]
    fn block_rendered_before_a_stop_is_not_queued() {
        let pipeline = AudioPipeline::headless(PipelineConfig::default());
        pipeline.add_pcm16(&[16384; 2400], 24_000);
        let shared = pipeline.shared();
        let (mut feeder, mut consumer) = feeder(shared, None);

        let (played, generation) = shared.render(&mut feeder.block);
        assert_eq!(played, 240);
        pipeline.stop();
        assert!(feeder.push_block(shared, generation));
        assert!(drain(&mut consumer).is_empty());

        feeder.fill(shared);
        let queued = drain(&mut consumer);
        assert_eq!(queued.len(), 960);
        assert!(queued.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn stop_resets_the_device_resampler() {
        let pipeline = AudioPipeline::headless(PipelineConfig::default());
        pipeline.add_pcm16(&[16384; 4800], 24_000);
        let shared = pipeline.shared();
        let resampler = create_resampler(24_000.0, 48_000.0, 240).unwrap();
        let (mut feeder, mut consumer) = feeder(shared, Some(resampler));

        feeder.fill(shared);
        assert!(drain(&mut consumer).iter().any(|s| s.abs() > 0.1));

        pipeline.stop();
        feeder.fill(shared);
        assert_eq!(feeder.generation, shared.generation());
        // only silence is rendered after the stop, and no delayed audio leaks out
        let queued = drain(&mut consumer);
        assert!(!queued.is_empty());
        assert!(queued.iter().all(|s| s.abs() < 1e-6));
    }
}
