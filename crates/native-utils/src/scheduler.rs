//! Gapless playback scheduling against an audio-frame clock.
//!
//! The clock only moves when frames are rendered, so whoever pulls audio
//! (the output device or a test) defines "now". Each enqueued chunk starts
//! exactly where the previous one ends, or at the current clock position when
//! nothing is queued.

use std::collections::VecDeque;
use tracing::warn;

/// Where an enqueued chunk landed on the playback clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub start_frame: u64,
    pub frames: usize,
}

impl ScheduledChunk {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.frames as u64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    /// Frames rendered so far, silence included.
    pub clock: u64,
    pub queued_frames: usize,
    pub queued_chunks: usize,
    /// Chunks discarded because the queue hit its cap.
    pub dropped_chunks: u64,
}

struct QueuedChunk {
    samples: Vec<f32>,
    offset: usize,
}

impl QueuedChunk {
    fn remaining(&self) -> usize {
        self.samples.len() - self.offset
    }
}

pub struct PlaybackScheduler {
    clock: u64,
    queue: VecDeque<QueuedChunk>,
    queued_frames: usize,
    max_queued_frames: usize,
    dropped_chunks: u64,
}

impl PlaybackScheduler {
    /// # Arguments
    /// * `max_queued_frames` - Cap on unplayed audio. When exceeded, the oldest
    ///   unplayed chunks are dropped; the newest chunk is always kept.
    pub fn new(max_queued_frames: usize) -> Self {
        Self {
            clock: 0,
            queue: VecDeque::new(),
            queued_frames: 0,
            max_queued_frames,
            dropped_chunks: 0,
        }
    }

    /// Schedules `samples` right after everything already queued.
    ///
    /// # Returns
    /// The placement of the chunk, or `None` for an empty chunk.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> Option<ScheduledChunk> {
        if samples.is_empty() {
            return None;
        }
        let frames = samples.len();
        self.queue.push_back(QueuedChunk { samples, offset: 0 });
        self.queued_frames += frames;
        self.enforce_cap();

        Some(ScheduledChunk {
            start_frame: self.scheduled_end() - frames as u64,
            frames,
        })
    }

    fn enforce_cap(&mut self) {
        while self.queued_frames > self.max_queued_frames && self.queue.len() > 1 {
            if let Some(oldest) = self.queue.pop_front() {
                self.queued_frames -= oldest.remaining();
                self.dropped_chunks += 1;
                warn!(
                    dropped_frames = oldest.remaining(),
                    dropped_chunks = self.dropped_chunks,
                    "Playback queue full; dropping oldest audio"
                );
            }
        }
    }

    /// Fills `out` with the next frames and advances the clock by `out.len()`.
    /// Frames with nothing scheduled are silence.
    ///
    /// # Returns
    /// How many frames came from queued audio.
    pub fn render(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            let n = front.remaining().min(out.len() - written);
            out[written..written + n]
                .copy_from_slice(&front.samples[front.offset..front.offset + n]);
            front.offset += n;
            written += n;
            if front.remaining() == 0 {
                self.queue.pop_front();
            }
        }
        out[written..].fill(0.0);
        self.queued_frames -= written;
        self.clock += out.len() as u64;
        written
    }

    /// Discards everything not yet rendered. The clock keeps its position, so
    /// the next chunk starts at "now".
    ///
    /// # Returns
    /// The number of discarded frames.
    pub fn stop(&mut self) -> usize {
        let discarded = self.queued_frames;
        self.queue.clear();
        self.queued_frames = 0;
        discarded
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Clock position at which the last queued frame finishes.
    pub fn scheduled_end(&self) -> u64 {
        self.clock + self.queued_frames as u64
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            clock: self.clock,
            queued_frames: self.queued_frames,
            queued_chunks: self.queue.len(),
            dropped_chunks: self.dropped_chunks,
        }
    }
}
