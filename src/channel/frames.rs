use super::types::AudioFrame;
use ringbuf::{traits::*, HeapRb};

/// The classifier ignores frames shorter than this
pub const MIN_FRAME_SAMPLES: usize = 2048;

/// Accumulates samples and cuts them into fixed-size outbound frames
///
/// Backed by a ring buffer: when producers outrun the channel, the oldest
/// samples are overwritten rather than growing without bound.
pub struct FrameBatcher {
    buffer: HeapRb<f32>,
    frame_len: usize,
    sample_rate: u32,
    overwritten: usize,
}

impl FrameBatcher {
    /// `capacity_frames` whole frames can be buffered before overwriting
    pub fn new(frame_len: usize, sample_rate: u32, capacity_frames: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            buffer: HeapRb::new(frame_len * capacity_frames.max(1)),
            frame_len,
            sample_rate,
            overwritten: 0,
        }
    }

    /// Append samples, dropping the oldest ones when full
    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.buffer.try_push(sample).is_err() {
                let _ = self.buffer.try_pop();
                let _ = self.buffer.try_push(sample);
                self.overwritten += 1;
            }
        }
    }

    /// Next full frame, if enough samples are buffered
    pub fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.buffer.occupied_len() < self.frame_len {
            return None;
        }
        let chunk: Vec<f32> = self.buffer.pop_iter().take(self.frame_len).collect();
        Some(AudioFrame::new(chunk, self.sample_rate))
    }

    /// Whatever is left as a short final frame
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let chunk: Vec<f32> = self.buffer.pop_iter().collect();
        Some(AudioFrame::new(chunk, self.sample_rate))
    }

    pub fn len(&self) -> usize {
        self.buffer.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples lost to overwriting since creation
    pub fn overwritten(&self) -> usize {
        self.overwritten
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
