//! Fixed-capacity PCM buffer shared between capture and playback
//!
//! The buffer is allocated once from the configured format and duration and is
//! never resized. Capture overwrites it, playback only reads it.

use std::time::Duration;

use crate::constants::{BYTES_PER_SAMPLE, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

/// Raw PCM layout on the wire and on the output device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
}

impl PcmFormat {
    /// Bytes per interleaved frame
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    /// Number of bytes needed to hold `duration` of audio.
    ///
    /// Rounded down to a whole frame.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = self.sample_rate as u128 * duration.as_millis() / 1000;
        frames as usize * self.frame_bytes()
    }

    /// Playback duration of `bytes` of audio
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.frame_bytes()) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate as u64)
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            bytes_per_sample: BYTES_PER_SAMPLE,
        }
    }
}

/// Fixed-size byte buffer holding one recording
pub struct AudioBuffer {
    data: Vec<u8>,
}

impl AudioBuffer {
    /// Allocate a zeroed buffer of exactly `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
        }
    }

    /// Allocate a buffer sized for `duration` of audio in `format`
    pub fn for_duration(format: &PcmFormat, duration: Duration) -> Self {
        Self::new(format.bytes_for(duration))
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Writable tail of the buffer starting at `offset`, clamped to `end`
    pub(crate) fn write_window(&mut self, offset: usize, end: usize) -> &mut [u8] {
        let end = end.min(self.data.len());
        let start = offset.min(end);
        &mut self.data[start..end]
    }

}
