//! Chunked playback of a recording to an output device
//!
//! Writes are synchronous and block until the device accepts the data, so
//! the loop needs no sleeps to stay in step with real time.

use std::time::{Duration, Instant};

use crate::audio::buffer::AudioBuffer;
use crate::error::{AudioError, PlaybackError};

/// A streaming PCM sink
pub trait OutputDevice {
    /// Begin a fresh stream
    fn start(&mut self) -> Result<(), AudioError>;

    /// Queue `data`, blocking until the device has room for all of it
    fn write(&mut self, data: &[u8]) -> Result<(), AudioError>;

    /// Drain queued audio and stop the stream
    fn stop(&mut self) -> Result<(), AudioError>;

    /// Write size the device works best with
    fn preferred_chunk_size(&self) -> Option<usize> {
        None
    }
}

impl<D: OutputDevice + ?Sized> OutputDevice for Box<D> {
    fn start(&mut self) -> Result<(), AudioError> {
        (**self).start()
    }

    fn write(&mut self, data: &[u8]) -> Result<(), AudioError> {
        (**self).write(data)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        (**self).stop()
    }

    fn preferred_chunk_size(&self) -> Option<usize> {
        (**self).preferred_chunk_size()
    }
}

/// Summary of one playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackReport {
    pub bytes_written: usize,
    pub chunks_written: usize,
    pub elapsed: Duration,
}

/// How `total_bytes` splits into device writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: usize,
    pub full_chunks: usize,
    pub remainder: usize,
}

impl ChunkPlan {
    pub fn new(total_bytes: usize, chunk_size: usize) -> Result<Self, PlaybackError> {
        if chunk_size == 0 {
            return Err(PlaybackError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            chunk_size,
            full_chunks: total_bytes / chunk_size,
            remainder: total_bytes % chunk_size,
        })
    }

    pub fn total_bytes(&self) -> usize {
        self.chunk_size * self.full_chunks + self.remainder
    }
}

/// Position within one playback
struct PlaybackSession {
    offset: usize,
    chunks: usize,
}

/// Streams a recorded buffer to an output device
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaybackEngine;

impl PlaybackEngine {
    pub fn new() -> Self {
        Self
    }

    /// Play `buffer[..total_bytes]` on `device` in `chunk_size` writes.
    ///
    /// After full chunk `i` of `n`, `progress` receives `i * 100 / n`. The
    /// remainder chunk is written last without a progress report. The device
    /// is always stopped before returning, including on failure.
    pub fn play<D, P>(
        &self,
        device: &mut D,
        buffer: &AudioBuffer,
        total_bytes: usize,
        chunk_size: usize,
        mut progress: P,
    ) -> Result<PlaybackReport, PlaybackError>
    where
        D: OutputDevice + ?Sized,
        P: FnMut(u8),
    {
        let plan = ChunkPlan::new(total_bytes, chunk_size)?;
        if total_bytes > buffer.capacity() {
            return Err(PlaybackError::OutOfRange {
                capacity: buffer.capacity(),
                requested: total_bytes,
            });
        }

        tracing::info!(
            "Playing {} bytes in {} chunks of {} (+{} remainder)",
            total_bytes,
            plan.full_chunks,
            plan.chunk_size,
            plan.remainder
        );

        let started = Instant::now();
        device.start()?;

        let result = write_chunks(device, &buffer.as_slice()[..total_bytes], &plan, &mut progress);
        let stopped = device.stop();

        let session = result?;
        stopped?;

        let report = PlaybackReport {
            bytes_written: session.offset,
            chunks_written: session.chunks,
            elapsed: started.elapsed(),
        };
        tracing::info!("Playback complete in {:?}", report.elapsed);
        Ok(report)
    }
}

fn write_chunks<D, P>(
    device: &mut D,
    data: &[u8],
    plan: &ChunkPlan,
    progress: &mut P,
) -> Result<PlaybackSession, PlaybackError>
where
    D: OutputDevice + ?Sized,
    P: FnMut(u8),
{
    let mut session = PlaybackSession { offset: 0, chunks: 0 };

    for i in 0..plan.full_chunks {
        let end = session.offset + plan.chunk_size;
        device.write(&data[session.offset..end]).map_err(|e| {
            tracing::error!("Playback error at chunk {}: {}", i, e);
            e
        })?;
        session.offset = end;
        session.chunks += 1;

        progress((i * 100 / plan.full_chunks) as u8);
    }

    if plan.remainder > 0 {
        device.write(&data[session.offset..])?;
        session.offset += plan.remainder;
        session.chunks += 1;
    }

    Ok(session)
}
