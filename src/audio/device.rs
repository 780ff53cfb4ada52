//! Output device enumeration and the cpal-backed [`OutputDevice`]
//!
//! cpal pulls samples from a callback, while playback pushes them with
//! blocking writes. A small bounded channel of sample batches sits between
//! the two: `write` blocks once the channel is full, which paces playback at
//! the device rate. Batches have a minimum size so the queued audio does not
//! shrink with the caller's write size.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TryRecvError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::buffer::PcmFormat;
use crate::audio::playback::OutputDevice;
use crate::constants::DEFAULT_CHUNK_BYTES;
use crate::error::AudioError;

/// Sample batches that may be queued ahead of the device
const QUEUE_DEPTH: usize = 4;

/// Smallest batch handed to the callback, in mono samples
const MIN_BATCH_SAMPLES: usize = 4096;

/// Slack on top of the queued audio before a blocked write gives up
const WRITE_MARGIN: Duration = Duration::from_secs(1);

/// Upper bound on waiting for queued audio to finish during `stop`
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Description of an output device for listing
#[derive(Debug, Clone, Serialize)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available output devices
pub fn list_output_devices() -> Vec<OutputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let mut devices = Vec::new();

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = device_capabilities(&device);
                devices.push(OutputDeviceInfo {
                    is_default: default_name.as_ref() == Some(&name),
                    name,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut rates = Vec::new();
    let mut chans = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            for rate_val in [22050u32, 44100, 48000, 88200, 96000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !rates.contains(&rate_val)
                {
                    rates.push(rate_val);
                }
            }
            if !chans.contains(&config.channels()) {
                chans.push(config.channels());
            }
        }
    }

    rates.sort();
    chans.sort();
    (rates, chans)
}

/// Opens output devices on the thread that will use them
pub trait OutputFactory: Send + Sync {
    fn open(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Factory for [`CpalOutput`] on a named or default device
#[derive(Debug, Clone, Default)]
pub struct CpalOutputFactory {
    device_name: Option<String>,
}

impl CpalOutputFactory {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl OutputFactory for CpalOutputFactory {
    fn open(&self, format: &PcmFormat) -> Result<Box<dyn OutputDevice>, AudioError> {
        Ok(Box::new(CpalOutput::open(self.device_name.as_deref(), format)?))
    }
}

/// Find an output device by name, or the host default
fn find_output_device(name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()));
    };

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Pick a supported config at the stream's sample rate, preferring its channel count
fn select_config(
    device: &cpal::Device,
    format: &PcmFormat,
) -> Result<cpal::SupportedStreamConfig, AudioError> {
    let rate = cpal::SampleRate(format.sample_rate);
    let mut candidates: Vec<cpal::SupportedStreamConfigRange> = device
        .supported_output_configs()
        .map_err(|e| AudioError::CpalError(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
        .filter(|c| {
            matches!(
                c.sample_format(),
                cpal::SampleFormat::F32 | cpal::SampleFormat::I16 | cpal::SampleFormat::U16
            )
        })
        .collect();

    candidates.sort_by_key(|c| (c.channels() != format.channels, c.channels()));

    candidates
        .into_iter()
        .next()
        .map(|c| c.with_sample_rate(rate))
        .ok_or_else(|| {
            AudioError::UnsupportedFormat(format!(
                "{} Hz, {} channel(s) not supported by output device",
                format.sample_rate, format.channels
            ))
        })
}

/// Converts raw little-endian bytes to samples, carrying an odd trailing byte
#[derive(Debug, Default)]
struct SampleDecoder {
    carry: Option<u8>,
}

impl SampleDecoder {
    fn decode(&mut self, data: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(data.len() / 2 + 1);
        let mut rest = data;

        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    samples.push(i16::from_le_bytes([low, high]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }

        let mut pairs = rest.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        self.carry = pairs.remainder().first().copied();
        samples
    }
}

/// Pull side of the queue, owned by the cpal callback
struct CallbackState {
    rx: Receiver<Vec<i16>>,
    current: Vec<i16>,
    position: usize,
    drained: Arc<AtomicBool>,
}

impl CallbackState {
    fn next_sample(&mut self) -> i16 {
        while self.position >= self.current.len() {
            match self.rx.try_recv() {
                Ok(next) => {
                    self.current = next;
                    self.position = 0;
                }
                Err(TryRecvError::Empty) => return 0,
                Err(TryRecvError::Disconnected) => {
                    self.drained.store(true, Ordering::Release);
                    return 0;
                }
            }
        }
        let sample = self.current[self.position];
        self.position += 1;
        sample
    }

    fn fill<T: SizedSample + FromSample<i16>>(&mut self, data: &mut [T], channels: usize) {
        for frame in data.chunks_mut(channels) {
            let value = T::from_sample(self.next_sample());
            frame.fill(value);
        }
    }
}

/// Push side of the queue. Samples accumulate until a full batch is ready,
/// and every send gives up after `timeout`.
struct SampleQueue {
    tx: Sender<Vec<i16>>,
    pending: Vec<i16>,
    min_batch: usize,
    timeout: Duration,
}

impl SampleQueue {
    fn new(tx: Sender<Vec<i16>>, min_batch: usize, timeout: Duration) -> Self {
        Self {
            tx,
            pending: Vec::with_capacity(min_batch),
            min_batch: min_batch.max(1),
            timeout,
        }
    }

    fn push(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        self.pending.extend_from_slice(samples);
        while self.pending.len() >= self.min_batch {
            let rest = self.pending.split_off(self.min_batch);
            let batch = std::mem::replace(&mut self.pending, rest);
            self.send(batch)?;
        }
        Ok(())
    }

    /// Send whatever is left over, short of a full batch
    fn flush(&mut self) -> Result<(), AudioError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.send(batch)
    }

    fn send(&self, batch: Vec<i16>) -> Result<(), AudioError> {
        self.tx.send_timeout(batch, self.timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => AudioError::WriteFailed(format!(
                "output device stopped consuming audio for {:?}",
                self.timeout
            )),
            SendTimeoutError::Disconnected(_) => {
                AudioError::WriteFailed("output stream closed".to_string())
            }
        })
    }
}

/// Live stream plus its push side
struct ActiveStream {
    stream: cpal::Stream,
    queue: SampleQueue,
    drained: Arc<AtomicBool>,
    errors: Receiver<AudioError>,
}

/// Stream-mode output on a cpal device
pub struct CpalOutput {
    device: cpal::Device,
    name: String,
    config: StreamConfig,
    sample_format: cpal::SampleFormat,
    preferred_chunk: Option<usize>,
    decoder: SampleDecoder,
    active: Option<ActiveStream>,
}

impl CpalOutput {
    /// Open `device_name` (or the default output) for `format`
    pub fn open(device_name: Option<&str>, format: &PcmFormat) -> Result<Self, AudioError> {
        let device = find_output_device(device_name)?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let supported = select_config(&device, format)?;

        let preferred_chunk = match supported.buffer_size() {
            cpal::SupportedBufferSize::Range { min, .. } if *min > 0 => {
                Some((*min as usize * format.frame_bytes()).max(DEFAULT_CHUNK_BYTES))
            }
            _ => None,
        };

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        tracing::info!(
            "Output device {}: {} Hz, {} channel(s), {:?}",
            name,
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        Ok(Self {
            device,
            name,
            config,
            sample_format,
            preferred_chunk,
            decoder: SampleDecoder::default(),
            active: None,
        })
    }

    /// Longest a write may block: the audio a full queue holds, plus slack
    fn write_timeout(&self) -> Duration {
        let rate = u64::from(self.config.sample_rate.0.max(1));
        let queued = (QUEUE_DEPTH * MIN_BATCH_SAMPLES) as u64;
        Duration::from_millis(queued * 1000 / rate) + WRITE_MARGIN
    }

    fn build_stream<T>(&self, state: CallbackState, error_tx: Sender<AudioError>) -> Result<cpal::Stream, AudioError>
    where
        T: SizedSample + FromSample<i16>,
    {
        let channels = self.config.channels as usize;
        let mut state = state;

        self.device
            .build_output_stream(
                &self.config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| state.fill(data, channels),
                move |err| {
                    let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                },
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    fn check_errors(&self) -> Result<(), AudioError> {
        match self.active.as_ref().and_then(|a| a.errors.try_recv().ok()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl OutputDevice for CpalOutput {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.active.is_some() {
            self.stop()?;
        }

        let (tx, rx) = bounded::<Vec<i16>>(QUEUE_DEPTH);
        let (error_tx, errors) = bounded::<AudioError>(16);
        let drained = Arc::new(AtomicBool::new(false));
        let state = CallbackState {
            rx,
            current: Vec::new(),
            position: 0,
            drained: drained.clone(),
        };

        let queue = SampleQueue::new(tx, MIN_BATCH_SAMPLES, self.write_timeout());

        let stream = match self.sample_format {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(state, error_tx)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(state, error_tx)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(state, error_tx)?,
            format => {
                return Err(AudioError::UnsupportedFormat(format!(
                    "Unsupported sample format: {format:?}"
                )))
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.decoder = SampleDecoder::default();
        self.active = Some(ActiveStream {
            stream,
            queue,
            drained,
            errors,
        });
        tracing::debug!("Output stream started on {}", self.name);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), AudioError> {
        self.check_errors()?;
        let samples = self.decoder.decode(data);
        let active = self.active.as_mut().ok_or(AudioError::NotStarted)?;

        if let Err(err) = active.queue.push(&samples) {
            // A stream error explains the stall better than the timeout does
            return Err(active.errors.try_recv().unwrap_or(err));
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };

        let flushed = active.queue.flush();
        if let Err(e) = &flushed {
            tracing::warn!("Dropping queued audio on {}: {}", self.name, e);
        }

        // Closing the queue lets the callback report when it has played everything
        drop(active.queue);
        let started = Instant::now();
        while !active.drained.load(Ordering::Acquire) {
            if started.elapsed() > DRAIN_TIMEOUT {
                tracing::warn!("Output drain timed out on {}", self.name);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let paused = active.stream.pause();
        drop(active.stream);
        tracing::debug!("Output stream stopped on {}", self.name);

        if let Ok(err) = active.errors.try_recv() {
            return Err(err);
        }
        flushed?;
        paused.map_err(|e| AudioError::StreamError(e.to_string()))
    }

    fn preferred_chunk_size(&self) -> Option<usize> {
        self.preferred_chunk
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("Error stopping output stream: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_carries_odd_byte() {
        let mut decoder = SampleDecoder::default();
        assert_eq!(decoder.decode(&[0x01, 0x00, 0x02]), vec![1]);
        assert_eq!(decoder.decode(&[0x00]), vec![2]);
        assert_eq!(decoder.decode(&[0xFF]), Vec::<i16>::new());
        assert_eq!(decoder.decode(&[0xFF, 0x03, 0x00]), vec![-1, 3]);
    }

    #[test]
    fn test_callback_fills_frames_then_drains() {
        let (tx, rx) = bounded(4);
        let drained = Arc::new(AtomicBool::new(false));
        let mut state = CallbackState {
            rx,
            current: Vec::new(),
            position: 0,
            drained: drained.clone(),
        };

        tx.send(vec![100i16, -100]).unwrap();
        let mut out = [0i16; 6];
        state.fill(&mut out, 2);
        // Each mono sample is copied to both channels, then silence
        assert_eq!(out, [100, 100, -100, -100, 0, 0]);
        assert!(!drained.load(Ordering::Acquire));

        drop(tx);
        state.fill(&mut out, 2);
        assert!(drained.load(Ordering::Acquire));
    }

    #[test]
    fn test_small_writes_keep_callback_fed() {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let mut queue = SampleQueue::new(tx, 1024, Duration::from_millis(50));
        let mut state = CallbackState {
            rx,
            current: Vec::new(),
            position: 0,
            drained: Arc::new(AtomicBool::new(false)),
        };

        // 15-sample writes would fill a per-write queue with 60 samples
        let recording: Vec<i16> = (1..=4500).map(|i| i as i16).collect();
        for chunk in recording.chunks(15) {
            queue.push(chunk).unwrap();
        }

        let mut out = [0i16; 512];
        state.fill(&mut out, 1);
        assert_eq!(&out[..], &recording[..512]);
    }

    #[test]
    fn test_flush_sends_partial_batch() {
        let (tx, rx) = bounded(QUEUE_DEPTH);
        let mut queue = SampleQueue::new(tx, 1024, Duration::from_millis(50));

        queue.push(&[1, 2, 3]).unwrap();
        assert!(rx.try_recv().is_err());

        queue.flush().unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_stalled_callback_fails_write() {
        let (tx, _rx) = bounded(1);
        let mut queue = SampleQueue::new(tx, 1, Duration::from_millis(30));
        queue.push(&[1]).unwrap();

        let started = Instant::now();
        let result = queue.push(&[2]);

        assert!(matches!(result, Err(AudioError::WriteFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_closed_callback_fails_write() {
        let (tx, rx) = bounded(1);
        let mut queue = SampleQueue::new(tx, 1, Duration::from_millis(30));
        drop(rx);
        assert!(matches!(queue.push(&[1]), Err(AudioError::WriteFailed(_))));
    }

    #[test]
    fn test_list_output_devices_does_not_panic() {
        // Hosts without audio hardware simply report no devices
        for device in list_output_devices() {
            assert!(!device.name.is_empty());
        }
    }
}
