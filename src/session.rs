//! Connect → record → play cycle
//!
//! [`AudioSession`] owns everything one cycle needs: the connection, the
//! audio buffer and whether the buffer holds a finished recording.
//! [`AudioClient`] runs each session operation as a background [`Task`] and
//! rejects an operation while another one holds the session.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::buffer::{AudioBuffer, PcmFormat};
use crate::audio::capture::{CaptureEngine, CaptureReport};
use crate::audio::device::{CpalOutputFactory, OutputFactory};
use crate::audio::playback::{OutputDevice, PlaybackEngine, PlaybackReport};
use crate::config::AppConfig;
use crate::constants::DEFAULT_CHUNK_BYTES;
use crate::error::{CaptureError, Error, NetworkError, PlaybackError};
use crate::network::ConnectionManager;
use crate::storage::RecordingStore;
use crate::task::{CancelToken, ProgressEvent, ProgressSender, Task};

/// How long an operation waits for the session before reporting busy
const LOCK_WAIT: Duration = Duration::from_millis(100);

/// State shared by the three operations of one cycle
pub struct AudioSession {
    config: AppConfig,
    connection: ConnectionManager,
    buffer: AudioBuffer,
    total_bytes: usize,
    capture: CaptureEngine,
    playback: PlaybackEngine,
    /// Set only after a capture completes; cleared when a new one starts
    has_recording: bool,
}

impl AudioSession {
    pub fn new(config: AppConfig) -> Self {
        let buffer = AudioBuffer::for_duration(&config.capture.format(), config.capture.duration());
        let total_bytes = buffer.capacity();
        let capture = CaptureEngine::new(config.capture.max_duration(), config.capture.poll_interval())
            .with_store(RecordingStore::new(config.storage.recordings_dir.clone()));

        tracing::debug!("Allocated {} byte audio buffer", total_bytes);

        Self {
            buffer,
            total_bytes,
            connection: ConnectionManager::new(),
            capture,
            playback: PlaybackEngine::new(),
            has_recording: false,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn format(&self) -> PcmFormat {
        self.config.capture.format()
    }

    /// Bytes one recording holds
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }

    pub fn has_recording(&self) -> bool {
        self.has_recording
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Connect to the configured peer, replacing any open connection
    pub fn connect(&mut self) -> Result<SocketAddr, NetworkError> {
        let network = &self.config.network;
        self.connection
            .connect(&network.host, network.port, network.connect_timeout())
    }

    pub fn disconnect(&mut self) {
        self.connection.close();
    }

    /// Record one buffer's worth of audio from the connection
    pub fn record<P: FnMut(u8)>(&mut self, cancel: &CancelToken, progress: P) -> Result<CaptureReport, CaptureError> {
        let source = self.connection.handle_mut();
        if source.is_none() {
            return Err(CaptureError::NotConnected);
        }

        self.has_recording = false;
        let report = self
            .capture
            .capture(source, &mut self.buffer, self.total_bytes, cancel, progress)?;
        self.has_recording = report.is_complete();
        Ok(report)
    }

    /// Play the last completed recording on `device`.
    ///
    /// Uses `chunk_bytes` from config, else the device's preferred size,
    /// else [`DEFAULT_CHUNK_BYTES`].
    pub fn play<D, P>(&self, device: &mut D, progress: P) -> Result<PlaybackReport, PlaybackError>
    where
        D: OutputDevice + ?Sized,
        P: FnMut(u8),
    {
        if !self.has_recording {
            return Err(PlaybackError::NoRecording);
        }

        let chunk_size = self
            .config
            .playback
            .chunk_bytes
            .or_else(|| device.preferred_chunk_size())
            .unwrap_or(DEFAULT_CHUNK_BYTES);

        self.playback
            .play(device, &self.buffer, self.total_bytes, chunk_size, progress)
    }
}

/// Runs session operations in the background for a presentation layer
#[derive(Clone)]
pub struct AudioClient {
    session: Arc<Mutex<AudioSession>>,
    output: Arc<dyn OutputFactory>,
}

impl AudioClient {
    /// Client playing through cpal on the configured device
    pub fn new(config: AppConfig) -> Self {
        let output = Arc::new(CpalOutputFactory::new(config.playback.device.clone()));
        Self::with_output(config, output)
    }

    pub fn with_output(config: AppConfig, output: Arc<dyn OutputFactory>) -> Self {
        Self {
            session: Arc::new(Mutex::new(AudioSession::new(config))),
            output,
        }
    }

    /// Whether the session has a finished recording, or `None` while an operation runs
    pub fn has_recording(&self) -> Option<bool> {
        self.session.try_lock().map(|s| s.has_recording())
    }

    /// Connect to the configured peer
    pub fn connect(&self) -> Result<Task<Result<SocketAddr, Error>>, Error> {
        let session = self.session.clone();
        Task::spawn("connect", move |_, progress| {
            let mut session = lock(&session, "connect")?;
            let network = &session.config().network;
            progress.status(format!("Connecting to {}:{}", network.host, network.port));

            session.connect().map_err(|e| {
                progress.status(format!("Connection failed: {}", e));
                Error::from(e)
            })
        })
    }

    /// Start recording; cancel the task to stop early
    pub fn start_recording(&self) -> Result<Task<Result<CaptureReport, Error>>, Error> {
        let session = self.session.clone();
        Task::spawn("record", move |cancel, progress| {
            let mut session = lock(&session, "record")?;
            session
                .record(cancel, |p| progress.percent(p))
                .map_err(|e| {
                    report_capture_error(&e, progress);
                    Error::from(e)
                })
        })
    }

    /// Play the last completed recording
    pub fn start_playback(&self) -> Result<Task<Result<PlaybackReport, Error>>, Error> {
        let session = self.session.clone();
        let output = self.output.clone();
        Task::spawn("playback", move |_, progress| {
            let session = lock(&session, "playback")?;
            if !session.has_recording() {
                return Err(PlaybackError::NoRecording.into());
            }

            // Opened here: audio streams stay on the thread that created them
            let mut device = output.open(&session.format()).map_err(PlaybackError::from)?;
            Ok(session.play(&mut device, |p| progress.percent(p))?)
        })
    }

    /// Close the connection if no operation is running
    pub fn disconnect(&self) -> Result<(), Error> {
        let mut session = self
            .session
            .try_lock_for(LOCK_WAIT)
            .ok_or(Error::Busy("disconnect"))?;
        session.disconnect();
        Ok(())
    }
}

fn lock<'a>(
    session: &'a Mutex<AudioSession>,
    operation: &'static str,
) -> Result<parking_lot::MutexGuard<'a, AudioSession>, Error> {
    session.try_lock_for(LOCK_WAIT).ok_or_else(|| {
        tracing::warn!("Rejected {}: another operation is running", operation);
        Error::Busy(operation)
    })
}

fn report_capture_error(error: &CaptureError, progress: &ProgressSender) {
    match error {
        CaptureError::NotConnected => progress.send(ProgressEvent::NotConnected),
        CaptureError::Timeout { .. } => progress.send(ProgressEvent::TimedOut),
        _ => {}
    }
}
