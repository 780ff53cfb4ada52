//! # PCM Stream Client
//!
//! Pulls a fixed amount of raw PCM audio from a TCP peer, stores it, and plays
//! it back on a local output device.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     AudioClient (session::AudioClient)               │
//! │   connect()            start_recording()         start_playback()    │
//! │      │                        │                         │            │
//! │      ▼                        ▼                         ▼            │
//! │  ┌──────────┐   socket   ┌──────────┐  AudioBuffer  ┌──────────┐     │
//! │  │Connection│ ─────────▶ │ Capture  │ ────────────▶ │ Playback │     │
//! │  │ Manager  │            │  Engine  │               │  Engine  │     │
//! │  └────┬─────┘            └────┬─────┘               └────┬─────┘     │
//! │       │                       │ .pcm                     │           │
//! └───────┼───────────────────────┼──────────────────────────┼───────────┘
//!         ▼                       ▼                          ▼
//!   TCP peer (i16 LE mono)   RecordingStore            cpal output device
//! ```
//!
//! Each operation runs as a [`task::Task`] on its own thread, reporting
//! [`task::ProgressEvent`]s and a single terminal result.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod session;
pub mod storage;
pub mod task;

pub use error::{Error, Result};
pub use session::{AudioClient, AudioSession};

/// Application-wide constants
pub mod constants {
    /// Sample rate the peer streams at
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Mono stream
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// 16-bit signed little-endian samples
    pub const BYTES_PER_SAMPLE: u16 = 2;

    /// Nominal recording length in milliseconds
    pub const DEFAULT_RECORDING_MS: u64 = 10_000;

    /// Hard ceiling for one capture, 1.5x the nominal length
    pub const DEFAULT_CAPTURE_DEADLINE_MS: u64 = 15_000;

    /// Per-poll wait while the peer has nothing to deliver
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

    /// Default peer address
    pub const DEFAULT_PEER_HOST: &str = "192.168.4.1";

    /// Default peer port
    pub const DEFAULT_PEER_PORT: u16 = 80;

    /// Default connect timeout in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

    /// Chunk size used when the output device does not report a minimum buffer
    pub const DEFAULT_CHUNK_BYTES: usize = 4096;

    /// Capture progress is reported once per this many percent
    pub const PROGRESS_STEP_PERCENT: u8 = 5;

    /// Capacity of each task's progress channel
    pub const PROGRESS_CHANNEL_CAPACITY: usize = 256;
}
