//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{AudioBuffer, PcmFormat};
pub use capture::{CaptureEngine, CaptureOutcome, CaptureReport};
pub use device::{list_output_devices, CpalOutput, CpalOutputFactory, OutputDeviceInfo, OutputFactory};
pub use playback::{ChunkPlan, OutputDevice, PlaybackEngine, PlaybackReport};
