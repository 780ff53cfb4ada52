//! Network subsystem for the TCP PCM transport

pub mod connection;

pub use connection::{ConnectionHandle, ConnectionManager, PcmSource, Poll};
