//! Timed capture of raw PCM from the network peer
//!
//! The peer delivers bytes in irregular bursts, so capture is a polling loop:
//! each iteration checks cancellation and the deadline, then waits at most one
//! poll interval for data and appends whatever arrived to the buffer.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::audio::buffer::AudioBuffer;
use crate::constants::{DEFAULT_CAPTURE_DEADLINE_MS, DEFAULT_POLL_INTERVAL_MS, PROGRESS_STEP_PERCENT};
use crate::error::CaptureError;
use crate::network::connection::{PcmSource, Poll};
use crate::storage::RecordingStore;
use crate::task::CancelToken;

/// How a capture that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// All expected bytes arrived
    Completed {
        /// File the recording was saved to, if saving succeeded
        saved_to: Option<PathBuf>,
    },
    /// Stopped by the caller; buffer content past `bytes_received` is stale
    Stopped,
}

/// Summary of one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub outcome: CaptureOutcome,
    pub bytes_received: usize,
    pub elapsed: Duration,
}

impl CaptureReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, CaptureOutcome::Completed { .. })
    }
}

/// Emits one notification per crossed progress boundary
#[derive(Debug)]
pub struct ProgressThrottle {
    total: usize,
    step: u8,
    last_boundary: u8,
}

impl ProgressThrottle {
    pub fn new(total: usize, step: u8) -> Self {
        Self {
            total,
            step: step.max(1),
            last_boundary: 0,
        }
    }

    /// Boundaries newly crossed at `received` bytes, as percentages
    pub fn advance(&mut self, received: usize) -> impl Iterator<Item = u8> {
        let percent = if self.total == 0 {
            100
        } else {
            (received.min(self.total) as u128 * 100 / self.total as u128) as u8
        };
        let boundary = percent / self.step;
        let from = self.last_boundary + 1;
        self.last_boundary = self.last_boundary.max(boundary);
        let step = self.step;
        (from..=boundary).map(move |b| b * step)
    }
}

/// Mutable state of one capture attempt
struct CaptureSession {
    received: usize,
    started: Instant,
    deadline: Instant,
}

/// Drives the capture loop with fixed timing parameters
#[derive(Debug, Clone)]
pub struct CaptureEngine {
    max_duration: Duration,
    poll_interval: Duration,
    store: Option<RecordingStore>,
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_CAPTURE_DEADLINE_MS),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        )
    }
}

impl CaptureEngine {
    pub fn new(max_duration: Duration, poll_interval: Duration) -> Self {
        Self {
            max_duration,
            poll_interval,
            store: None,
        }
    }

    /// Save completed recordings to `store`
    pub fn with_store(mut self, store: RecordingStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// Fill `buffer[..total_bytes]` from `source`.
    ///
    /// `progress` receives each crossed 5% boundary once, in increasing order.
    /// With no source the buffer is left untouched.
    pub fn capture<S, P>(
        &self,
        source: Option<&mut S>,
        buffer: &mut AudioBuffer,
        total_bytes: usize,
        cancel: &CancelToken,
        mut progress: P,
    ) -> Result<CaptureReport, CaptureError>
    where
        S: PcmSource + ?Sized,
        P: FnMut(u8),
    {
        let source = match source {
            Some(source) if source.is_open() => source,
            _ => {
                tracing::warn!("Capture requested without an open connection");
                return Err(CaptureError::NotConnected);
            }
        };

        if buffer.capacity() < total_bytes {
            return Err(CaptureError::BufferTooSmall {
                capacity: buffer.capacity(),
                requested: total_bytes,
            });
        }

        let started = Instant::now();
        let mut session = CaptureSession {
            received: 0,
            started,
            deadline: started + self.max_duration,
        };
        let mut throttle = ProgressThrottle::new(total_bytes, PROGRESS_STEP_PERCENT);

        tracing::info!(
            "Capturing {} bytes (deadline {:?})",
            total_bytes,
            self.max_duration
        );

        while session.received < total_bytes {
            if cancel.is_cancelled() {
                tracing::info!("Capture stopped after {} bytes", session.received);
                return Ok(CaptureReport {
                    outcome: CaptureOutcome::Stopped,
                    bytes_received: session.received,
                    elapsed: session.started.elapsed(),
                });
            }

            let now = Instant::now();
            if now >= session.deadline {
                tracing::warn!(
                    "Capture timed out with {} of {} bytes",
                    session.received,
                    total_bytes
                );
                return Err(CaptureError::Timeout {
                    received: session.received,
                    expected: total_bytes,
                });
            }

            let wait = self.poll_interval.min(session.deadline - now);
            let window = buffer.write_window(session.received, total_bytes);

            match source.poll_read(window, wait) {
                Ok(Poll::Data(n)) => {
                    session.received += n;
                    tracing::trace!("Read {} bytes ({} total)", n, session.received);
                    for percent in throttle.advance(session.received) {
                        progress(percent);
                    }
                }
                Ok(Poll::Idle) => {}
                Ok(Poll::Closed) => {
                    tracing::warn!("Peer closed after {} of {} bytes", session.received, total_bytes);
                    return Err(CaptureError::TransportRead {
                        received: session.received,
                        source: std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer closed the stream",
                        ),
                    });
                }
                Err(e) => {
                    tracing::error!("Recording error: {}", e);
                    return Err(CaptureError::TransportRead {
                        received: session.received,
                        source: e,
                    });
                }
            }
        }

        let elapsed = session.started.elapsed();
        tracing::info!("Captured {} bytes in {:?}", session.received, elapsed);

        let saved_to = self.store.as_ref().and_then(|store| {
            match store.persist(&buffer.as_slice()[..total_bytes]) {
                Ok(path) => Some(path),
                Err(e) => {
                    tracing::error!("Error saving audio file: {}", e);
                    None
                }
            }
        });

        Ok(CaptureReport {
            outcome: CaptureOutcome::Completed { saved_to },
            bytes_received: session.received,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectionManager;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::io::{self, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Source replaying a fixed script of polls
    struct ScriptedSource {
        script: VecDeque<Result<Vec<u8>, io::ErrorKind>>,
        open: bool,
        pending: Vec<u8>,
    }

    impl ScriptedSource {
        fn bursts(data: &[u8], burst: usize) -> Self {
            let mut script = VecDeque::new();
            for chunk in data.chunks(burst) {
                script.push_back(Ok(Vec::new()));
                script.push_back(Ok(chunk.to_vec()));
            }
            Self {
                script,
                open: true,
                pending: Vec::new(),
            }
        }
    }

    impl PcmSource for ScriptedSource {
        fn poll_read(&mut self, dst: &mut [u8], wait: Duration) -> io::Result<Poll> {
            if self.pending.is_empty() {
                match self.script.pop_front() {
                    Some(Ok(bytes)) if bytes.is_empty() => return Ok(Poll::Idle),
                    Some(Ok(bytes)) => self.pending = bytes,
                    Some(Err(kind)) => return Err(io::Error::new(kind, "scripted failure")),
                    None => {
                        thread::sleep(wait);
                        return Ok(Poll::Idle);
                    }
                }
            }
            // Short reads: never more than 7 bytes at a time
            let n = self.pending.len().min(dst.len()).min(7);
            dst[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(Poll::Data(n))
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn engine(max_ms: u64) -> CaptureEngine {
        CaptureEngine::new(Duration::from_millis(max_ms), Duration::from_millis(1))
    }

    #[test]
    fn test_not_connected_leaves_buffer_untouched() {
        let mut buffer = AudioBuffer::new(64);
        buffer.write_window(0, 64).fill(0xAB);

        let result = engine(100).capture::<ScriptedSource, _>(
            None,
            &mut buffer,
            64,
            &CancelToken::new(),
            |_| panic!("no progress expected"),
        );

        assert!(matches!(result, Err(CaptureError::NotConnected)));
        assert!(buffer.as_slice().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_closed_source_is_not_connected() {
        let mut source = ScriptedSource::bursts(&[1, 2], 2);
        source.open = false;
        let mut buffer = AudioBuffer::new(2);

        let result = engine(100).capture(Some(&mut source), &mut buffer, 2, &CancelToken::new(), |_| {});
        assert!(matches!(result, Err(CaptureError::NotConnected)));
    }

    #[test]
    fn test_exact_bytes_and_progress() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut source = ScriptedSource::bursts(&data, 33);
        let mut buffer = AudioBuffer::new(1200);
        let mut seen = Vec::new();

        let report = engine(5000)
            .capture(Some(&mut source), &mut buffer, 1000, &CancelToken::new(), |p| seen.push(p))
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.bytes_received, 1000);
        assert_eq!(&buffer.as_slice()[..1000], &data[..]);
        // Bytes past total_bytes are never written
        assert!(buffer.as_slice()[1000..].iter().all(|&b| b == 0));
        assert_eq!(seen, (1..=20).map(|b| b * 5).collect::<Vec<u8>>());
    }

    #[test]
    fn test_timeout_with_partial_data() {
        let mut source = ScriptedSource::bursts(&[7u8; 100], 50);
        let mut buffer = AudioBuffer::new(1000);

        let started = Instant::now();
        let result = engine(50).capture(Some(&mut source), &mut buffer, 1000, &CancelToken::new(), |_| {});

        match result {
            Err(CaptureError::Timeout { received, expected }) => {
                assert_eq!(received, 100);
                assert_eq!(expected, 1000);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_cancel_is_stopped_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = ScriptedSource::bursts(&[1u8; 10], 10);
        let mut buffer = AudioBuffer::new(100);
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = engine(1000)
            .with_store(RecordingStore::new(dir.path()))
            .capture(Some(&mut source), &mut buffer, 100, &cancel, |_| {})
            .unwrap();

        assert_eq!(report.outcome, CaptureOutcome::Stopped);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_read_error_is_transport_error() {
        let mut source = ScriptedSource::bursts(&[1u8; 10], 10);
        source.script.push_back(Err(io::ErrorKind::ConnectionReset));
        let mut buffer = AudioBuffer::new(100);

        let result = engine(1000).capture(Some(&mut source), &mut buffer, 100, &CancelToken::new(), |_| {});
        match result {
            Err(CaptureError::TransportRead { received, source }) => {
                assert_eq!(received, 10);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_buffer_too_small() {
        let mut source = ScriptedSource::bursts(&[], 1);
        let mut buffer = AudioBuffer::new(10);
        let result = engine(100).capture(Some(&mut source), &mut buffer, 11, &CancelToken::new(), |_| {});
        assert!(matches!(result, Err(CaptureError::BufferTooSmall { capacity: 10, requested: 11 })));
    }

    #[test]
    fn test_completed_capture_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![3u8; 64];
        let mut source = ScriptedSource::bursts(&data, 16);
        let mut buffer = AudioBuffer::new(64);

        let report = engine(1000)
            .with_store(RecordingStore::new(dir.path()))
            .capture(Some(&mut source), &mut buffer, 64, &CancelToken::new(), |_| {})
            .unwrap();

        let CaptureOutcome::Completed { saved_to: Some(path) } = report.outcome else {
            panic!("recording was not saved");
        };
        assert_eq!(std::fs::read(path).unwrap(), data);
    }

    #[test]
    fn test_persist_failure_keeps_capture_successful() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let mut source = ScriptedSource::bursts(&[5u8; 8], 8);
        let mut buffer = AudioBuffer::new(8);

        let report = engine(1000)
            .with_store(RecordingStore::new(&blocker))
            .capture(Some(&mut source), &mut buffer, 8, &CancelToken::new(), |_| {})
            .unwrap();

        assert_eq!(report.outcome, CaptureOutcome::Completed { saved_to: None });
        assert_eq!(buffer.as_slice(), &[5u8; 8]);
    }

    #[test]
    fn test_peer_bursts_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let total = 882_000;
        let data: Vec<u8> = (0..total).map(|i| (i * 31 % 256) as u8).collect();
        let payload = data.clone();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for burst in payload.chunks(4096) {
                stream.write_all(burst).unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            // Hold the socket open until the client is done
            thread::sleep(Duration::from_millis(200));
        });

        let mut manager = ConnectionManager::new();
        manager.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        let mut buffer = AudioBuffer::new(total);
        let mut seen = Vec::new();

        let report = CaptureEngine::default()
            .capture(manager.handle_mut(), &mut buffer, total, &CancelToken::new(), |p| seen.push(p))
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.bytes_received, 882_000);
        assert!(report.elapsed < Duration::from_millis(15_000));
        assert_eq!(buffer.as_slice(), &data[..]);
        assert_eq!(seen.len(), 20);
        peer.join().unwrap();
    }

    #[test]
    fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();

        let mut manager = ConnectionManager::new();
        manager.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        let _peer = listener.accept().unwrap();
        let mut buffer = AudioBuffer::new(882_000);

        let result = CaptureEngine::new(Duration::from_millis(300), Duration::from_millis(10))
            .with_store(RecordingStore::new(dir.path()))
            .capture(manager.handle_mut(), &mut buffer, 882_000, &CancelToken::new(), |_| {});

        assert!(matches!(result, Err(CaptureError::Timeout { received: 0, .. })));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_peer_close_before_total() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[9u8; 100]).unwrap();
        });

        let mut manager = ConnectionManager::new();
        manager.connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        peer.join().unwrap();
        let mut buffer = AudioBuffer::new(1000);

        let result = engine(2000).capture(manager.handle_mut(), &mut buffer, 1000, &CancelToken::new(), |_| {});
        match result {
            Err(CaptureError::TransportRead { received, source }) => {
                assert_eq!(received, 100);
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("expected early close, got {:?}", other),
        }
    }

    proptest! {
        #[test]
        fn prop_progress_monotonic_and_unique(
            total in 1usize..100_000,
            steps in proptest::collection::vec(1usize..5_000, 1..200),
        ) {
            let mut throttle = ProgressThrottle::new(total, 5);
            let mut received = 0;
            let mut seen: Vec<u8> = Vec::new();
            for step in steps {
                received = (received + step).min(total);
                seen.extend(throttle.advance(received));
            }
            prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(seen.iter().all(|p| p % 5 == 0 && *p > 0 && *p <= 100));
            prop_assert!(seen.len() <= 20);
            if received == total {
                prop_assert_eq!(seen.last().copied(), Some(100));
            }
        }
    }
}
