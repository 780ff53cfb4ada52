//! Single TCP connection to the audio-producing peer
//!
//! The manager holds at most one live socket. Connecting again closes the
//! previous socket before the new attempt starts.

use crossbeam_channel::{bounded, RecvTimeoutError};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::NetworkError;

/// Outcome of one poll of a PCM byte source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// `n` bytes were copied into the destination
    Data(usize),
    /// Nothing arrived within the wait
    Idle,
    /// The peer closed its end of the stream
    Closed,
}

/// A stream of raw PCM bytes that can be polled with a bounded wait
pub trait PcmSource {
    /// Copy whatever is available into `dst`, waiting at most `wait` for the first byte
    fn poll_read(&mut self, dst: &mut [u8], wait: Duration) -> io::Result<Poll>;

    /// Whether the transport still reports itself open
    fn is_open(&self) -> bool;
}

/// A live socket to the peer
pub struct ConnectionHandle {
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Option<Duration>,
    /// Set once a read has seen end of stream or a socket error
    broken: bool,
}

impl ConnectionHandle {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            read_timeout: None,
            broken: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn set_wait(&mut self, wait: Duration) -> io::Result<()> {
        // Zero is rejected by the OS as a read timeout
        let wait = wait.max(Duration::from_millis(1));
        if self.read_timeout != Some(wait) {
            self.stream.set_read_timeout(Some(wait))?;
            self.read_timeout = Some(wait);
        }
        Ok(())
    }

    fn shutdown(self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            tracing::debug!("Error closing socket to {}: {}", self.peer, e);
        }
    }
}

impl PcmSource for ConnectionHandle {
    fn poll_read(&mut self, dst: &mut [u8], wait: Duration) -> io::Result<Poll> {
        if dst.is_empty() {
            return Ok(Poll::Idle);
        }
        self.set_wait(wait)?;

        match self.stream.read(dst) {
            Ok(0) => {
                self.broken = true;
                Ok(Poll::Closed)
            }
            Ok(n) => Ok(Poll::Data(n)),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(Poll::Idle)
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.broken && self.stream.peer_addr().is_ok()
    }
}

/// Owns the process's single connection to the peer
#[derive(Default)]
pub struct ConnectionManager {
    handle: Option<ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any current connection with a new one to `host:port`.
    ///
    /// The previous socket is closed before resolution starts, so a failed
    /// attempt leaves the manager disconnected. `timeout` covers the whole
    /// attempt: name resolution and every address tried.
    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<SocketAddr, NetworkError> {
        self.close();

        if timeout.is_zero() {
            return Err(NetworkError::InvalidTimeout(timeout));
        }

        let deadline = Instant::now() + timeout;
        let target = format!("{}:{}", host, port);
        let addrs = resolve(host, port, timeout).map_err(|reason| NetworkError::ConnectionFailed {
            addr: target.clone(),
            reason,
        })?;

        if addrs.is_empty() {
            return Err(NetworkError::AddressResolution(target));
        }

        let mut last_error = None;
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                last_error = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                break;
            }
            tracing::debug!("Connecting to {} (timeout {:?})", addr, remaining);
            match connect_one(addr, remaining) {
                Ok(stream) => {
                    tracing::info!("Connected to {}", addr);
                    self.handle = Some(ConnectionHandle::new(stream, addr));
                    return Ok(addr);
                }
                Err(e) => {
                    tracing::warn!("Connection to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(NetworkError::ConnectionFailed {
            addr: target,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no address attempted".to_string()),
        })
    }

    /// Release the current connection, if any
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::info!("Closing connection to {}", handle.peer_addr());
            handle.shutdown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| h.is_open())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().map(|h| h.peer_addr())
    }

    /// Lend the live connection to one capture
    pub fn handle_mut(&mut self) -> Option<&mut ConnectionHandle> {
        self.handle.as_mut().filter(|h| h.is_open())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolve `host:port` within `timeout`. Literal addresses skip the lookup.
fn resolve(host: &str, port: u16, timeout: Duration) -> Result<Vec<SocketAddr>, String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    // The system resolver has no timeout of its own; an abandoned lookup
    // finishes in the background and its result is discarded.
    let (tx, rx) = bounded(1);
    let target = host.to_string();
    thread::Builder::new()
        .name("resolve".to_string())
        .spawn(move || {
            let result = (target.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>());
            let _ = tx.send(result);
        })
        .map_err(|e| e.to_string())?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(RecvTimeoutError::Timeout) => Err(format!("address resolution timed out after {:?}", timeout)),
        Err(RecvTimeoutError::Disconnected) => Err("address resolution failed".to_string()),
    }
}

fn connect_one(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.connect_timeout(&SockAddr::from(addr), timeout)?;
    Ok(socket.into())
}
