//! Background units of work with progress reporting and cancellation
//!
//! Every operation runs on its own named thread. The caller keeps a [`Task`]
//! to read progress events, request cancellation and collect the single
//! terminal result.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::constants::PROGRESS_CHANNEL_CAPACITY;
use crate::error::Error;

/// Progress code for a capture attempted without a connection
pub const CODE_NOT_CONNECTED: i32 = -1;
/// Progress code for a capture that hit its deadline
pub const CODE_TIMED_OUT: i32 = -2;

/// Progress reported by a running task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Free-form status line
    Status(String),
    /// Completion percentage, 0..=100
    Percent(u8),
    NotConnected,
    TimedOut,
}

impl ProgressEvent {
    /// Integer progress code: the percentage, or a negative sentinel
    pub fn code(&self) -> Option<i32> {
        match self {
            ProgressEvent::Status(_) => None,
            ProgressEvent::Percent(p) => Some(*p as i32),
            ProgressEvent::NotConnected => Some(CODE_NOT_CONNECTED),
            ProgressEvent::TimedOut => Some(CODE_TIMED_OUT),
        }
    }
}

/// Cooperative cancellation flag shared between caller and worker
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sending half of a task's progress channel.
///
/// Events are dropped rather than blocking the worker when the caller falls
/// behind; the terminal result is delivered separately.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Sender<ProgressEvent>,
}

impl ProgressSender {
    pub fn send(&self, event: ProgressEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!("Progress channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub fn percent(&self, percent: u8) {
        self.send(ProgressEvent::Percent(percent.min(100)));
    }

    pub fn status(&self, message: impl Into<String>) {
        self.send(ProgressEvent::Status(message.into()));
    }
}

/// Handle to one background operation
pub struct Task<T> {
    name: String,
    cancel: CancelToken,
    progress: Receiver<ProgressEvent>,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Task<T> {
    /// Run `work` on a new thread named `name`
    pub fn spawn<F>(name: &str, work: F) -> Result<Self, Error>
    where
        F: FnOnce(&CancelToken, &ProgressSender) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(PROGRESS_CHANNEL_CAPACITY);
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let progress = ProgressSender { tx };

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(&worker_cancel, &progress))?;

        tracing::debug!("Spawned task {}", name);

        Ok(Self {
            name: name.to_string(),
            cancel,
            progress: rx,
            handle,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Progress events; the channel disconnects when the task ends
    pub fn progress(&self) -> &Receiver<ProgressEvent> {
        &self.progress
    }

    /// Ask the task to stop at its next cancellation point
    pub fn cancel(&self) {
        tracing::debug!("Cancelling task {}", self.name);
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Block until the task ends and return its result
    pub fn join(self) -> Result<T, Error> {
        self.handle.join().map_err(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Task {} panicked: {}", self.name, message);
            Error::TaskPanicked(message)
        })
    }
}
