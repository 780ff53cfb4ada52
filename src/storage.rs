//! Persistence of completed recordings as headerless `.pcm` files

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use crate::error::StorageError;

/// Writes one raw PCM file per successful capture
#[derive(Debug, Clone)]
pub struct RecordingStore {
    dir: PathBuf,
}

impl RecordingStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File name for a capture finished at `at`
    pub fn file_name(at: DateTime<Utc>) -> String {
        format!("recording_{}.pcm", at.timestamp_millis())
    }

    /// Write `data` verbatim to a new timestamped file. An existing
    /// recording is never overwritten.
    pub fn persist(&self, data: &[u8]) -> Result<PathBuf, StorageError> {
        self.persist_at(data, Utc::now())
    }

    pub fn persist_at(&self, data: &[u8], at: DateTime<Utc>) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.dir).map_err(|source| StorageError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let stem = format!("recording_{}", at.timestamp_millis());
        let mut path = self.dir.join(Self::file_name(at));
        let mut attempt = 0u32;
        let mut file = loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    path = self.dir.join(format!("{}_{}.pcm", stem, attempt));
                }
                Err(source) => return Err(StorageError::Write { path, source }),
            }
        };

        file.write_all(data).map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;

        tracing::info!("Audio saved to {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }
}
