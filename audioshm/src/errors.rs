use std::{fmt, io};
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::Stage;

#[derive(Debug, Error)]
pub enum AudioShmError {
    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    // raw_sync hands back Box<dyn Error> which is neither Send nor Sync.
    #[error("lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("message queue {name}: {source}")]
    Queue {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("no handshake marker within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("period size mismatch: producer {producer}, consumer {consumer}")]
    PeriodMismatch { producer: u32, consumer: u32 },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("region layout mismatch: {0}")]
    Layout(String),

    #[error("region {0} was never initialized by its creator")]
    RegionNotReady(String),

    #[error("slot index {index} out of range ({count} slots)")]
    SlotOutOfRange { index: usize, count: usize },

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("interrupted by a shutdown request")]
    Interrupted,
}

impl AudioShmError {
    pub(crate) fn lock(err: Box<dyn std::error::Error>) -> Self {
        AudioShmError::Lock(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AudioShmError>;

/// Outcome of a sink operation that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The device buffer ran dry before the write arrived. `prepare()` recovers.
    #[error("underrun")]
    Underrun,
    #[error("{0}")]
    Device(String),
}

/// A failure while acquiring the session's resources, tagged with the step that failed.
#[derive(Debug)]
pub struct StartupError {
    pub stage: Stage,
    pub source: AudioShmError,
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage.failure(), self.source)
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
