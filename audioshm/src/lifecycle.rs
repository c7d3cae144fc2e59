//! Ordered acquisition and reverse release of a session's resources.

use std::fmt;

use tracing::{debug, warn};

use crate::errors::AudioShmError;

/// Startup steps, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Sink,
    Channel,
    Handshake,
    Region,
    Log,
}

impl Stage {
    /// The one-line diagnostic printed when this step fails.
    pub fn failure(&self) -> &'static str {
        match self {
            Stage::Sink => "could not init playback device",
            Stage::Channel => "could not open notification queue",
            Stage::Handshake => "handshake failed",
            Stage::Region => "could not init shared memory",
            Stage::Log => "could not open log file",
        }
    }

    /// Whether the step leaves something behind that teardown must release.
    pub fn holds_resource(&self) -> bool {
        !matches!(self, Stage::Handshake)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Sink => "sink device",
            Stage::Channel => "notification channel",
            Stage::Handshake => "handshake",
            Stage::Region => "shared region",
            Stage::Log => "timing log",
        };
        f.write_str(name)
    }
}

/// Consumer session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initializing,
    Handshaking,
    Running,
    Draining,
    Closed,
    Aborting,
}

/// Something holding one resource per acquired [`Stage`].
pub trait Release {
    fn release(&mut self, stage: Stage) -> Result<(), AudioShmError>;
}

/// The stages acquired so far, released newest first.
///
/// Every release step runs even when an earlier one fails; failures are collected
/// instead of short-circuiting.
#[derive(Debug, Default)]
pub struct ResourceStack {
    stages: Vec<Stage>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Stage) {
        debug_assert!(stage.holds_resource());
        debug!(%stage, "acquired");
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn release_all<R: Release>(&mut self, resources: &mut R) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(stage) = self.stages.pop() {
            match resources.release(stage) {
                Ok(()) => debug!(%stage, "released"),
                Err(e) => {
                    warn!(%stage, error = %e, "release failed");
                    report.failed.push((stage, e));
                }
            }
            report.released.push(stage);
        }
        report
    }
}

/// What a teardown did, in the order it did it.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub released: Vec<Stage>,
    pub failed: Vec<(Stage, AudioShmError)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
