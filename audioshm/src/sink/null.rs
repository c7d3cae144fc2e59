use tracing::debug;

use super::{PlaybackClock, Sink};
use crate::config::SinkConfig;
use crate::errors::SinkError;

/// Discards samples but keeps device timing, so blocking and underruns behave as on
/// real hardware.
#[derive(Debug)]
pub struct NullSink {
    clock: PlaybackClock,
    period_size: usize,
    channels: usize,
    frames_played: u64,
}

impl NullSink {
    pub fn new(cfg: &SinkConfig) -> Self {
        NullSink {
            clock: PlaybackClock::new(cfg.period_duration(), cfg.buffer_duration()),
            period_size: cfg.period_size(),
            channels: cfg.channels as usize,
            frames_played: 0,
        }
    }
}

impl Sink for NullSink {
    fn period_size(&self) -> usize {
        self.period_size
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&mut self, samples: &[i16]) -> Result<usize, SinkError> {
        self.clock.admit()?;
        let frames = samples.len() / self.channels;
        self.frames_played += frames as u64;
        Ok(frames)
    }

    fn prepare(&mut self) -> Result<(), SinkError> {
        self.clock.prepare();
        Ok(())
    }

    fn drain(&mut self) -> Result<(), SinkError> {
        self.clock.drain();
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        debug!(frames = self.frames_played, "null sink closed");
        Ok(())
    }
}
