//! Audio sinks the consumer writes periods to.

use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::{SinkBackend, SinkConfig};
use crate::errors::{AudioShmError, Result, SinkError};

#[cfg(feature = "audio-cpal")]
mod device;
mod null;
mod wav;

#[cfg(feature = "audio-cpal")]
pub use device::CpalSink;
pub use null::NullSink;
pub use wav::WavSink;

/// A playback device accepting one period of interleaved S16 frames per write.
pub trait Sink {
    /// Frames per period negotiated when the sink was opened.
    fn period_size(&self) -> usize;

    fn channels(&self) -> usize;

    /// Writes one period, returning the frames written. `SinkError::Underrun` means the
    /// device ran dry before this write arrived; the period is dropped and the sink
    /// stays in that state until `prepare`.
    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, SinkError>;

    /// Recovers from an underrun.
    fn prepare(&mut self) -> std::result::Result<(), SinkError>;

    /// Blocks until everything already written has been played.
    fn drain(&mut self) -> std::result::Result<(), SinkError>;

    fn close(&mut self) -> std::result::Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn period_size(&self) -> usize {
        (**self).period_size()
    }

    fn channels(&self) -> usize {
        (**self).channels()
    }

    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, SinkError> {
        (**self).write(samples)
    }

    fn prepare(&mut self) -> std::result::Result<(), SinkError> {
        (**self).prepare()
    }

    fn drain(&mut self) -> std::result::Result<(), SinkError> {
        (**self).drain()
    }

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        (**self).close()
    }
}

fn validate(cfg: &SinkConfig) -> Result<()> {
    if cfg.rate == 0 || cfg.channels == 0 {
        return Err(AudioShmError::Config(format!(
            "rate {} Hz with {} channels is not playable",
            cfg.rate, cfg.channels
        )));
    }
    if cfg.period_size() == 0 {
        return Err(AudioShmError::Config(format!(
            "period time {} us is shorter than one frame",
            cfg.period_time_us
        )));
    }
    if cfg.buffer_time_us < cfg.period_time_us {
        return Err(AudioShmError::Config(format!(
            "buffer time {} us is shorter than the period time {} us",
            cfg.buffer_time_us, cfg.period_time_us
        )));
    }
    Ok(())
}

/// Opens the configured backend.
pub fn open(cfg: &SinkConfig) -> Result<Box<dyn Sink>> {
    validate(cfg)?;
    let sink: Box<dyn Sink> = match cfg.backend {
        SinkBackend::Null => Box::new(NullSink::new(cfg)),
        SinkBackend::Wav => Box::new(WavSink::create(cfg)?),
        #[cfg(feature = "audio-cpal")]
        SinkBackend::Cpal => Box::new(CpalSink::open(cfg)?),
        #[cfg(not(feature = "audio-cpal"))]
        SinkBackend::Cpal => {
            return Err(AudioShmError::Config(
                "built without the audio-cpal feature".to_string(),
            ))
        }
    };
    info!(
        backend = ?cfg.backend,
        device = cfg.device.as_str(),
        rate = cfg.rate,
        channels = cfg.channels,
        period_size = sink.period_size(),
        "opened sink"
    );
    Ok(sink)
}

/// Keeps time for a device buffer of fixed length drained at the sample rate.
///
/// Writes that would overfill the buffer block until a period's worth of room frees
/// up. A write arriving after the buffered audio ran out is an underrun.
#[derive(Debug)]
pub struct PlaybackClock {
    period: Duration,
    buffer: Duration,
    queued_until: Option<Instant>,
    xrun: bool,
}

impl PlaybackClock {
    pub fn new(period: Duration, buffer: Duration) -> Self {
        PlaybackClock {
            period,
            buffer: buffer.max(period),
            queued_until: None,
            xrun: false,
        }
    }

    /// Accounts for one more period entering the buffer.
    pub fn admit(&mut self) -> std::result::Result<(), SinkError> {
        if self.xrun {
            return Err(SinkError::Underrun);
        }
        let now = Instant::now();
        let next = match self.queued_until {
            None => now + self.period,
            Some(until) if until < now => {
                self.xrun = true;
                return Err(SinkError::Underrun);
            }
            Some(until) => until + self.period,
        };
        let limit = now + self.buffer;
        if next > limit {
            thread::sleep(next - limit);
        }
        self.queued_until = Some(next);
        Ok(())
    }

    pub fn prepare(&mut self) {
        self.queued_until = None;
        self.xrun = false;
    }

    pub fn drain(&mut self) {
        if let Some(until) = self.queued_until.take() {
            let now = Instant::now();
            if until > now {
                thread::sleep(until - now);
            }
        }
    }
}
