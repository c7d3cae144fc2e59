use std::fs::File;
use std::io::BufWriter;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::debug;

use super::{PlaybackClock, Sink};
use crate::config::SinkConfig;
use crate::errors::{AudioShmError, Result, SinkError};

/// Plays into a WAV file at device pace.
pub struct WavSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    clock: PlaybackClock,
    period_size: usize,
    channels: usize,
    path: String,
}

impl WavSink {
    pub fn create(cfg: &SinkConfig) -> Result<WavSink> {
        let spec = WavSpec {
            channels: cfg.channels as u16,
            sample_rate: cfg.rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&cfg.output_path, spec).map_err(|e| {
            AudioShmError::Sink(SinkError::Device(format!("{}: {}", cfg.output_path, e)))
        })?;
        Ok(WavSink {
            writer: Some(writer),
            clock: PlaybackClock::new(cfg.period_duration(), cfg.buffer_duration()),
            period_size: cfg.period_size(),
            channels: cfg.channels as usize,
            path: cfg.output_path.clone(),
        })
    }
}

fn device_error(e: hound::Error) -> SinkError {
    SinkError::Device(e.to_string())
}

impl Sink for WavSink {
    fn period_size(&self) -> usize {
        self.period_size
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, SinkError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SinkError::Device("sink is closed".to_string()))?;
        self.clock.admit()?;
        for &sample in samples {
            writer.write_sample(sample).map_err(device_error)?;
        }
        Ok(samples.len() / self.channels)
    }

    fn prepare(&mut self) -> std::result::Result<(), SinkError> {
        self.clock.prepare();
        Ok(())
    }

    fn drain(&mut self) -> std::result::Result<(), SinkError> {
        self.clock.drain();
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(device_error)?;
        }
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize().map_err(device_error)?;
            debug!(path = self.path.as_str(), "finalized wav output");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkBackend;

    #[test]
    fn written_periods_end_up_in_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.wav");
        let cfg = SinkConfig {
            backend: SinkBackend::Wav,
            rate: 8_000,
            channels: 2,
            period_time_us: 4_000,
            buffer_time_us: 16_000,
            output_path: path.display().to_string(),
            ..Default::default()
        };
        let mut sink = WavSink::create(&cfg)?;
        assert_eq!(sink.period_size(), 32);
        let period = vec![7i16; 64];
        assert_eq!(sink.write(&period), Ok(32));
        assert_eq!(sink.write(&period), Ok(32));
        sink.drain()?;
        sink.close()?;
        assert!(sink.write(&period).is_err());

        let reader = hound::WavReader::open(&path).map_err(|e| AudioShmError::Config(e.to_string()))?;
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.len(), 128);
        Ok(())
    }
}
