//! Output device through cpal.
//!
//! cpal pulls samples from a callback on its own audio thread, so writes go through a
//! lock-free SPSC ring sized to the configured buffer time. When the callback finds
//! the ring empty after playback started, the next `write` reports an underrun.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use tracing::{info, warn};

use super::Sink;
use crate::config::SinkConfig;
use crate::errors::{AudioShmError, Result, SinkError};

/// **Not `Send`**: `cpal::Stream` stays on the thread that opened it.
pub struct CpalSink {
    stream: Option<Stream>,
    producer: HeapProd<i16>,
    primed: Arc<AtomicBool>,
    starved: Arc<AtomicBool>,
    period_size: usize,
    channels: usize,
    period: Duration,
}

fn device_error(e: impl std::fmt::Display) -> AudioShmError {
    AudioShmError::Sink(SinkError::Device(e.to_string()))
}

impl CpalSink {
    pub fn open(cfg: &SinkConfig) -> Result<CpalSink> {
        let host = cpal::default_host();
        let found = if cfg.device == "default" {
            host.default_output_device()
        } else {
            host.output_devices()
                .map_err(device_error)?
                .find(|d| d.name().map(|n| n == cfg.device).unwrap_or(false))
        };
        let device = found
            .ok_or_else(|| device_error(format!("output device {:?} not found", cfg.device)))?;

        let period_size = cfg.period_size();
        let channels = cfg.channels as usize;
        let config = StreamConfig {
            channels: cfg.channels as u16,
            sample_rate: SampleRate(cfg.rate),
            buffer_size: BufferSize::Fixed(period_size as u32),
        };

        let buffer_frames = (cfg.rate as u64 * cfg.buffer_time_us as u64 / 1_000_000) as usize;
        let (producer, mut consumer) = HeapRb::<i16>::new(buffer_frames.max(period_size) * channels).split();
        let primed = Arc::new(AtomicBool::new(false));
        let starved = Arc::new(AtomicBool::new(false));

        let primed_cb = Arc::clone(&primed);
        let starved_cb = Arc::clone(&starved);
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let n = consumer.pop_slice(data);
                    if n < data.len() {
                        data[n..].fill(0);
                        if primed_cb.load(Ordering::Relaxed) {
                            starved_cb.store(true, Ordering::Relaxed);
                        }
                    }
                },
                |err| warn!("output stream error: {err}"),
                None,
            )
            .map_err(device_error)?;
        stream.play().map_err(device_error)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            period_size,
            buffer_frames,
            "opened output stream"
        );
        Ok(CpalSink {
            stream: Some(stream),
            producer,
            primed,
            starved,
            period_size,
            channels,
            period: cfg.period_duration(),
        })
    }
}

impl Sink for CpalSink {
    fn period_size(&self) -> usize {
        self.period_size
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, SinkError> {
        if self.stream.is_none() {
            return Err(SinkError::Device("sink is closed".to_string()));
        }
        if self.starved.load(Ordering::Relaxed) {
            return Err(SinkError::Underrun);
        }
        let mut written = 0;
        while written < samples.len() {
            written += self.producer.push_slice(&samples[written..]);
            if written < samples.len() {
                thread::sleep(self.period / 4);
            }
        }
        self.primed.store(true, Ordering::Relaxed);
        Ok(samples.len() / self.channels)
    }

    fn prepare(&mut self) -> std::result::Result<(), SinkError> {
        self.primed.store(false, Ordering::Relaxed);
        self.starved.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn drain(&mut self) -> std::result::Result<(), SinkError> {
        let deadline = Instant::now() + self.period * 64;
        while self.producer.occupied_len() > 0 && Instant::now() < deadline {
            thread::sleep(self.period / 4);
        }
        // The last period is still in the device once the ring is empty.
        thread::sleep(self.period);
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        if let Some(stream) = self.stream.take() {
            stream.pause().map_err(|e| SinkError::Device(e.to_string()))?;
        }
        Ok(())
    }
}
