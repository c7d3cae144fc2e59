use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use crate::channel::{ControlChannel, LocalChannel, Message};
use crate::config::{ChannelConfig, PlaybackConfig, RegionConfig};
use crate::errors::{Result, SinkError};
use crate::sink::Sink;

mod teardown_tests;

pub(crate) const PERIOD: usize = 256;
pub(crate) const CHANNELS: usize = 2;
pub(crate) const SLOT_BYTES: usize = PERIOD * CHANNELS * 2;

/// What the fakes saw, shared with the test body.
#[derive(Debug, Default)]
pub(crate) struct Seen {
    /// First sample of every period that reached the device.
    pub played: Vec<i16>,
    pub writes: usize,
    pub prepares: usize,
    pub drains: usize,
    pub sink_closes: usize,
    pub channel_closes: usize,
}

pub(crate) type SharedSeen = Arc<Mutex<Seen>>;

pub(crate) fn seen() -> SharedSeen {
    Arc::new(Mutex::new(Seen::default()))
}

pub(crate) struct TestSink {
    seen: SharedSeen,
    period_size: usize,
    /// 1-based write numbers that report an underrun.
    underrun_on: Vec<usize>,
    /// 1-based write numbers that fail with a device error.
    error_on: Vec<usize>,
    write_delay: Duration,
}

impl TestSink {
    pub fn new(seen: &SharedSeen) -> Self {
        TestSink {
            seen: Arc::clone(seen),
            period_size: PERIOD,
            underrun_on: Vec::new(),
            error_on: Vec::new(),
            write_delay: Duration::from_millis(1),
        }
    }

    pub fn with_period(mut self, period_size: usize) -> Self {
        self.period_size = period_size;
        self
    }

    pub fn underrun_on(mut self, writes: &[usize]) -> Self {
        self.underrun_on = writes.to_vec();
        self
    }

    pub fn error_on(mut self, writes: &[usize]) -> Self {
        self.error_on = writes.to_vec();
        self
    }
}

impl Sink for TestSink {
    fn period_size(&self) -> usize {
        self.period_size
    }

    fn channels(&self) -> usize {
        CHANNELS
    }

    fn write(&mut self, samples: &[i16]) -> std::result::Result<usize, SinkError> {
        thread::sleep(self.write_delay);
        let mut seen = self.seen.lock().unwrap();
        seen.writes += 1;
        if self.underrun_on.contains(&seen.writes) {
            return Err(SinkError::Underrun);
        }
        if self.error_on.contains(&seen.writes) {
            return Err(SinkError::Device(format!("write {} rejected", seen.writes)));
        }
        assert_eq!(samples.len(), self.period_size * CHANNELS);
        seen.played.push(samples[0]);
        Ok(samples.len() / CHANNELS)
    }

    fn prepare(&mut self) -> std::result::Result<(), SinkError> {
        self.seen.lock().unwrap().prepares += 1;
        Ok(())
    }

    fn drain(&mut self) -> std::result::Result<(), SinkError> {
        self.seen.lock().unwrap().drains += 1;
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), SinkError> {
        self.seen.lock().unwrap().sink_closes += 1;
        Ok(())
    }
}

/// A [`LocalChannel`] that reports when it is closed.
pub(crate) struct TestChannel {
    inner: LocalChannel,
    seen: SharedSeen,
}

impl TestChannel {
    pub fn new(inner: LocalChannel, seen: &SharedSeen) -> Self {
        TestChannel {
            inner,
            seen: Arc::clone(seen),
        }
    }
}

impl ControlChannel for TestChannel {
    fn send(&mut self, msg: Message) -> Result<()> {
        self.inner.send(msg)
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        self.inner.recv(timeout)
    }

    fn close(&mut self) -> Result<()> {
        self.seen.lock().unwrap().channel_closes += 1;
        self.inner.close()
    }
}

pub(crate) fn playback_cfg(dir: &TempDir, slot_count: usize) -> PlaybackConfig {
    PlaybackConfig {
        channel: ChannelConfig {
            handshake_timeout_ms: 2_000,
            poll_interval_ms: 10,
            ..Default::default()
        },
        region: RegionConfig {
            data_dir: dir.path().display().to_string(),
            name: "ring".to_string(),
            slot_count,
        },
        log_path: dir.path().join("log-playback").display().to_string(),
        realtime_priority: 0,
        ..Default::default()
    }
}
