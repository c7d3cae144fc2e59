use std::path::PathBuf;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_RATE: u32 = 48_000;
pub const DEFAULT_CHANNELS: u32 = 2;
pub const DEFAULT_BUFFER_TIME_US: u32 = 21_334;
pub const DEFAULT_PERIOD_TIME_US: u32 = 5_334;

/// Shared memory placement. Both processes must use the same values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub data_dir: String,
    pub name: String,
    pub slot_count: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            data_dir: "/dev/shm".to_string(),
            name: "audioshm-output".to_string(),
            slot_count: 2,
        }
    }
}

impl RegionConfig {
    pub fn link_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// POSIX queue name, including the leading slash.
    pub name: String,
    pub max_messages: usize,
    pub handshake_timeout_ms: u64,
    /// How often a blocked steady-state receive wakes up to look at the shutdown flag.
    pub poll_interval_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            name: "/output".to_string(),
            max_messages: 10,
            handshake_timeout_ms: 5_000,
            poll_interval_ms: 100,
        }
    }
}

impl ChannelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkBackend {
    Null,
    Wav,
    Cpal,
}

/// Audio parameters requested from the sink device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub backend: SinkBackend,
    pub device: String,
    pub rate: u32,
    pub channels: u32,
    pub buffer_time_us: u32,
    pub period_time_us: u32,
    /// Destination of the `wav` backend.
    pub output_path: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            backend: SinkBackend::Null,
            device: "default".to_string(),
            rate: DEFAULT_RATE,
            channels: DEFAULT_CHANNELS,
            buffer_time_us: DEFAULT_BUFFER_TIME_US,
            period_time_us: DEFAULT_PERIOD_TIME_US,
            output_path: "/tmp/playback.wav".to_string(),
        }
    }
}

impl SinkConfig {
    /// Frames per period for the configured rate and period time.
    pub fn period_size(&self) -> usize {
        (self.rate as u64 * self.period_time_us as u64 / 1_000_000) as usize
    }

    pub fn period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.period_size() as f64 / self.rate.max(1) as f64)
    }

    pub fn buffer_duration(&self) -> Duration {
        Duration::from_micros(self.buffer_time_us as u64)
    }

    /// Bytes needed to hold one period of interleaved S16 samples.
    pub fn period_bytes(&self) -> usize {
        self.channels as usize * self.period_size() * std::mem::size_of::<i16>()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sink: SinkConfig,
    pub channel: ChannelConfig,
    pub region: RegionConfig,
    pub log_path: String,
    /// SCHED_FIFO priority; 0 leaves the scheduling class alone.
    pub realtime_priority: i32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            sink: SinkConfig::default(),
            channel: ChannelConfig::default(),
            region: RegionConfig::default(),
            log_path: "/tmp/log-playback".to_string(),
            realtime_priority: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Only the audio parameters are used; the producer never opens a device.
    pub audio: SinkConfig,
    pub channel: ChannelConfig,
    pub region: RegionConfig,
    pub log_path: String,
    pub realtime_priority: i32,
    pub tone_hz: f32,
    /// Sleep one period between publishes instead of producing as fast as possible.
    pub paced: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            audio: SinkConfig::default(),
            channel: ChannelConfig::default(),
            region: RegionConfig::default(),
            log_path: "/tmp/log-capture".to_string(),
            realtime_priority: 50,
            tone_hz: 440.0,
            paced: true,
        }
    }
}
