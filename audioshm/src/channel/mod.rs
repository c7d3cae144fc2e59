//! Control messages between producer and consumer.
//!
//! A session starts with a one-time handshake (a marker, then the producer's period
//! size) and then carries exactly one slot index per produced period, in production
//! order. Every message is 8 bytes: a little-endian tag followed by a little-endian value.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::errors::{AudioShmError, Result};
use crate::shutdown::Shutdown;

mod local;
#[cfg(target_os = "linux")]
mod posix;

pub use local::LocalChannel;
#[cfg(target_os = "linux")]
pub use posix::{Access, PosixQueue};

pub const MESSAGE_SIZE: usize = 8;
pub const PROTOCOL_VERSION: u32 = 1;

const TAG_MARKER: u32 = 1;
const TAG_PERIOD_SIZE: u32 = 2;
const TAG_SLOT: u32 = 3;

// Upper bound on how late the handshake notices a shutdown request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// Start of a session, carrying the producer's protocol version.
    Marker(u32),
    /// Frames per period on the producer side.
    PeriodSize(u32),
    /// A slot that was just filled.
    Slot(u32),
}

impl Message {
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let (tag, value) = match *self {
            Message::Marker(v) => (TAG_MARKER, v),
            Message::PeriodSize(v) => (TAG_PERIOD_SIZE, v),
            Message::Slot(v) => (TAG_SLOT, v),
        };
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[..4].copy_from_slice(&tag.to_le_bytes());
        buf[4..].copy_from_slice(&value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() != MESSAGE_SIZE {
            return Err(AudioShmError::Protocol(format!(
                "message of {} bytes, expected {}",
                buf.len(),
                MESSAGE_SIZE
            )));
        }
        let tag = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let value = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        match tag {
            TAG_MARKER => Ok(Message::Marker(value)),
            TAG_PERIOD_SIZE => Ok(Message::PeriodSize(value)),
            TAG_SLOT => Ok(Message::Slot(value)),
            _ => Err(AudioShmError::Protocol(format!("unknown message tag {}", tag))),
        }
    }
}

/// A bounded FIFO of control messages shared by the two processes.
pub trait ControlChannel {
    fn send(&mut self, msg: Message) -> Result<()>;

    /// Blocks for the next message. Returns `Ok(None)` when `timeout` elapsed, or when
    /// the wait was interrupted, before anything arrived.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Message>>;

    fn close(&mut self) -> Result<()>;
}

impl<C: ControlChannel + ?Sized> ControlChannel for Box<C> {
    fn send(&mut self, msg: Message) -> Result<()> {
        (**self).send(msg)
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Message>> {
        (**self).recv(timeout)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Producer half of the handshake.
pub fn announce<C: ControlChannel + ?Sized>(channel: &mut C, period_size: u32) -> Result<()> {
    channel.send(Message::Marker(PROTOCOL_VERSION))?;
    channel.send(Message::PeriodSize(period_size))?;
    debug!(period_size, "announced session");
    Ok(())
}

/// Receives the next message before `deadline`, in short waits so that a shutdown
/// request ends the wait early with [`AudioShmError::Interrupted`].
fn recv_before<C: ControlChannel + ?Sized>(
    channel: &mut C,
    deadline: Instant,
    shutdown: &Shutdown,
) -> Result<Option<Message>> {
    loop {
        if shutdown.is_requested() {
            return Err(AudioShmError::Interrupted);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        if let Some(msg) = channel.recv(Some(remaining.min(SHUTDOWN_POLL)))? {
            return Ok(Some(msg));
        }
    }
}

/// Consumer half of the handshake.
///
/// Waits up to `timeout` for the marker, dropping anything queued ahead of it (slot
/// indices left over from an earlier session), then requires the producer's period
/// size to equal `local_period`. A shutdown request aborts the wait.
pub fn await_handshake<C: ControlChannel + ?Sized>(
    channel: &mut C,
    local_period: u32,
    timeout: Duration,
    shutdown: &Shutdown,
) -> Result<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        match recv_before(channel, deadline, shutdown) {
            Ok(Some(Message::Marker(PROTOCOL_VERSION))) => break,
            Ok(Some(Message::Marker(version))) => {
                return Err(AudioShmError::Protocol(format!(
                    "producer speaks protocol version {}, expected {}",
                    version, PROTOCOL_VERSION
                )));
            }
            Ok(Some(stale)) => debug!(?stale, "discarding message queued before the marker"),
            Ok(None) => return Err(AudioShmError::HandshakeTimeout(timeout)),
            Err(AudioShmError::Protocol(reason)) => warn!(%reason, "discarding malformed message"),
            Err(e) => return Err(e),
        }
    }

    match recv_before(channel, Instant::now() + timeout, shutdown)? {
        Some(Message::PeriodSize(producer)) if producer == local_period => {
            info!(period_size = producer, "handshake complete");
            Ok(producer)
        }
        Some(Message::PeriodSize(producer)) => Err(AudioShmError::PeriodMismatch {
            producer,
            consumer: local_period,
        }),
        Some(other) => Err(AudioShmError::Protocol(format!(
            "expected the period size after the marker, got {:?}",
            other
        ))),
        None => Err(AudioShmError::HandshakeTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layout() {
        assert_eq!(Message::Slot(3).encode(), [3, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(
            Message::PeriodSize(256).encode(),
            [2, 0, 0, 0, 0, 1, 0, 0]
        );
        assert_eq!(
            Message::decode(&[1, 0, 0, 0, 1, 0, 0, 0]).ok(),
            Some(Message::Marker(1))
        );
    }

    #[test]
    fn decode_rejects_bad_input() {
        assert!(Message::decode(&[3, 0, 0, 0]).is_err());
        assert!(Message::decode(&[9, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn handshake_accepts_matching_period() -> Result<()> {
        let mut producer = LocalChannel::new(10);
        let mut consumer = producer.clone();
        announce(&mut producer, 256)?;
        let period =
            await_handshake(&mut consumer, 256, Duration::from_millis(200), &Shutdown::new())?;
        assert_eq!(period, 256);
        Ok(())
    }

    #[test]
    fn handshake_rejects_mismatched_period() -> Result<()> {
        for (producer_period, consumer_period) in [(256, 512), (512, 256), (1, 0)] {
            let mut producer = LocalChannel::new(10);
            let mut consumer = producer.clone();
            announce(&mut producer, producer_period)?;
            let timeout = Duration::from_millis(200);
            match await_handshake(&mut consumer, consumer_period, timeout, &Shutdown::new()) {
                Err(AudioShmError::PeriodMismatch { producer, consumer }) => {
                    assert_eq!(producer, producer_period);
                    assert_eq!(consumer, consumer_period);
                }
                other => panic!("expected mismatch, got {:?}", other),
            }
        }
        Ok(())
    }

    #[test]
    fn handshake_times_out_without_a_producer() {
        let mut consumer = LocalChannel::new(10);
        let started = Instant::now();
        let result = await_handshake(&mut consumer, 256, Duration::from_millis(50), &Shutdown::new());
        assert!(matches!(result, Err(AudioShmError::HandshakeTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn shutdown_ends_the_wait_for_a_producer() {
        let mut consumer = LocalChannel::new(10);
        let shutdown = Shutdown::new();
        let trigger = {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                shutdown.request();
            })
        };
        let started = Instant::now();
        let result = await_handshake(&mut consumer, 256, Duration::from_secs(5), &shutdown);
        trigger.join().unwrap();
        assert!(matches!(result, Err(AudioShmError::Interrupted)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn pending_shutdown_wins_over_a_queued_marker() -> Result<()> {
        let mut producer = LocalChannel::new(10);
        let mut consumer = producer.clone();
        producer.send(Message::Marker(PROTOCOL_VERSION))?;
        let shutdown = Shutdown::new();
        shutdown.request();
        assert!(matches!(
            await_handshake(&mut consumer, 256, Duration::from_secs(5), &shutdown),
            Err(AudioShmError::Interrupted)
        ));
        Ok(())
    }

    #[test]
    fn handshake_skips_stale_indices() -> Result<()> {
        let mut producer = LocalChannel::new(10);
        let mut consumer = producer.clone();
        producer.send(Message::Slot(0))?;
        producer.send(Message::Slot(1))?;
        announce(&mut producer, 128)?;
        producer.send(Message::Slot(0))?;

        let timeout = Duration::from_millis(200);
        assert_eq!(await_handshake(&mut consumer, 128, timeout, &Shutdown::new())?, 128);
        assert_eq!(consumer.recv(Some(Duration::from_millis(10)))?, Some(Message::Slot(0)));
        Ok(())
    }

    #[test]
    fn slot_index_in_place_of_period_size_is_a_violation() -> Result<()> {
        let mut producer = LocalChannel::new(10);
        let mut consumer = producer.clone();
        producer.send(Message::Marker(PROTOCOL_VERSION))?;
        producer.send(Message::Slot(1))?;
        assert!(matches!(
            await_handshake(&mut consumer, 128, Duration::from_millis(200), &Shutdown::new()),
            Err(AudioShmError::Protocol(_))
        ));
        Ok(())
    }
}
