//! The capture side: fills slots round-robin and announces each one on the channel.

use std::f32::consts::TAU;
use std::thread;
use std::time::Duration;

use tracing::{info, trace};

use crate::channel::{announce, ControlChannel, Message};
use crate::core::Region;
use crate::errors::{AudioShmError, Result};
use crate::shutdown::Shutdown;
use crate::timing::{now_us, TimingLog};

const LOCK_POLL: Duration = Duration::from_millis(50);
const CONSUMED_POLL: Duration = Duration::from_micros(200);

/// Where one period went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    pub slot: usize,
    pub sequence_id: u64,
}

pub struct Producer<C: ControlChannel> {
    region: Region,
    channel: C,
    period_size: usize,
    next_slot: usize,
    next_sequence: u64,
    // Sequence id written into each slot and not yet seen consumed, 0 for none.
    unread: Vec<u64>,
    log: Option<TimingLog>,
    shutdown: Shutdown,
}

impl<C: ControlChannel> Producer<C> {
    /// `region` slots must hold exactly one period of `channels` interleaved samples.
    pub fn new(region: Region, channel: C, period_size: usize, channels: usize) -> Result<Self> {
        let expected = period_size * channels * std::mem::size_of::<i16>();
        if expected == 0 || region.slot_capacity() != expected {
            return Err(AudioShmError::Layout(format!(
                "slots of {} bytes cannot carry {} frames of {} channels",
                region.slot_capacity(),
                period_size,
                channels
            )));
        }
        Ok(Producer {
            channel,
            period_size,
            next_slot: 0,
            next_sequence: 1,
            unread: vec![0; region.slot_count()],
            log: None,
            shutdown: Shutdown::new(),
            region,
        })
    }

    /// Records a timestamp for every published period.
    pub fn with_log(mut self, log: TimingLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Lets a shutdown request end a wait for a slot.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn period_size(&self) -> usize {
        self.period_size
    }

    /// Sends the session marker and the period size.
    pub fn announce(&mut self) -> Result<()> {
        announce(&mut self.channel, self.period_size as u32)
    }

    /// Fills the next slot under its lock, stamps it with the next sequence id and
    /// announces it.
    ///
    /// Blocks until the consumer has taken the period last written to that slot, so
    /// a fast producer never overwrites unread data. Returns
    /// [`AudioShmError::Interrupted`] if shutdown is requested meanwhile.
    pub fn publish<F>(&mut self, fill: F) -> Result<Published>
    where
        F: FnOnce(&mut [i16]),
    {
        let published = Published {
            slot: self.next_slot,
            sequence_id: self.next_sequence,
        };
        let unread = self.unread[published.slot];
        let mut slot = loop {
            let slot = self
                .region
                .acquire_interruptible(published.slot, &self.shutdown, LOCK_POLL)?;
            if unread == 0 || slot.consumed() == unread {
                break slot;
            }
            slot.release();
            if self.shutdown.is_requested() {
                return Err(AudioShmError::Interrupted);
            }
            thread::sleep(CONSUMED_POLL);
        };
        fill(slot.samples_mut());
        slot.set_sequence_id(published.sequence_id);
        slot.release();
        self.unread[published.slot] = published.sequence_id;
        if let Some(log) = self.log.as_mut() {
            log.append(published.sequence_id, now_us())?;
        }
        self.channel.send(Message::Slot(published.slot as u32))?;

        self.next_slot = (published.slot + 1) % self.region.slot_count();
        self.next_sequence += 1;
        trace!(slot = published.slot, sequence_id = published.sequence_id, "published period");
        Ok(published)
    }

    /// Flushes the log and detaches. The region is left for the consumer to remove.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut log) = self.log.take() {
            log.close()?;
        }
        self.channel.close()?;
        info!(published = self.next_sequence - 1, "producer closed");
        self.region.close();
        Ok(())
    }
}

/// A sine tone written identically to every channel.
#[derive(Debug, Clone)]
pub struct Tone {
    phase: f32,
    step: f32,
    amplitude: f32,
    channels: usize,
}

impl Tone {
    pub fn new(frequency_hz: f32, rate: u32, channels: usize) -> Self {
        Tone {
            phase: 0.0,
            step: TAU * frequency_hz / rate.max(1) as f32,
            amplitude: i16::MAX as f32 * 0.25,
            channels: channels.max(1),
        }
    }

    pub fn fill(&mut self, samples: &mut [i16]) {
        for frame in samples.chunks_mut(self.channels) {
            let value = (self.phase.sin() * self.amplitude) as i16;
            frame.fill(value);
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}
