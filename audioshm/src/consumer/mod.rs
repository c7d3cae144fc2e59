//! The playback side: startup negotiation, the real-time service loop and teardown.

use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::channel::{await_handshake, ControlChannel, Message};
use crate::config::{ChannelConfig, PlaybackConfig, SinkConfig};
use crate::core::Region;
use crate::errors::{AudioShmError, Result, SinkError, StartupError};
use crate::lifecycle::{Release, ResourceStack, Stage, State, TeardownReport};
use crate::sched;
use crate::shutdown::Shutdown;
use crate::sink::Sink;
use crate::timing::{now_us, TimingLog};

/// Counters for one run of the service loop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    /// Slot notifications consumed, including dropped periods.
    pub periods: u64,
    pub played: u64,
    pub underruns: u64,
    pub write_errors: u64,
    /// Messages that were not a valid slot index.
    pub skipped: u64,
    pub interrupted: bool,
}

struct Held<S, C> {
    sink: Option<S>,
    channel: Option<C>,
    region: Option<Region>,
    log: Option<TimingLog>,
    // Only a session that reached the end of its run removes the region.
    destroy_region: bool,
}

impl<S: Sink, C: ControlChannel> Release for Held<S, C> {
    fn release(&mut self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Log => {
                if let Some(mut log) = self.log.take() {
                    log.close()?;
                }
            }
            Stage::Region => {
                if let Some(region) = self.region.take() {
                    if self.destroy_region {
                        region.destroy();
                    } else {
                        region.close();
                    }
                }
            }
            Stage::Channel => {
                if let Some(mut channel) = self.channel.take() {
                    channel.close()?;
                }
            }
            Stage::Sink => {
                if let Some(mut sink) = self.sink.take() {
                    sink.close()?;
                }
            }
            Stage::Handshake => {}
        }
        Ok(())
    }
}

/// A consumer session owning the sink, the notification channel, the shared region
/// and the timing log, acquired in that order and released in reverse.
///
/// Dropping a session that was not closed releases whatever it still holds.
pub struct Session<S: Sink, C: ControlChannel> {
    held: Held<S, C>,
    stack: ResourceStack,
    state: State,
    period_size: usize,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl<S: Sink, C: ControlChannel> Session<S, C> {
    /// Runs `Initializing` and `Handshaking`. On success the session is `Running`;
    /// on failure everything acquired so far has been released.
    pub fn open<FS, FC>(
        cfg: &PlaybackConfig,
        open_sink: FS,
        open_channel: FC,
        shutdown: Shutdown,
    ) -> std::result::Result<Self, StartupError>
    where
        FS: FnOnce(&SinkConfig) -> Result<S>,
        FC: FnOnce(&ChannelConfig) -> Result<C>,
    {
        let mut session = Session {
            held: Held {
                sink: None,
                channel: None,
                region: None,
                log: None,
                destroy_region: false,
            },
            stack: ResourceStack::new(),
            state: State::Initializing,
            period_size: 0,
            poll_interval: cfg.channel.poll_interval(),
            shutdown,
        };

        // Best effort: without the privilege we still play, with more jitter.
        sched::set_realtime(cfg.realtime_priority).ok();

        let sink = session.step(Stage::Sink, open_sink(&cfg.sink))?;
        let period_size = sink.period_size();
        let channels = sink.channels();
        session.held.sink = Some(sink);
        session.stack.push(Stage::Sink);
        session.period_size = period_size;

        let channel = session.step(Stage::Channel, open_channel(&cfg.channel))?;
        session.held.channel = Some(channel);
        session.stack.push(Stage::Channel);

        session.enter(State::Handshaking);
        let handshake = match session.held.channel.as_mut() {
            Some(channel) => await_handshake(
                channel,
                period_size as u32,
                cfg.channel.handshake_timeout(),
                &session.shutdown,
            ),
            None => Err(AudioShmError::Protocol("channel is not open".to_string())),
        };
        session.step(Stage::Handshake, handshake)?;

        let capacity = channels * period_size * std::mem::size_of::<i16>();
        let region = session.step(Stage::Region, Region::open(&cfg.region, capacity))?;
        session.held.region = Some(region);
        session.stack.push(Stage::Region);

        let log = session.step(Stage::Log, TimingLog::create(&cfg.log_path))?;
        session.held.log = Some(log);
        session.stack.push(Stage::Log);

        session.enter(State::Running);
        Ok(session)
    }

    fn enter(&mut self, state: State) {
        debug!(from = ?self.state, to = ?state, "session state");
        self.state = state;
    }

    fn step<T>(&mut self, stage: Stage, result: Result<T>) -> std::result::Result<T, StartupError> {
        result.map_err(|source| {
            self.enter(State::Aborting);
            error!(%stage, error = %source, "{}", stage.failure());
            let report = self.stack.release_all(&mut self.held);
            debug!(released = ?report.released, "aborted startup");
            StartupError { stage, source }
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Frames per period agreed with the producer.
    pub fn period_size(&self) -> usize {
        self.period_size
    }

    /// Resources currently held, in acquisition order.
    pub fn acquired(&self) -> &[Stage] {
        self.stack.stages()
    }

    /// The `Running` loop. Consumes one slot notification per iteration until `budget`
    /// periods were consumed (`None` is unbounded) or shutdown was requested, then
    /// moves to `Draining`.
    ///
    /// Underruns drop the current period and re-prepare the sink; other write errors
    /// are reported and the loop goes on. Only a failing queue or slot lock ends the
    /// loop early with an error. Each slot is marked consumed before its lock is
    /// released, which lets the producer refill it.
    pub fn run(&mut self, budget: Option<u64>) -> Result<RunStats> {
        if self.state != State::Running {
            return Err(AudioShmError::Protocol(format!(
                "cannot run a session in state {:?}",
                self.state
            )));
        }
        let poll = self.poll_interval;
        let shutdown = self.shutdown.clone();
        let result = {
            let Held {
                sink,
                channel,
                region,
                log,
                ..
            } = &mut self.held;
            match (sink.as_mut(), channel.as_mut(), region.as_ref(), log.as_mut()) {
                (Some(sink), Some(channel), Some(region), Some(log)) => {
                    service(sink, channel, region, log, budget, poll, &shutdown)
                }
                _ => Err(AudioShmError::Protocol("session resources missing".to_string())),
            }
        };
        self.enter(State::Draining);
        result
    }

    /// `Draining` then `Closed`: lets the sink play out what it buffered, then
    /// releases every resource in reverse acquisition order. The shared region is
    /// removed, since the consumer owns its final teardown.
    pub fn close(mut self) -> TeardownReport {
        if self.state != State::Draining {
            self.enter(State::Draining);
        }
        if let Some(sink) = self.held.sink.as_mut() {
            if let Err(e) = sink.drain() {
                warn!(error = %e, "drain failed");
            }
        }
        self.held.destroy_region = true;
        let report = self.stack.release_all(&mut self.held);
        self.enter(State::Closed);
        report
    }
}

impl<S: Sink, C: ControlChannel> Drop for Session<S, C> {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            self.stack.release_all(&mut self.held);
        }
    }
}

fn service<S: Sink, C: ControlChannel>(
    sink: &mut S,
    channel: &mut C,
    region: &Region,
    log: &mut TimingLog,
    budget: Option<u64>,
    poll: Duration,
    shutdown: &Shutdown,
) -> Result<RunStats> {
    let mut stats = RunStats::default();
    let mut remaining = budget;

    while remaining != Some(0) {
        if shutdown.is_requested() {
            info!(periods = stats.periods, "shutdown requested");
            stats.interrupted = true;
            break;
        }

        // The poll interval only bounds how late a shutdown request is noticed.
        let msg = match channel.recv(Some(poll)) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(AudioShmError::Protocol(reason)) => {
                warn!(%reason, "skipping malformed notification");
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        let index = match msg {
            Message::Slot(index) => index as usize,
            other => {
                warn!(?other, "skipping unexpected notification");
                stats.skipped += 1;
                continue;
            }
        };
        let view = match region.slot(index) {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "skipping notification");
                stats.skipped += 1;
                continue;
            }
        };

        // A slot held by a stalled producer must not keep a shutdown waiting.
        let mut slot = match region.acquire_interruptible(index, shutdown, poll) {
            Ok(slot) => slot,
            Err(AudioShmError::Interrupted) => {
                info!(periods = stats.periods, slot = index, "shutdown requested in slot wait");
                stats.interrupted = true;
                break;
            }
            Err(e) => return Err(e),
        };
        trace!(slot = index, sequence_id = view.sequence_id, "consuming period");
        if let Err(e) = log.append(view.sequence_id, now_us()) {
            warn!(error = %e, sequence_id = view.sequence_id, "could not write timing record");
        }
        match sink.write(slot.samples()) {
            Ok(_) => stats.played += 1,
            Err(SinkError::Underrun) => {
                stats.underruns += 1;
                warn!(sequence_id = view.sequence_id, "underrun, dropping period");
                if let Err(e) = sink.prepare() {
                    warn!(error = %e, "prepare after underrun failed");
                }
            }
            Err(SinkError::Device(e)) => {
                stats.write_errors += 1;
                error!(sequence_id = view.sequence_id, "write error: {}", e);
            }
        }
        slot.mark_consumed();
        slot.release();

        stats.periods += 1;
        if let Some(r) = remaining.as_mut() {
            *r -= 1;
        }
    }
    Ok(stats)
}

/// Opens a session on the configured sink backend and the POSIX queue.
#[cfg(target_os = "linux")]
pub fn open_posix(
    cfg: &PlaybackConfig,
    shutdown: Shutdown,
) -> std::result::Result<Session<Box<dyn Sink>, crate::channel::PosixQueue>, StartupError> {
    use crate::channel::{Access, PosixQueue};

    Session::open(
        cfg,
        crate::sink::open,
        |c| PosixQueue::open(&c.name, Access::Receive, c.max_messages),
        shutdown,
    )
}
