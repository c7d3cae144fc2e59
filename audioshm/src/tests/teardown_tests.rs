use std::cell::Cell;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::consumer::Session;
use crate::core::Region;
use crate::errors::{AudioShmError, StartupError};
use crate::lifecycle::Stage;
use crate::shutdown::Shutdown;

fn announced() -> Result<LocalChannel> {
    let mut channel = LocalChannel::new(10);
    crate::channel::announce(&mut channel, PERIOD as u32)?;
    Ok(channel)
}

fn open_with(
    cfg: &PlaybackConfig,
    seen: &SharedSeen,
    sink_fails: bool,
    channel_fails: bool,
    channel: LocalChannel,
) -> std::result::Result<Session<TestSink, TestChannel>, StartupError> {
    Session::open(
        cfg,
        |_| {
            if sink_fails {
                Err(AudioShmError::Sink(SinkError::Device("no such card".to_string())))
            } else {
                Ok(TestSink::new(seen))
            }
        },
        |_| {
            if channel_fails {
                Err(AudioShmError::Protocol("queue refused".to_string()))
            } else {
                Ok(TestChannel::new(channel, seen))
            }
        },
        Shutdown::new(),
    )
}

fn failed_stage<T>(result: std::result::Result<T, StartupError>) -> Stage {
    match result {
        Err(e) => e.stage,
        Ok(_) => panic!("startup should have failed"),
    }
}

#[test]
fn sink_failure_acquires_nothing_else() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = playback_cfg(&dir, 2);
    let seen = seen();
    let channel_opened = Cell::new(false);

    let result = Session::<TestSink, TestChannel>::open(
        &cfg,
        |_| Err(AudioShmError::Sink(SinkError::Device("no such card".to_string()))),
        |_| {
            channel_opened.set(true);
            Ok(TestChannel::new(LocalChannel::new(1), &seen))
        },
        Shutdown::new(),
    );
    assert_eq!(failed_stage(result), Stage::Sink);
    assert!(!channel_opened.get());
    assert_eq!(seen.lock().unwrap().sink_closes, 0);
    Ok(())
}

#[test]
fn channel_failure_closes_the_sink() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = playback_cfg(&dir, 2);
    let seen = seen();

    let stage = failed_stage(open_with(&cfg, &seen, false, true, announced()?));
    assert_eq!(stage, Stage::Channel);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.sink_closes, 1);
    assert_eq!(seen.channel_closes, 0);
    Ok(())
}

#[test]
fn handshake_timeout_closes_sink_and_channel() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = playback_cfg(&dir, 2);
    cfg.channel.handshake_timeout_ms = 50;
    let seen = seen();

    let result = open_with(&cfg, &seen, false, false, LocalChannel::new(10));
    match result {
        Err(StartupError {
            stage: Stage::Handshake,
            source: AudioShmError::HandshakeTimeout(_),
        }) => {}
        Err(e) => panic!("unexpected failure: {}", e),
        Ok(_) => panic!("startup should have failed"),
    }
    let seen = seen.lock().unwrap();
    assert_eq!(seen.sink_closes, 1);
    assert_eq!(seen.channel_closes, 1);
    assert!(!cfg.region.link_path().exists());
    Ok(())
}

#[test]
fn shutdown_during_handshake_aborts_startup_promptly() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = playback_cfg(&dir, 2);
    cfg.channel.handshake_timeout_ms = 5_000;
    let seen = seen();
    let shutdown = Shutdown::new();

    let trigger = {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            shutdown.request();
        })
    };
    let started = Instant::now();
    let result = Session::open(
        &cfg,
        |_| Ok(TestSink::new(&seen)),
        |_| Ok(TestChannel::new(LocalChannel::new(10), &seen)),
        shutdown,
    );
    trigger.join().unwrap();
    match result {
        Err(StartupError {
            stage: Stage::Handshake,
            source: AudioShmError::Interrupted,
        }) => {}
        Err(e) => panic!("unexpected failure: {}", e),
        Ok(_) => panic!("startup should have failed"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    let seen = seen.lock().unwrap();
    assert_eq!(seen.sink_closes, 1);
    assert_eq!(seen.channel_closes, 1);
    assert!(!cfg.region.link_path().exists());
    Ok(())
}

#[test]
fn region_failure_closes_channel_then_sink() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = playback_cfg(&dir, 0);
    let seen = seen();

    let stage = failed_stage(open_with(&cfg, &seen, false, false, announced()?));
    assert_eq!(stage, Stage::Region);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.sink_closes, 1);
    assert_eq!(seen.channel_closes, 1);
    assert!(!Path::new(&cfg.log_path).exists());
    Ok(())
}

#[test]
fn log_failure_releases_the_region_without_removing_it() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = playback_cfg(&dir, 2);
    cfg.log_path = dir.path().join("missing").join("log").display().to_string();
    let seen = seen();

    let stage = failed_stage(open_with(&cfg, &seen, false, false, announced()?));
    assert_eq!(stage, Stage::Log);
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.sink_closes, 1);
        assert_eq!(seen.channel_closes, 1);
    }

    // The mapping is only detached; a later session can still attach to it.
    assert!(cfg.region.link_path().exists());
    Region::open(&cfg.region, SLOT_BYTES)?.destroy();
    Ok(())
}

#[test]
fn dropping_a_running_session_releases_everything() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = playback_cfg(&dir, 2);
    let seen = seen();

    let session = open_with(&cfg, &seen, false, false, announced()?).map_err(|e| e.source)?;
    assert_eq!(session.acquired().len(), 4);
    drop(session);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.sink_closes, 1);
    assert_eq!(seen.channel_closes, 1);
    assert_eq!(seen.drains, 0);
    Region::open(&cfg.region, SLOT_BYTES)?.destroy();
    Ok(())
}
