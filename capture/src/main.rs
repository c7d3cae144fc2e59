use std::error::Error;
use std::io;
use std::process;
use std::thread;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use audioshm::channel::{Access, PosixQueue};
use audioshm::AudioShmError;
use audioshm::config::CaptureConfig;
use audioshm::core::Region;
use audioshm::producer::{Producer, Tone};
use audioshm::sched;
use audioshm::shutdown::Shutdown;
use audioshm::timing::TimingLog;

#[derive(clap::Parser)]
#[clap(about = "Publishes a synthetic tone to the playback process through shared memory")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "capture.toml")]
    config: String,
    /// Stop after this many periods instead of running until signalled. With 0 only
    /// the handshake is sent.
    periods: Option<u64>,
}

fn main() {
    let opts: Opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(&opts) {
        error!("{}", e);
        process::exit(1);
    }
}

fn run(opts: &Opts) -> Result<(), Box<dyn Error>> {
    let cfg: CaptureConfig = confy::load_path(&opts.config)?;
    let shutdown = Shutdown::on_signals()?;
    sched::set_realtime(cfg.realtime_priority).ok();

    let period_size = cfg.audio.period_size();
    let channels = cfg.audio.channels as usize;
    let queue = PosixQueue::open(&cfg.channel.name, Access::Send, cfg.channel.max_messages)?;
    let region = Region::open(&cfg.region, cfg.audio.period_bytes())?;
    let log = TimingLog::create(&cfg.log_path)?;
    let mut producer = Producer::new(region, queue, period_size, channels)?
        .with_log(log)
        .with_shutdown(shutdown.clone());
    let mut tone = Tone::new(cfg.tone_hz, cfg.audio.rate, channels);

    producer.announce()?;
    println!("[capture] running");

    let period = cfg.audio.period_duration();
    let mut next = Instant::now();
    let mut published = 0u64;
    while opts.periods.map_or(true, |n| published < n) && !shutdown.is_requested() {
        match producer.publish(|samples| tone.fill(samples)) {
            Ok(_) => published += 1,
            // Signalled while playback had not yet taken the slot.
            Err(AudioShmError::Interrupted) => break,
            Err(e) => return Err(e.into()),
        }
        if cfg.paced {
            next += period;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        }
    }

    producer.close()?;
    info!(published, "capture finished");
    Ok(())
}
