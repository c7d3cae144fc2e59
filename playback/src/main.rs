use std::error::Error;
use std::io;
use std::process;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use audioshm::config::PlaybackConfig;
use audioshm::consumer;
use audioshm::shutdown::Shutdown;

#[derive(clap::Parser)]
#[clap(about = "Plays the periods a capture process publishes through shared memory")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "playback.toml")]
    config: String,
    /// Stop after this many periods instead of running until signalled. With 0 the
    /// session starts up and closes again without consuming anything.
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
    let cfg: PlaybackConfig = confy::load_path(&opts.config)?;
    let shutdown = Shutdown::on_signals()?;

    let mut session = consumer::open_posix(&cfg, shutdown)?;
    println!("[playback] running");

    let outcome = session.run(opts.periods);
    let report = session.close();
    for (stage, e) in &report.failed {
        warn!(%stage, error = %e, "teardown step failed");
    }
    let stats = outcome?;
    info!(
        periods = stats.periods,
        played = stats.played,
        underruns = stats.underruns,
        write_errors = stats.write_errors,
        skipped = stats.skipped,
        "playback finished"
    );
    Ok(())
}
