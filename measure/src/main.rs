use std::error::Error;
use std::fs::OpenOptions;
use std::io::{self, Write};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use audioshm::timing::{analyze, read_log, LatencyReport};

/// Reports per-hop latency between timing logs listed upstream first, e.g.
/// `measure /tmp/log-capture /tmp/log-playback`.
#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(required = true, min_values = 2)]
    logs: Vec<String>,
    /// Append one row per hop to this CSV file.
    #[clap(long = "csv")]
    csv: Option<String>,
    #[clap(long = "label", default_value = "run")]
    label: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let logs = opts
        .logs
        .iter()
        .map(|path| read_log(path).map_err(|e| format!("{}: {}", path, e)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::new();
    for (i, pair) in logs.windows(2).enumerate() {
        let hop = format!("{} -> {}", opts.logs[i], opts.logs[i + 1]);
        rows.push((hop, analyze(&pair[0], &pair[1])));
    }
    if logs.len() > 2 {
        let total = format!("{} -> {}", opts.logs[0], opts.logs[logs.len() - 1]);
        rows.push((total, analyze(&logs[0], &logs[logs.len() - 1])));
    }

    for (hop, report) in &rows {
        println!("{}: {}", hop, report);
    }
    if let Some(path) = &opts.csv {
        append_csv(path, &opts.label, &rows)?;
    }
    Ok(())
}

fn append_csv(path: &str, label: &str, rows: &[(String, LatencyReport)]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(file, "label,hop,count,missing,mean_us,std_dev_us,min_us,max_us,drift_us_per_period")?;
    }
    for (hop, r) in rows {
        writeln!(
            file,
            "{},{},{},{},{:.3},{:.3},{},{},{:.6}",
            label, hop, r.count, r.missing, r.mean_us, r.std_dev_us, r.min_us, r.max_us, r.drift_us_per_period
        )?;
    }
    Ok(())
}
