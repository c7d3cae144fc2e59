//! Per-period timing records and offline latency/drift analysis.
//!
//! Each process that touches a period appends `"<sequence_id> <timestamp_us>\n"` to its
//! own log. Joining two logs on the sequence id gives the latency of that hop.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::errors::{AudioShmError, Result};

/// Wall-clock time in microseconds.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingRecord {
    pub sequence_id: u64,
    pub timestamp_us: u64,
}

impl fmt::Display for TimingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sequence_id, self.timestamp_us)
    }
}

impl FromStr for TimingRecord {
    type Err = AudioShmError;

    fn from_str(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let mut next = |what: &str| -> Result<u64> {
            fields
                .next()
                .ok_or_else(|| AudioShmError::Protocol(format!("missing {} in {:?}", what, line)))?
                .parse::<u64>()
                .map_err(|e| AudioShmError::Protocol(format!("bad {} in {:?}: {}", what, line, e)))
        };
        let sequence_id = next("sequence id")?;
        let timestamp_us = next("timestamp")?;
        Ok(TimingRecord {
            sequence_id,
            timestamp_us,
        })
    }
}

/// Append-only log of [`TimingRecord`]s. Truncated when opened.
pub struct TimingLog {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    records: u64,
}

impl TimingLog {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<TimingLog> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        debug!(path = %path.display(), "opened timing log");
        Ok(TimingLog {
            writer: Some(BufWriter::new(file)),
            path,
            records: 0,
        })
    }

    pub fn append(&mut self, sequence_id: u64, timestamp_us: u64) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            AudioShmError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "timing log is closed",
            ))
        })?;
        writeln!(writer, "{} {}", sequence_id, timestamp_us)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(path = %self.path.display(), records = self.records, "closed timing log");
        }
        Ok(())
    }
}

pub fn read_log<P: AsRef<Path>>(path: P) -> Result<Vec<TimingRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(line.parse()?);
    }
    Ok(records)
}

/// Latency statistics of one hop between two logs, in microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    pub count: usize,
    /// Sequence ids present upstream but absent downstream.
    pub missing: usize,
    pub mean_us: f64,
    /// Sample standard deviation.
    pub std_dev_us: f64,
    pub min_us: i64,
    pub max_us: i64,
    /// Least-squares slope of latency against period index.
    pub drift_us_per_period: f64,
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={} missing={} mean={:.1}us sd={:.1}us min={}us max={}us drift={:.3}us/period",
            self.count,
            self.missing,
            self.mean_us,
            self.std_dev_us,
            self.min_us,
            self.max_us,
            self.drift_us_per_period
        )
    }
}

/// Joins `downstream` onto `upstream` by sequence id, in upstream order.
pub fn analyze(upstream: &[TimingRecord], downstream: &[TimingRecord]) -> LatencyReport {
    let arrivals: HashMap<u64, u64> = downstream
        .iter()
        .map(|r| (r.sequence_id, r.timestamp_us))
        .collect();

    let mut latencies = Vec::with_capacity(upstream.len());
    let mut missing = 0;
    for r in upstream {
        match arrivals.get(&r.sequence_id) {
            Some(&t) => latencies.push(t as i64 - r.timestamp_us as i64),
            None => missing += 1,
        }
    }

    let count = latencies.len();
    if count == 0 {
        return LatencyReport {
            count,
            missing,
            mean_us: 0.0,
            std_dev_us: 0.0,
            min_us: 0,
            max_us: 0,
            drift_us_per_period: 0.0,
        };
    }

    let n = count as f64;
    let mean = latencies.iter().map(|&l| l as f64).sum::<f64>() / n;
    let std_dev = if count > 1 {
        let square_sum: f64 = latencies.iter().map(|&l| (l as f64 - mean).powi(2)).sum();
        (square_sum / (n - 1.0)).sqrt()
    } else {
        0.0
    };

    let x_mean = (n - 1.0) / 2.0;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (i, &l) in latencies.iter().enumerate() {
        let dx = i as f64 - x_mean;
        sxy += dx * (l as f64 - mean);
        sxx += dx * dx;
    }
    let drift = if sxx > 0.0 { sxy / sxx } else { 0.0 };

    LatencyReport {
        count,
        missing,
        mean_us: mean,
        std_dev_us: std_dev,
        min_us: latencies.iter().copied().min().unwrap_or(0),
        max_us: latencies.iter().copied().max().unwrap_or(0),
        drift_us_per_period: drift,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(pairs: &[(u64, u64)]) -> Vec<TimingRecord> {
        pairs
            .iter()
            .map(|&(sequence_id, timestamp_us)| TimingRecord {
                sequence_id,
                timestamp_us,
            })
            .collect()
    }

    #[test]
    fn log_lines_are_id_space_timestamp() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log-playback");
        let mut log = TimingLog::create(&path)?;
        log.append(1, 1_000)?;
        log.append(2, 2_500)?;
        log.close()?;
        assert_eq!(log.records(), 2);
        assert!(log.append(3, 3_000).is_err());

        assert_eq!(std::fs::read_to_string(&path)?, "1 1000\n2 2500\n");
        assert_eq!(read_log(&path)?, records(&[(1, 1_000), (2, 2_500)]));
        Ok(())
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!("12".parse::<TimingRecord>().is_err());
        assert!("a 12".parse::<TimingRecord>().is_err());
        assert_eq!(
            "7 99".parse::<TimingRecord>().ok(),
            Some(TimingRecord {
                sequence_id: 7,
                timestamp_us: 99
            })
        );
    }

    #[test]
    fn constant_latency_has_no_spread_or_drift() {
        let up = records(&[(1, 100), (2, 200), (3, 300)]);
        let down = records(&[(1, 150), (2, 250), (3, 350)]);
        let report = analyze(&up, &down);
        assert_eq!(report.count, 3);
        assert_eq!(report.missing, 0);
        assert_eq!(report.mean_us, 50.0);
        assert_eq!(report.std_dev_us, 0.0);
        assert_eq!(report.drift_us_per_period, 0.0);
    }

    #[test]
    fn growing_latency_shows_as_drift() {
        let up = records(&[(1, 0), (2, 100), (3, 200), (4, 300)]);
        let down = records(&[(4, 340), (1, 10), (2, 120), (3, 230)]);
        let report = analyze(&up, &down);
        assert_eq!(report.min_us, 10);
        assert_eq!(report.max_us, 40);
        assert_eq!(report.mean_us, 25.0);
        assert!((report.drift_us_per_period - 10.0).abs() < 1e-9);
        // sample standard deviation of 10, 20, 30, 40
        assert!((report.std_dev_us - 12.909_944).abs() < 1e-5);
    }

    #[test]
    fn dropped_periods_are_counted() {
        let up = records(&[(1, 0), (2, 100), (3, 200)]);
        let down = records(&[(1, 10), (3, 215)]);
        let report = analyze(&up, &down);
        assert_eq!(report.count, 2);
        assert_eq!(report.missing, 1);

        let empty = analyze(&up, &[]);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.missing, 3);
    }
}
