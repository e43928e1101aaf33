//! Scalar telemetry sinks.
//!
//! The adaptation loop reports `(name, value, step)` triples and never reads
//! anything back. Each sweep value is a separate run; [`JsonlSink`] writes one
//! `metrics.jsonl` per run under `{log_dir}/{dataset}/{domain}/{run_name}/`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::AdaptConfig;
use crate::error::Result;

/// Identity of one adaptation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunId {
    /// Dataset name.
    pub dataset: String,
    /// Domain being adapted to.
    pub domain: usize,
    /// Run name, see [`AdaptConfig::run_name`].
    pub name: String,
}

impl RunId {
    /// Run for one sweep value of `domain`.
    #[must_use]
    pub fn new(config: &AdaptConfig, domain: usize, confidence_q: f64) -> Self {
        Self {
            dataset: config.dataset.clone(),
            domain,
            name: config.run_name(confidence_q),
        }
    }

    /// Directory of the run below `log_dir`.
    #[must_use]
    pub fn dir(&self, log_dir: &Path) -> PathBuf {
        log_dir
            .join(&self.dataset)
            .join(self.domain.to_string())
            .join(&self.name)
    }
}

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    /// Scalar name, e.g. `Loss/train`.
    pub name: String,
    /// Value.
    pub value: f64,
    /// Step (epoch).
    pub step: usize,
}

/// Receiver of training telemetry.
pub trait MetricsSink {
    /// Start a new run; later scalars belong to it.
    fn begin_run(&mut self, _run: &RunId) {}

    /// Record a scalar.
    fn add_scalar(&mut self, name: &str, value: f64, step: usize);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn add_scalar(&mut self, _name: &str, _value: f64, _step: usize) {}
}

/// Keeps records in memory, grouped by run.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    runs: Vec<(RunId, Vec<ScalarRecord>)>,
    orphans: Vec<ScalarRecord>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs in the order they began, with their records.
    #[must_use]
    pub fn runs(&self) -> &[(RunId, Vec<ScalarRecord>)] {
        &self.runs
    }

    /// Values of `name` across all runs, in logging order.
    #[must_use]
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.orphans
            .iter()
            .chain(self.runs.iter().flat_map(|(_, records)| records))
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn begin_run(&mut self, run: &RunId) {
        self.runs.push((run.clone(), Vec::new()));
    }

    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        let record = ScalarRecord {
            name: name.to_string(),
            value,
            step,
        };
        match self.runs.last_mut() {
            Some((_, records)) => records.push(record),
            None => self.orphans.push(record),
        }
    }
}

/// Appends JSON lines to `metrics.jsonl` in the directory of the current run.
///
/// I/O failures are logged and otherwise ignored.
#[derive(Debug)]
pub struct JsonlSink {
    log_dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    /// File name used inside every run directory.
    pub const FILE_NAME: &'static str = "metrics.jsonl";

    /// Create a sink rooted at `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            writer: None,
        }
    }

    fn write_record(writer: &mut BufWriter<File>, record: &ScalarRecord) -> Result<()> {
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn open(&self, run: &RunId) -> std::io::Result<BufWriter<File>> {
        let dir = run.dir(&self.log_dir);
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::FILE_NAME))?;
        Ok(BufWriter::new(file))
    }
}

impl MetricsSink for JsonlSink {
    fn begin_run(&mut self, run: &RunId) {
        if let Some(mut previous) = self.writer.take() {
            if let Err(e) = previous.flush() {
                tracing::warn!("failed to flush metrics: {e}");
            }
        }
        match self.open(run) {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => tracing::warn!("cannot open metrics for run {}: {e}", run.name),
        }
    }

    fn add_scalar(&mut self, name: &str, value: f64, step: usize) {
        let Some(writer) = self.writer.as_mut() else {
            tracing::debug!("dropping scalar {name} logged outside a run");
            return;
        };
        let record = ScalarRecord {
            name: name.to_string(),
            value,
            step,
        };
        if let Err(e) = Self::write_record(writer, &record) {
            tracing::warn!("failed to write metric {name}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn run(domain: usize, q: f64) -> RunId {
        RunId::new(&AdaptConfig::default(), domain, q)
    }

    #[test]
    fn test_run_dir_layout() {
        let id = run(3, 0.5);
        let dir = id.dir(Path::new("/logs"));
        assert_eq!(
            dir,
            Path::new("/logs/rotating-gaussians/3").join(AdaptConfig::default().run_name(0.5))
        );
    }

    #[test]
    fn test_memory_sink_groups_by_run() {
        let mut sink = MemorySink::new();
        sink.begin_run(&run(1, 0.1));
        sink.add_scalar("Loss/train", 1.0, 1);
        sink.begin_run(&run(1, 0.2));
        sink.add_scalar("Loss/train", 2.0, 1);
        sink.add_scalar("Score/train", 0.3, 1);

        assert_eq!(sink.runs().len(), 2);
        assert_eq!(sink.runs()[1].1.len(), 2);
        assert_eq!(sink.values("Loss/train"), vec![1.0, 2.0]);
    }

    #[test]
    fn test_jsonl_sink_writes_records() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        let id = run(2, 0.1);
        sink.begin_run(&id);
        sink.add_scalar("Loss/train", 0.25, 1);
        sink.add_scalar("Loss/train", 0.125, 2);

        let content = std::fs::read_to_string(id.dir(dir.path()).join(JsonlSink::FILE_NAME)).unwrap();
        let records: Vec<ScalarRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value, 0.125);
        assert_eq!(records[1].step, 2);
    }

    #[test]
    fn test_jsonl_sink_ignores_scalars_outside_run() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        sink.add_scalar("Loss/train", 1.0, 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
