//! Per-GET transfer metrics
//!
//! Adaptive GET is a measurement protocol: every completed GET yields one
//! `GetReport` describing the baseline and what each tier cost. Reports go to
//! a `MetricsSink`; the daemon can append them as JSON lines to a file.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::compress::Tier;
use crate::monitor::ResourceSample;

#[derive(Clone, Debug, Serialize)]
pub struct TierReport {
    pub tier: Tier,
    pub level: u32,
    pub compressed_bytes: u64,
    pub compression_ms: f64,
    /// Time spent waiting for the system to settle after this tier was ACKed
    pub settle_ms: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GetReport {
    pub timestamp: String,
    pub file: String,
    pub file_type: String,
    pub file_size: u64,
    pub baseline: ResourceSample,
    pub tiers: Vec<TierReport>,
}

impl GetReport {
    pub fn new(file: &str, file_size: u64, baseline: ResourceSample) -> Self {
        let file_type = Path::new(file)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            file: file.to_string(),
            file_type,
            file_size,
            baseline,
            tiers: Vec::with_capacity(Tier::ALL.len()),
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, _report: &GetReport) {}
}

pub struct NoopSink;
impl MetricsSink for NoopSink {}

/// Appends one JSON object per line. Inside a tokio runtime the file write
/// runs on the blocking pool; lines are whole but may land out of order.
pub struct JsonlSink {
    file: Arc<Mutex<BufWriter<File>>>,
}

impl JsonlSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics log {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(f))),
        })
    }
}

fn append_line(file: &Mutex<BufWriter<File>>, line: &[u8]) -> std::io::Result<()> {
    let mut writer = file.lock();
    writer.write_all(line)?;
    writer.flush()
}

impl MetricsSink for JsonlSink {
    fn record(&self, report: &GetReport) {
        let mut line = match serde_json::to_vec(report) {
            Ok(l) => l,
            Err(e) => {
                warn!(file = %report.file, "failed to encode metrics record: {}", e);
                return;
            }
        };
        line.push(b'\n');
        let name = report.file.clone();
        let file = Arc::clone(&self.file);
        let write = move || {
            if let Err(e) = append_line(&file, &line) {
                warn!(file = %name, "failed to write metrics record: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}
