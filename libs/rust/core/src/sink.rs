//! Per-round records and where they go.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub run_id: String,
    pub round: u64,
    pub metrics: BTreeMap<String, f64>,
    pub clients_selected: Vec<usize>,
    pub clients_participated: usize,
    pub failed_clients: Vec<usize>,
    pub samples_used: u64,
    pub mean_client_loss: Option<f64>,
    pub mean_mask_sparsity: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

pub trait RoundSink: Send + Sync {
    fn record(&self, record: &RoundRecord) -> Result<()>;
}

/// Round summaries as `info` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl RoundSink for TracingSink {
    fn record(&self, r: &RoundRecord) -> Result<()> {
        info!(
            run_id = %r.run_id,
            round = r.round,
            participated = r.clients_participated,
            failed = r.failed_clients.len(),
            samples = r.samples_used,
            loss = ?r.mean_client_loss,
            sparsity = ?r.mean_mask_sparsity,
            metrics = ?r.metrics,
            "round complete"
        );
        Ok(())
    }
}

/// Appends one JSON object per round.
pub struct JsonLinesSink {
    out: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { out: Mutex::new(BufWriter::new(file)) })
    }
}

impl RoundSink for JsonLinesSink {
    fn record(&self, record: &RoundRecord) -> Result<()> {
        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<RoundRecord>>,
}

impl MemorySink {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<RoundRecord> { self.records.lock().clone() }
}

impl RoundSink for MemorySink {
    fn record(&self, record: &RoundRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
