//! Trace ingestion for PDSim.
//!
//! Supports two input formats:
//! - **Compact JSONL**: one `{"ts": <ns>, "seq_len": <tokens>}` object per
//!   line.
//! - **Requests JSON**: a single block `{"count": N, "seq_len": L,
//!   "arrival": [t0, t1, ...]}` describing `N` identical requests. When fewer
//!   arrival times than requests are listed, the last one is repeated.

use crate::request::TraceRequest;
use pdsim_grid::SimTime;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to read trace file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON at line {line}: {source}")]
    JsonParse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Unsupported trace format: {0}")]
    UnsupportedFormat(String),
    #[error("Request at line {0} has zero sequence length")]
    EmptySequence(usize),
    #[error("Requests block lists {0} requests but no arrival times")]
    MissingArrivals(usize),
}

/// A compact JSONL trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactTraceRecord {
    /// Arrival timestamp in nanoseconds.
    pub ts: SimTime,
    /// Prompt length in tokens.
    pub seq_len: u32,
}

/// A block of identical requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsBlock {
    pub count: usize,
    pub seq_len: u32,
    #[serde(default)]
    pub arrival: Vec<SimTime>,
}

impl RequestsBlock {
    pub fn expand(&self) -> Result<Vec<TraceRequest>, TraceError> {
        if self.count == 0 {
            return Ok(Vec::new());
        }
        if self.seq_len == 0 {
            return Err(TraceError::EmptySequence(1));
        }
        let last = *self
            .arrival
            .last()
            .ok_or(TraceError::MissingArrivals(self.count))?;
        let mut requests: Vec<TraceRequest> = (0..self.count)
            .map(|i| TraceRequest::new(self.arrival.get(i).copied().unwrap_or(last), self.seq_len))
            .collect();
        requests.sort_by_key(|r| r.arrival_ns);
        Ok(requests)
    }
}

/// Load a trace from a file in the given format.
pub fn load_trace(path: &Path, format: &str) -> Result<Vec<TraceRequest>, TraceError> {
    match format {
        "compact_jsonl" | "jsonl" => load_compact_jsonl(path),
        "requests_json" => load_requests_json(path),
        other => Err(TraceError::UnsupportedFormat(other.to_string())),
    }
}

/// Load a compact JSONL trace file.
pub fn load_compact_jsonl(path: &Path) -> Result<Vec<TraceRequest>, TraceError> {
    let file = std::fs::File::open(path)?;
    parse_compact_jsonl(BufReader::new(file))
}

/// Parse compact JSONL from any reader. Blank lines and `#` comments are
/// skipped; the result is sorted by arrival.
pub fn parse_compact_jsonl<R: Read>(reader: BufReader<R>) -> Result<Vec<TraceRequest>, TraceError> {
    let mut requests = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: CompactTraceRecord =
            serde_json::from_str(trimmed).map_err(|e| TraceError::JsonParse {
                line: line_num + 1,
                source: e,
            })?;
        if record.seq_len == 0 {
            return Err(TraceError::EmptySequence(line_num + 1));
        }
        requests.push(TraceRequest::new(record.ts, record.seq_len));
    }

    // Stable: equal timestamps keep file order.
    requests.sort_by_key(|r| r.arrival_ns);
    Ok(requests)
}

pub fn load_requests_json(path: &Path) -> Result<Vec<TraceRequest>, TraceError> {
    let content = std::fs::read_to_string(path)?;
    parse_requests_json(&content)
}

pub fn parse_requests_json(content: &str) -> Result<Vec<TraceRequest>, TraceError> {
    let block: RequestsBlock =
        serde_json::from_str(content).map_err(|e| TraceError::JsonParse { line: 0, source: e })?;
    block.expand()
}

/// Write requests to compact JSONL format.
pub fn write_compact_jsonl<W: Write>(requests: &[TraceRequest], writer: W) -> Result<(), TraceError> {
    let mut writer = std::io::BufWriter::new(writer);
    for req in requests {
        let record = CompactTraceRecord {
            ts: req.arrival_ns,
            seq_len: req.sequence_length,
        };
        serde_json::to_writer(&mut writer, &record)
            .map_err(|e| TraceError::JsonParse { line: 0, source: e })?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_compact_jsonl_file(requests: &[TraceRequest], path: &Path) -> Result<(), TraceError> {
    let file = std::fs::File::create(path)?;
    write_compact_jsonl(requests, file)
}

/// Parameters of a synthetic trace.
#[derive(Debug, Clone)]
pub struct SyntheticTrace {
    pub count: usize,
    /// Requests per simulated second.
    pub rate: f64,
    pub seq_len_mean: f64,
    pub seq_len_std: f64,
    pub seed: u64,
}

impl Default for SyntheticTrace {
    fn default() -> Self {
        Self {
            count: 100,
            rate: 10_000.0,
            seq_len_mean: 64.0,
            seq_len_std: 32.0,
            seed: 42,
        }
    }
}

impl SyntheticTrace {
    /// Evenly spaced arrivals with uniformly jittered sequence lengths.
    pub fn generate(&self) -> Vec<TraceRequest> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let rate = if self.rate > 0.0 { self.rate } else { 1.0 };
        (0..self.count)
            .map(|i| {
                let arrival_ns = (i as f64 / rate * 1e9) as SimTime;
                let seq_len = (self.seq_len_mean + rng.gen::<f64>() * self.seq_len_std * 2.0
                    - self.seq_len_std)
                    .max(1.0) as u32;
                TraceRequest::new(arrival_ns, seq_len)
            })
            .collect()
    }
}
