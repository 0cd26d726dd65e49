//! Request dataset ingestion for ServeSim.
//!
//! Supports two input formats:
//! - **JSONL**: one object per line with `input_toks`, `output_toks` and
//!   optional `arrival_time_ns` / `model`.
//! - **TSV**: a header row naming `input_toks`, `output_toks` and optionally
//!   `arrival_time_ns`, followed by tab-separated rows.
//!
//! `output_toks` counts generated tokens. The admitted output length is
//! `input_toks + output_toks`. Records without an arrival time get Poisson
//! arrivals when a rate is configured, and arrive at time zero otherwise.

use crate::clock::NANOS_PER_SEC;
use crate::request::CompletedRequest;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
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
    #[error("Invalid TSV at line {line}: {reason}")]
    TsvParse { line: usize, reason: String },
    #[error("Unsupported trace format: {0}")]
    UnsupportedFormat(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// One dataset record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Prompt tokens.
    pub input_toks: u32,
    /// Tokens to generate.
    pub output_toks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_time_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A request ready for admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRequest {
    pub model: String,
    pub input_len: u32,
    /// Total sequence length at completion.
    pub output_len: u32,
    pub arrival_ns: u64,
}

/// How dataset records become requests.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    /// Model for records that do not name one.
    pub model: String,
    /// Keep at most this many records.
    pub req_num: Option<usize>,
    /// Poisson arrival rate in requests per second.
    pub rate: Option<f64>,
    pub seed: u64,
}

/// Load a dataset file in the given format.
pub fn load_trace(path: &Path, format: &str) -> Result<Vec<TraceRecord>, TraceError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    match format {
        "jsonl" | "json" => parse_jsonl(reader),
        "tsv" => parse_tsv(reader),
        other => Err(TraceError::UnsupportedFormat(other.to_string())),
    }
}

/// Parse JSONL records from any reader.
pub fn parse_jsonl<R: Read>(reader: BufReader<R>) -> Result<Vec<TraceRecord>, TraceError> {
    let mut records = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: TraceRecord =
            serde_json::from_str(trimmed).map_err(|e| TraceError::JsonParse {
                line: line_num + 1,
                source: e,
            })?;
        records.push(record);
    }
    Ok(records)
}

/// Parse TSV records from any reader. The first non-comment line is the header.
pub fn parse_tsv<R: Read>(reader: BufReader<R>) -> Result<Vec<TraceRecord>, TraceError> {
    let mut columns: Option<(usize, usize, Option<usize>)> = None;
    let mut records = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').map(str::trim).collect();

        let Some((input_col, output_col, arrival_col)) = columns else {
            let find = |name: &str| fields.iter().position(|f| *f == name);
            let input_col =
                find("input_toks").ok_or_else(|| TraceError::MissingField("input_toks".into()))?;
            let output_col = find("output_toks")
                .ok_or_else(|| TraceError::MissingField("output_toks".into()))?;
            columns = Some((input_col, output_col, find("arrival_time_ns")));
            continue;
        };

        let field = |col: usize| -> Result<u64, TraceError> {
            let raw = fields.get(col).ok_or_else(|| TraceError::TsvParse {
                line: line_num + 1,
                reason: format!("missing column {}", col + 1),
            })?;
            raw.parse::<u64>().map_err(|e| TraceError::TsvParse {
                line: line_num + 1,
                reason: format!("'{raw}': {e}"),
            })
        };
        let narrow = |value: u64| {
            u32::try_from(value).map_err(|_| TraceError::TsvParse {
                line: line_num + 1,
                reason: format!("token count {value} out of range"),
            })
        };

        records.push(TraceRecord {
            input_toks: narrow(field(input_col)?)?,
            output_toks: narrow(field(output_col)?)?,
            arrival_time_ns: arrival_col.map(field).transpose()?,
            model: None,
        });
    }
    Ok(records)
}

/// Turn dataset records into admission-ready requests sorted by arrival.
pub fn build_requests(records: Vec<TraceRecord>, options: &DatasetOptions) -> Vec<TraceRequest> {
    let mut rng = ChaCha8Rng::seed_from_u64(options.seed);
    let mut poisson_clock_ns = 0u64;
    let limit = options.req_num.unwrap_or(usize::MAX);

    let mut requests: Vec<TraceRequest> = records
        .into_iter()
        .take(limit)
        .map(|record| {
            let arrival_ns = match (record.arrival_time_ns, options.rate) {
                (Some(ns), _) => ns,
                (None, Some(rate)) => {
                    poisson_clock_ns += exponential_gap_ns(&mut rng, rate);
                    poisson_clock_ns
                }
                (None, None) => 0,
            };
            TraceRequest {
                model: record.model.unwrap_or_else(|| options.model.clone()),
                input_len: record.input_toks,
                output_len: record.input_toks.saturating_add(record.output_toks),
                arrival_ns,
            }
        })
        .collect();

    requests.sort_by_key(|r| r.arrival_ns);
    requests
}

/// Inter-arrival gap drawn from an exponential distribution at `rate` req/s.
fn exponential_gap_ns(rng: &mut ChaCha8Rng, rate: f64) -> u64 {
    let u: f64 = rng.gen::<f64>();
    let gap_sec = -(1.0 - u).ln() / rate;
    (gap_sec * NANOS_PER_SEC as f64).round() as u64
}

/// Fixed smoke-test batch used when no dataset is configured.
pub fn default_requests(model: &str) -> Vec<TraceRequest> {
    (0..16)
        .map(|_| TraceRequest {
            model: model.to_string(),
            input_len: 128,
            output_len: 129,
            arrival_ns: 0,
        })
        .collect()
}

/// Parameters for a synthetic dataset.
#[derive(Debug, Clone)]
pub struct SyntheticSpec {
    pub count: usize,
    /// Poisson arrival rate; `None` leaves arrivals unset.
    pub rate: Option<f64>,
    pub input_mean: f64,
    pub input_std: f64,
    pub output_mean: f64,
    pub output_std: f64,
    pub seed: u64,
}

/// Generate synthetic records with uniform jitter around the means.
pub fn generate_synthetic(spec: &SyntheticSpec) -> Vec<TraceRecord> {
    let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);
    let mut clock_ns = 0u64;
    (0..spec.count)
        .map(|_| {
            let input_toks = (spec.input_mean + rng.gen::<f64>() * spec.input_std * 2.0
                - spec.input_std)
                .max(1.0) as u32;
            let output_toks = (spec.output_mean + rng.gen::<f64>() * spec.output_std * 2.0
                - spec.output_std)
                .max(1.0) as u32;
            let arrival_time_ns = spec.rate.map(|rate| {
                clock_ns += exponential_gap_ns(&mut rng, rate);
                clock_ns
            });
            TraceRecord {
                input_toks,
                output_toks,
                arrival_time_ns,
                model: None,
            }
        })
        .collect()
}

/// Write records as JSONL.
pub fn write_jsonl(records: &[TraceRecord], path: &Path) -> Result<(), TraceError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| TraceError::JsonParse { line: 0, source: e })?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the completed-request log as JSONL.
pub fn write_request_log(done: &[CompletedRequest], path: &Path) -> Result<(), TraceError> {
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    for request in done {
        serde_json::to_writer(&mut writer, request)
            .map_err(|e| TraceError::JsonParse { line: 0, source: e })?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}
