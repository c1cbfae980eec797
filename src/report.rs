// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Per-query measurements and the JSON run report.

use crate::config::Config;
use crate::{BlockSize, Error, TreeHeight};
use chrono::Local;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One query's measurement.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Measurement {
    /// Wall time around the whole dispatch, in nanoseconds.
    pub overhead: u64,
    /// The number of matching records the query returned.
    pub queries: u64,
}

/// Whole-run aggregates over the measurement log.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregates {
    /// Total elapsed nanoseconds across all queries.
    pub total_elapsed: u64,
    /// Mean nanoseconds per query.
    pub per_query: u64,
    /// Mean nanoseconds per returned record.
    pub per_result_item: u64,
}

/// Computes run aggregates; safe on an empty or matchless run.
pub fn aggregate(measurements: &[Measurement]) -> Aggregates {
    let total_elapsed: u64 = measurements.iter().map(|m| m.overhead).sum();
    let result_items: u64 = measurements.iter().map(|m| m.queries).sum();
    Aggregates {
        total_elapsed,
        per_query: total_elapsed
            .checked_div(measurements.len() as u64)
            .unwrap_or(0),
        per_result_item: total_elapsed.checked_div(result_items).unwrap_or(0),
    }
}

/// The full JSON report: configuration echo, derived geometry, per-query
/// measurements, and aggregates.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    /// The configuration the run executed under.
    #[serde(flatten)]
    pub config: &'a Config,
    /// The corpus size.
    #[serde(rename = "COUNT")]
    pub count: u64,
    /// The derived ORAM block size.
    #[serde(rename = "ORAM_BLOCK_SIZE")]
    pub oram_block_size: BlockSize,
    /// The per-shard ORAM tree height.
    #[serde(rename = "ORAM_LOG_CAPACITY")]
    pub oram_log_capacity: TreeHeight,
    /// Epoch milliseconds at report time.
    #[serde(rename = "TIMESTAMP")]
    pub timestamp: i64,
    /// Whole-run aggregates.
    pub aggregates: Aggregates,
    /// One entry per query, in issue order.
    pub queries: Vec<Measurement>,
}

/// Writes the report as `<dir>/YYYY-MM-DD-HH-MM-SS-<millis>.json` and
/// returns the path.
pub fn write_report<P: AsRef<Path>>(dir: P, report: &RunReport<'_>) -> Result<PathBuf, Error> {
    fs::create_dir_all(&dir)?;

    let now = Local::now();
    let path = dir.as_ref().join(format!(
        "{}-{}.json",
        now.format("%Y-%m-%d-%H-%M-%S"),
        now.timestamp_millis()
    ));

    let body = serde_json::to_string_pretty(report)
        .map_err(|e| Error::Configuration(format!("cannot serialize run report: {e}")))?;
    fs::write(&path, body)?;
    Ok(path)
}
