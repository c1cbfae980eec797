// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Records, payload encoding, and corpus ingestion.
//!
//! The indexed attribute is a salary, carried as fixed-point cents offset
//! into the unsigned range so that negative amounts order correctly. A
//! record's stored payload is its salary followed by the raw input line,
//! zero-padded to the ORAM block size; the query layer reads the salary
//! prefix to apply the true predicate after decryption.

use crate::utils::{read_u64_at, write_u64_at};
use crate::{BlockSize, Error, RecordId, SalaryKey};
use std::path::Path;

/// The zero-based CSV column holding the salary attribute.
pub const SALARY_COLUMN: usize = 7;

/// Fixed-point offset keeping negative salaries inside the unsigned key space.
const SALARY_OFFSET: i64 = i64::MAX / 4;

/// Payload overhead in front of the record text: salary plus text length.
const PAYLOAD_HEADER: usize = 8 + 2;

/// One input row: a record id, its salary key, and the raw line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The logical record id, dense from zero.
    pub id: RecordId,
    /// The fixed-point salary key.
    pub salary: SalaryKey,
    /// The raw input line stored as the record payload.
    pub line: String,
}

/// Parses a decimal salary into its fixed-point key.
pub fn salary_to_number(text: &str) -> Result<SalaryKey, Error> {
    let amount: f64 = text
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("malformed salary {text:?}")))?;
    Ok(((amount * 100.0) as i64 + SALARY_OFFSET) as SalaryKey)
}

/// The inverse of [`salary_to_number`], for logging.
pub fn number_to_salary(key: SalaryKey) -> f64 {
    (key as i64 - SALARY_OFFSET) as f64 * 0.01
}

/// Encodes a record into its block payload: `salary ‖ length ‖ text`.
pub fn encode_payload(record: &Record, block_size: BlockSize) -> Result<Vec<u8>, Error> {
    let text = record.line.as_bytes();
    if PAYLOAD_HEADER + text.len() > block_size {
        return Err(Error::SizeMismatch {
            actual: PAYLOAD_HEADER + text.len(),
            expected: block_size,
        });
    }
    let mut payload = vec![0u8; block_size];
    write_u64_at(&mut payload, 0, record.salary);
    payload[8..10].copy_from_slice(&(text.len() as u16).to_le_bytes());
    payload[PAYLOAD_HEADER..PAYLOAD_HEADER + text.len()].copy_from_slice(text);
    Ok(payload)
}

/// Decodes a block payload back into `(salary, text)`.
pub fn decode_payload(payload: &[u8]) -> Result<(SalaryKey, String), Error> {
    if payload.len() < PAYLOAD_HEADER {
        return Err(Error::Decrypt);
    }
    let salary = read_u64_at(payload, 0);
    let length = u16::from_le_bytes([payload[8], payload[9]]) as usize;
    if PAYLOAD_HEADER + length > payload.len() {
        return Err(Error::Decrypt);
    }
    let text = std::str::from_utf8(&payload[PAYLOAD_HEADER..PAYLOAD_HEADER + length])
        .map_err(|_| Error::Decrypt)?;
    Ok((salary, text.to_string()))
}

/// The smallest block size that fits every record of the corpus.
pub fn derive_block_size(records: &[Record]) -> BlockSize {
    records
        .iter()
        .map(|record| PAYLOAD_HEADER + record.line.len())
        .max()
        .unwrap_or(PAYLOAD_HEADER)
}

/// Reads the data corpus; the salary lives in [`SALARY_COLUMN`].
pub fn read_data_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Record>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(&path)
        .map_err(|e| Error::Configuration(format!("cannot read data csv: {e}")))?;

    let mut records = Vec::new();
    for (id, row) in reader.records().enumerate() {
        let row = row.map_err(|e| Error::Configuration(format!("malformed data csv: {e}")))?;
        let salary_field = row.get(SALARY_COLUMN).ok_or_else(|| {
            Error::Configuration(format!(
                "data csv row {id} has no column {SALARY_COLUMN}"
            ))
        })?;
        records.push(Record {
            id: id as RecordId,
            salary: salary_to_number(salary_field)?,
            line: row.iter().collect::<Vec<&str>>().join(","),
        });
    }
    Ok(records)
}

/// Reads the query workload: one `lo,hi` salary pair per line.
pub fn read_query_csv<P: AsRef<Path>>(path: P) -> Result<Vec<(SalaryKey, SalaryKey)>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(&path)
        .map_err(|e| Error::Configuration(format!("cannot read query csv: {e}")))?;

    let mut queries = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| Error::Configuration(format!("malformed query csv: {e}")))?;
        let (lo, hi) = match (row.get(0), row.get(1)) {
            (Some(lo), Some(hi)) => (salary_to_number(lo)?, salary_to_number(hi)?),
            _ => {
                return Err(Error::Configuration(
                    "query csv rows need two columns".into(),
                ))
            }
        };
        queries.push((lo, hi));
    }
    Ok(queries)
}

/// A synthetic corpus: record `i` is ten comma-separated copies of `i`, so
/// the salary column holds `i` itself.
pub fn synthetic_records(count: u64) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let line = vec![i.to_string(); 10].join(",");
            Record {
                id: i,
                // Every field is `i`, so the parse cannot fail.
                salary: salary_to_number(&i.to_string()).unwrap_or_default(),
                line,
            }
        })
        .collect()
}

/// The synthetic query workload matching [`synthetic_records`]: one query
/// per ten records, each spanning salaries `[8i + 3, 8i + 8]`.
pub fn synthetic_queries(record_count: u64) -> Vec<(SalaryKey, SalaryKey)> {
    (0..record_count / 10)
        .filter_map(|i| {
            let lo = salary_to_number(&(8 * i + 3).to_string()).ok()?;
            let hi = salary_to_number(&(8 * i + 8).to_string()).ok()?;
            Some((lo, hi))
        })
        .collect()
}
