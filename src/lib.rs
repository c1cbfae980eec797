// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Differentially private range queries over sharded Path ORAM.
//!
//! A client holds small cryptographic state (per-shard encryption keys,
//! position maps, and stashes); the server holds encrypted buckets. Range
//! queries on a numeric attribute are answered through a B+-tree index and a
//! set of parallel Path ORAM shards, with per-shard Laplace padding bounding
//! what the query distribution leaks about the access pattern.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

pub mod btree;
pub mod config;
pub mod crypto;
pub mod data;
pub mod dp;
pub mod path_oram;
pub mod position_map;
pub mod query;
pub mod report;
pub mod stash;
pub mod storage;
pub mod test_utils;
pub(crate) mod utils;

use std::num::TryFromIntError;
use thiserror::Error;

/// The numeric type used to address fixed-size blocks in server storage.
pub type Address = u64;
/// The numeric type used for logical record identifiers.
pub type RecordId = u64;
/// The numeric type of the indexed query attribute (fixed-point salary).
pub type SalaryKey = u64;
/// A 1-based heap index into the complete binary tree of ORAM buckets.
pub type TreeIndex = u64;
/// The numeric type used to specify the height of an ORAM tree.
pub type TreeHeight = u32;
/// The numeric type used to specify the size of a block in bytes.
pub type BlockSize = usize;
/// The numeric type used to specify the number of blocks per ORAM bucket.
pub type BucketSize = usize;

pub use config::{Backend, Config};
pub use path_oram::PathOram;
pub use query::{QueryEngine, QueryResult};

/// The error type returned by all fallible operations in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration option was malformed or the options are inconsistent.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A storage address outside the allocated capacity was accessed.
    #[error("address {address} out of range (capacity {capacity})")]
    OutOfRange {
        /// The offending address.
        address: Address,
        /// The capacity of the storage in blocks.
        capacity: Address,
    },
    /// A write was attempted whose size does not match the storage block size.
    #[error("write of {actual} bytes does not match block size {expected}")]
    SizeMismatch {
        /// The length of the rejected write.
        actual: usize,
        /// The block size of the storage.
        expected: usize,
    },
    /// A block failed to decrypt or decode (wrong key, or corrupted bytes).
    #[error("block failed to decrypt (wrong key or corrupted ciphertext)")]
    Decrypt,
    /// The ORAM stash exceeded its capacity; the tree parameters are too tight.
    #[error("stash overflow: {occupancy} blocks exceed capacity {capacity}")]
    StashOverflow {
        /// The number of blocks the stash was asked to hold.
        occupancy: usize,
        /// The configured stash capacity.
        capacity: usize,
    },
    /// A storage backend could not be reached or is not available.
    #[error("storage backend unavailable: {0}")]
    Backend(String),
    /// An I/O error from a file-backed component.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// An internal integer conversion failed.
    #[error(transparent)]
    IntegerConversion(#[from] TryFromIntError),
}
