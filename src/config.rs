// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Run configuration, passed explicitly through every constructor.

use crate::storage::{BlockStorage, FileStorage, InMemoryStorage};
use crate::{Address, BlockSize, Error};
use clap::ValueEnum;
use log::warn;
use serde::Serialize;
use std::path::PathBuf;

/// The storage backend holding server-side blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "PascalCase")]
pub enum Backend {
    /// Blocks held in client memory; nothing survives the process.
    InMemory,
    /// One flat file per shard.
    FileSystem,
    /// A Redis server (config surface only; not available in this build).
    Redis,
    /// An Aerospike server (config surface only; not available in this build).
    Aerospike,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::InMemory => "in-memory",
            Backend::FileSystem => "file-system",
            Backend::Redis => "redis",
            Backend::Aerospike => "aerospike",
        };
        write!(f, "{name}")
    }
}

/// Logging verbosity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ValueEnum)]
pub enum Verbosity {
    /// Per-record noise.
    Trace,
    /// Per-access and per-query detail.
    Debug,
    /// Geometry and run summaries.
    Info,
    /// Problems only.
    Warning,
}

impl std::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Verbosity::Trace => "trace",
            Verbosity::Debug => "debug",
            Verbosity::Info => "info",
            Verbosity::Warning => "warning",
        };
        write!(f, "{name}")
    }
}

impl Verbosity {
    /// The `log` filter equivalent of this verbosity.
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Trace => log::LevelFilter::Trace,
            Verbosity::Debug => log::LevelFilter::Debug,
            Verbosity::Info => log::LevelFilter::Info,
            Verbosity::Warning => log::LevelFilter::Warn,
        }
    }
}

/// Every knob of a run. Validation may rewrite inconsistent combinations
/// (with a warning) or reject them outright.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    /// Build fresh indices, as opposed to resuming from persisted state.
    pub generate_indices: bool,
    /// Ingest CSV inputs, as opposed to synthesizing a corpus.
    pub read_inputs: bool,
    /// Query shards from parallel workers.
    pub parallel: bool,
    /// The storage backend for ORAM buckets and the strawman.
    pub oram_storage: Backend,
    /// The shard count Γ.
    pub orams_number: usize,
    /// Use the ORAM engine; otherwise run the strawman baseline.
    pub use_orams: bool,
    /// Logging verbosity.
    pub verbosity: Verbosity,
    /// Redis endpoint (per-shard suffixes are appended).
    pub redis_host: String,
    /// Aerospike endpoint.
    pub aerospike_host: String,
    /// The number of equal-width buckets the query domain is split into.
    pub buckets: u64,
    /// The DP privacy parameter ε.
    pub epsilon: f64,
    /// The DP failure probability δ = β.
    pub beta: f64,
    /// The fanout of the range-cover pyramid over buckets.
    pub fanout: u64,
    /// Blocks per ORAM bucket (the parameter Z).
    pub oram_z: usize,
    /// The block size of the B+-tree index.
    pub tree_block_size: BlockSize,
    /// Directory holding keys, client state, and file-backed storage.
    pub files_dir: PathBuf,
    /// Directory receiving run reports.
    pub results_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            generate_indices: true,
            read_inputs: false,
            parallel: true,
            oram_storage: Backend::FileSystem,
            orams_number: 1,
            use_orams: true,
            verbosity: Verbosity::Info,
            redis_host: "tcp://127.0.0.1:6379".into(),
            aerospike_host: "127.0.0.1".into(),
            buckets: 16,
            epsilon: 0.693,
            beta: (2.0f64).powi(-20),
            fanout: 16,
            oram_z: 3,
            tree_block_size: 64,
            files_dir: "./storage-files".into(),
            results_dir: "./results".into(),
        }
    }
}

impl Config {
    /// Checks option ranges and resolves inconsistent combinations.
    pub fn validate(&mut self) -> Result<(), Error> {
        if self.orams_number < 1 || self.orams_number > 96 {
            return Err(Error::Configuration(format!(
                "oramsNumber {} outside [1, 96]",
                self.orams_number
            )));
        }
        if self.buckets == 0 {
            return Err(Error::Configuration("buckets must be positive".into()));
        }
        if self.fanout < 2 {
            return Err(Error::Configuration("fanout must be at least 2".into()));
        }
        if self.oram_z == 0 {
            return Err(Error::Configuration("Z must be positive".into()));
        }
        if !(self.epsilon > 0.0) {
            return Err(Error::Configuration("epsilon must be positive".into()));
        }
        if !(self.beta > 0.0 && self.beta < 1.0) {
            return Err(Error::Configuration("beta must lie in (0, 1)".into()));
        }
        if !self.generate_indices && self.oram_storage != Backend::FileSystem {
            return Err(Error::Configuration(
                "resuming persisted indices requires the file-system backend".into(),
            ));
        }

        // The strawman shares one storage file across workers; the ORAM path
        // keeps one file per shard and stays parallel-safe.
        if self.oram_storage == Backend::FileSystem && !self.use_orams && self.parallel {
            warn!("file-system strawman storage cannot be queried in parallel; forcing sequential");
            self.parallel = false;
        }
        Ok(())
    }

    fn shard_file(&self, name: &str, shard: Option<usize>) -> PathBuf {
        let suffix = shard.map(|i| format!("-{i}")).unwrap_or_default();
        self.files_dir.join(format!("{name}{suffix}.bin"))
    }

    /// The key file of a shard (or of the strawman store, when `None`).
    pub fn key_file(&self, shard: Option<usize>) -> PathBuf {
        self.shard_file("key", shard)
    }

    /// The bucket array file of a shard.
    pub fn storage_file(&self, shard: Option<usize>) -> PathBuf {
        self.shard_file("oram-storage", shard)
    }

    /// The position map file of a shard.
    pub fn map_file(&self, shard: usize) -> PathBuf {
        self.shard_file("oram-map", Some(shard))
    }

    /// The stash file of a shard.
    pub fn stash_file(&self, shard: usize) -> PathBuf {
        self.shard_file("oram-stash", Some(shard))
    }

    /// The B+-tree file (shared across shards).
    pub fn tree_file(&self) -> PathBuf {
        self.shard_file("tree", None)
    }

    /// Opens the configured backend over one block array, file-backed at
    /// `path` when the backend persists.
    pub fn open_storage(
        &self,
        block_size: BlockSize,
        initial_blocks: Address,
        path: PathBuf,
        create: bool,
    ) -> Result<Box<dyn BlockStorage + Send>, Error> {
        match self.oram_storage {
            Backend::InMemory => {
                if !create {
                    return Err(Error::Configuration(
                        "in-memory storage has no persisted state to reopen".into(),
                    ));
                }
                Ok(Box::new(InMemoryStorage::new(block_size, initial_blocks)))
            }
            Backend::FileSystem => {
                let storage = if create {
                    FileStorage::create(path, block_size, initial_blocks)?
                } else {
                    FileStorage::open(path, block_size)?
                };
                Ok(Box::new(storage))
            }
            Backend::Redis => Err(Error::Backend(format!(
                "redis backend ({}) is not available in this build",
                self.redis_host
            ))),
            Backend::Aerospike => Err(Error::Backend(format!(
                "aerospike backend ({}) is not available in this build",
                self.aerospike_host
            ))),
        }
    }
}
