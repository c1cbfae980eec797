// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common utilities for tests and benchmarks.

use crate::config::{Backend, Config, Verbosity};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::path::Path;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes the process-wide logger once; later calls are no-ops.
pub fn init_logger() {
    INIT.call_once(|| {
        let _ = TermLogger::init(
            log::LevelFilter::Warn,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        );
    });
}

/// A small in-memory configuration rooted in a scratch directory.
pub fn test_config(files_dir: &Path, shards: usize) -> Config {
    Config {
        oram_storage: Backend::InMemory,
        orams_number: shards,
        verbosity: Verbosity::Warning,
        files_dir: files_dir.to_path_buf(),
        results_dir: files_dir.join("results"),
        ..Config::default()
    }
}
