// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The range query processor: builds (or reopens) the indices, runs the
//! query workload, and writes a JSON run report.

use chrono::Local;
use clap::Parser;
use log::{error, info};
use range_oram::config::{Backend, Config, Verbosity};
use range_oram::data;
use range_oram::report::{self, Measurement, RunReport};
use range_oram::{Error, QueryEngine};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "range-oram", about = "range query processor")]
struct Args {
    /// Generate ORAM and tree indices; otherwise resume from files.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    generate_indices: bool,

    /// Read the data and query CSV inputs; otherwise synthesize a corpus.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    read_inputs: bool,

    /// Query the shards in parallel.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    parallel: bool,

    /// The ORAM storage backend to use.
    #[arg(long, value_enum, default_value_t = Backend::FileSystem)]
    oram_storage: Backend,

    /// The number of parallel ORAM shards to use.
    #[arg(long, default_value_t = 1)]
    orams_number: usize,

    /// Use ORAMs; otherwise every query downloads everything (the strawman).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    use_orams: bool,

    /// Verbosity level to output.
    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    verbosity: Verbosity,

    /// Redis host to use.
    #[arg(long, default_value = "tcp://127.0.0.1:6379")]
    redis_host: String,

    /// Aerospike host to use.
    #[arg(long, default_value = "127.0.0.1")]
    aerospike_host: String,

    /// The number of domain buckets for query padding.
    #[arg(long, default_value_t = 16)]
    buckets: u64,

    /// The DP privacy parameter epsilon.
    #[arg(long, default_value_t = 0.693)]
    epsilon: f64,

    /// The DP failure probability, as the exponent in beta = 2^-exp.
    #[arg(long, default_value_t = 20)]
    beta_exp: i32,

    /// The fanout of the range-cover pyramid.
    #[arg(long, default_value_t = 16)]
    fanout: u64,

    /// The size of the synthetic corpus when inputs are not read.
    #[arg(long, default_value_t = 1000)]
    count: u64,

    /// The data CSV (salary in column 7).
    #[arg(long, default_value = "./data.csv")]
    data_file: PathBuf,

    /// The query CSV (one lo,hi pair per line).
    #[arg(long, default_value = "./query.csv")]
    query_file: PathBuf,

    /// Directory holding keys, client state, and storage files.
    #[arg(long, default_value = "./storage-files")]
    files_dir: PathBuf,

    /// Directory receiving run reports.
    #[arg(long, default_value = "./results")]
    results_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _ = TermLogger::init(
        args.verbosity.level_filter(),
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(cause) => {
            error!("{cause}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Error> {
    let config = Config {
        generate_indices: args.generate_indices,
        read_inputs: args.read_inputs,
        parallel: args.parallel,
        oram_storage: args.oram_storage,
        orams_number: args.orams_number,
        use_orams: args.use_orams,
        verbosity: args.verbosity,
        redis_host: args.redis_host,
        aerospike_host: args.aerospike_host,
        buckets: args.buckets,
        epsilon: args.epsilon,
        beta: (2.0f64).powi(-args.beta_exp),
        fanout: args.fanout,
        files_dir: args.files_dir,
        results_dir: args.results_dir,
        ..Config::default()
    };

    info!("Constructing data set...");
    let (records, queries) = if config.read_inputs {
        (
            data::read_data_csv(&args.data_file)?,
            data::read_query_csv(&args.query_file)?,
        )
    } else {
        (
            data::synthetic_records(args.count),
            data::synthetic_queries(args.count),
        )
    };

    if config.generate_indices {
        // A fresh build starts from an empty state directory.
        let _ = std::fs::remove_dir_all(&config.files_dir);
    }

    info!(
        "{}",
        if config.generate_indices {
            "Generating indices..."
        } else {
            "Reading from files..."
        }
    );
    let mut engine = if config.generate_indices {
        QueryEngine::build(config, &records)?
    } else {
        QueryEngine::open(config, &records)?
    };

    info!("COUNT = {}", engine.record_count());
    info!("ORAM_BLOCK_SIZE = {}", engine.block_size());
    info!("ORAM_LOG_CAPACITY = {}", engine.height());
    info!("ORAMS_NUMBER = {}", engine.config().orams_number);
    info!("PARALLEL = {}", engine.config().parallel);
    info!("USE_ORAMS = {}", engine.config().use_orams);

    info!("Running {} queries...", queries.len());
    let mut measurements = Vec::with_capacity(queries.len());
    for (lo, hi) in &queries {
        let result = engine.query(*lo, *hi)?;
        measurements.push(Measurement {
            overhead: result.elapsed_ns,
            queries: result.count(),
        });
    }
    engine.shutdown()?;
    info!("Complete!");

    let aggregates = report::aggregate(&measurements);
    info!(
        "Total: {}, average: {} per query, {} per result item",
        format_duration(aggregates.total_elapsed),
        format_duration(aggregates.per_query),
        format_duration(aggregates.per_result_item),
    );

    let run_report = RunReport {
        config: engine.config(),
        count: engine.record_count(),
        oram_block_size: engine.block_size(),
        oram_log_capacity: engine.height(),
        timestamp: Local::now().timestamp_millis(),
        aggregates,
        queries: measurements,
    };
    let path = report::write_report(&engine.config().results_dir, &run_report)?;
    info!("Log written to {}", path.display());

    Ok(())
}

/// Renders nanoseconds in the largest unit that keeps four digits.
fn format_duration(mut time: u64) -> String {
    let units = ["ns", "μs", "ms", "s"];
    for (i, unit) in units.iter().enumerate() {
        if time < 10_000 || i == units.len() - 1 {
            return format!("{time} {unit}");
        }
        time /= 1000;
    }
    unreachable!()
}
