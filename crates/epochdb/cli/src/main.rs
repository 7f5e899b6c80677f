// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! EpochDB CLI Tool
//!
//! Drives the transactional core: concurrent stress runs, the visibility
//! scenario, and configuration inspection.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use epochdb_common::EngineConfig;
use epochdb_core::gc::{GcPassStats, GcTotals};
use epochdb_core::storage::PoolStats;
use epochdb_core::transaction::TransactionStats;
use epochdb_core::{Engine, TransactionError};
use rand::Rng;
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "epochdb")]
#[command(about = "EpochDB - MVCC transactional core CLI")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a concurrent update workload and print statistics as JSON
    Stress {
        /// Number of worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Transactions each worker runs
        #[arg(long, default_value_t = 1000)]
        txns_per_thread: usize,
        /// Number of records the workload updates
        #[arg(long, default_value_t = 64)]
        records: u64,
        /// Abort every n-th transaction instead of committing (0 never aborts)
        #[arg(long, default_value_t = 0)]
        abort_every: usize,
        /// Engine configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the visibility scenario and print what each transaction observed
    Scenario,
    /// Print the default configuration as JSON
    Config,
}

#[derive(Serialize)]
struct StressReport {
    threads: usize,
    transactions: usize,
    committed: u64,
    aborted: u64,
    conflicts: u64,
    elapsed_ms: u128,
    txns_per_sec: f64,
    transaction_stats: TransactionStats,
    gc_totals: GcTotals,
    final_drain: GcPassStats,
    pool: PoolStats,
    remaining_versions: usize,
}

#[derive(Serialize)]
struct ScenarioReport {
    initial: String,
    b_sees_before_a_commits: Option<String>,
    b_sees_after_a_commits: Option<String>,
    c_sees: Option<String>,
    d_sees_after_abort: Option<String>,
    a_start: u64,
    b_start: u64,
    a_commit: u64,
    c_start: u64,
    pool_before_abort: usize,
    pool_after_drain: usize,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Stress {
            threads,
            txns_per_thread,
            records,
            abort_every,
            config,
        } => handle_stress(threads, txns_per_thread, records, abort_every, config),
        Commands::Scenario => handle_scenario(),
        Commands::Config => handle_config(),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(&path).with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn handle_stress(threads: usize, txns_per_thread: usize, records: u64, abort_every: usize, config: Option<PathBuf>) -> anyhow::Result<()> {
    if threads == 0 || records == 0 {
        bail!("threads and records must be positive");
    }
    let engine = Arc::new(Engine::open(load_config(config)?)?);
    let table = engine.create_table("stress");

    let mut setup = engine.begin_transaction();
    let ids = (0..records).map(|i| table.insert(&mut setup, i.to_le_bytes().to_vec())).collect::<Result<Vec<_>, _>>()?;
    engine.commit(setup)?;
    info!(threads, txns_per_thread, records, "stress run starting");

    let started = Instant::now();
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let engine = engine.clone();
            let table = table.clone();
            let ids = ids.clone();
            thread::spawn(move || -> anyhow::Result<()> {
                let mut rng = rand::thread_rng();
                for n in 1..=txns_per_thread {
                    let mut txn = engine.begin_transaction();
                    let id = ids[rng.gen_range(0..ids.len())];
                    match table.update(&mut txn, id, rng.r#gen::<u64>().to_le_bytes().to_vec()) {
                        Ok(()) | Err(TransactionError::Conflict { .. }) => {}
                        Err(e) => {
                            engine.abort(txn)?;
                            return Err(e.into());
                        }
                    }
                    if (abort_every > 0 && n % abort_every == 0) || txn.must_abort() {
                        engine.abort(txn)?;
                    } else {
                        engine.commit(txn)?;
                    }
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        match worker.join() {
            Ok(result) => result?,
            Err(_) => bail!("stress worker panicked"),
        }
    }
    let elapsed = started.elapsed();

    let final_drain = engine.shutdown();
    let stats = engine.transaction_manager().stats();
    let transactions = threads * txns_per_thread;
    let report = StressReport {
        threads,
        transactions,
        committed: stats.committed,
        aborted: stats.aborted,
        conflicts: stats.conflicts,
        elapsed_ms: elapsed.as_millis(),
        txns_per_sec: transactions as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        transaction_stats: stats,
        gc_totals: engine.garbage_collector().totals(),
        final_drain,
        pool: engine.buffer_pool().get_stats(),
        remaining_versions: table.version_count(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn render(value: Option<Vec<u8>>) -> Option<String> {
    value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn handle_scenario() -> anyhow::Result<()> {
    let engine = Engine::open(EngineConfig::default().with_gc_disabled())?;
    let table = engine.create_table("scenario");

    let mut setup = engine.begin_transaction();
    let r = table.insert(&mut setup, b"R0".to_vec())?;
    engine.commit(setup)?;

    let mut a = engine.begin_transaction();
    table.update(&mut a, r, b"R1".to_vec())?;
    let b = engine.begin_transaction();
    let b_sees_before_a_commits = render(table.select(&b, r));
    let (a_start, b_start) = (a.start_timestamp(), b.start_timestamp());
    let a_commit = engine.commit(a)?;
    let b_sees_after_a_commits = render(table.select(&b, r));
    let c = engine.begin_transaction();
    let c_sees = render(table.select(&c, r));
    let c_start = c.start_timestamp();
    engine.commit(b)?;
    engine.commit(c)?;
    engine.fully_perform_gc();

    let pool_before_abort = engine.buffer_pool().allocated();
    let mut aborted = engine.begin_transaction();
    table.update(&mut aborted, r, b"R2".to_vec())?;
    engine.abort(aborted)?;
    let d = engine.begin_transaction();
    let d_sees_after_abort = render(table.select(&d, r));
    engine.commit(d)?;
    engine.fully_perform_gc();

    let report = ScenarioReport {
        initial: "R0".to_string(),
        b_sees_before_a_commits,
        b_sees_after_a_commits,
        c_sees,
        d_sees_after_abort,
        a_start: a_start.raw(),
        b_start: b_start.raw(),
        a_commit: a_commit.raw(),
        c_start: c_start.raw(),
        pool_before_abort,
        pool_after_drain: engine.buffer_pool().allocated(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    engine.shutdown();
    Ok(())
}

fn handle_config() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&EngineConfig::default())?);
    Ok(())
}
