//! bsgs: Baby-Step Giant-Step ECDLP solver for secp256k1
//!
//! Recovers a private key k with P = k*G when k lies in a known scalar
//! range, in O(sqrt(N)) group operations and O(sqrt(N)/K) memory. Targets
//! are public keys (BSGS proper) or address hashes (exhaustive scan behind
//! a bloom filter). Supports multi-threaded sweeps, five search orders,
//! the secp256k1 endomorphism, checkpointed restart, and a distributed
//! work coordinator.

mod backend;
mod bloom;
mod checkpoint;
mod cli;
mod coordinator;
mod engine;
#[cfg(feature = "gpu")]
mod gpu;
mod math;
mod pool;
mod range;
mod secret;
mod table;
mod targets;

pub use backend::{CpuBackend, StepperBackend};
pub use bloom::{BloomFilter, CascadingBloomFilter, PartitionedBloomFilter};
pub use checkpoint::{CheckpointData, CheckpointProgress};
pub use coordinator::{WorkCoordinator, WorkUnit, WorkerStatus};
pub use engine::{BsgsEngine, BsgsParams, BsgsProgress, BsgsResult, SearchMode};
#[cfg(feature = "gpu")]
pub use gpu::{GpuContext, GpuStepper};
pub use math::{AffinePoint, Fe, JacobianPoint, U256};
pub use pool::{parallel_for, parallel_reduce, TaskPriority, ThreadPool};
pub use range::{KeyRange, RangePartitioner};
pub use secret::SecretKey;
pub use table::{BabyStepTable, BloomConfig, BloomKind};
pub use targets::{Compression, Target};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use indicatif::ProgressBar;
use serde::Serialize;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FOUND: i32 = 2;
pub const EXIT_INVALID_INPUT: i32 = 64;
pub const EXIT_INTERNAL_ERROR: i32 = 70;
pub const EXIT_INTERRUPTED: i32 = 130;

/// BSGS ECDLP solver for secp256k1
///
/// Finds private keys for the given targets inside a scalar range. Ranges
/// come as a puzzle bit count (--bits 66 means [2^65, 2^66-1]) or an
/// explicit lo:hi hex pair.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target: hex pubkey (66/130 chars), hex hash160 (40 chars), or an
    /// address. Repeatable.
    #[arg(short = 'p', long = "target")]
    targets: Vec<String>,

    /// File with one target per line (# comments allowed)
    #[arg(short = 'f', long)]
    targets_file: Option<PathBuf>,

    /// Puzzle bit count; the range becomes [2^(n-1), 2^n - 1]
    #[arg(short, long, conflicts_with = "range")]
    bits: Option<u32>,

    /// Explicit range as lo:hi (hex, 0x prefix optional)
    #[arg(short, long)]
    range: Option<String>,

    /// Baby-step table size; derived as ceil(sqrt(N/K)) if not set
    #[arg(short, long)]
    m: Option<u64>,

    /// Memory/time trade-off factor: K times less memory, sqrt(K) times
    /// more giant steps
    #[arg(short, long, default_value = "1")]
    k_factor: u32,

    /// Giant-step sweep order
    #[arg(long, value_enum, default_value_t = SearchMode::Sequential)]
    mode: SearchMode,

    /// Pubkey serialization(s) used for hash160 matching
    #[arg(long, value_enum, default_value_t = Compression::Compressed)]
    compression: Compression,

    /// Worker threads (0 = one per CPU)
    #[arg(short, long, default_value = "0")]
    threads: usize,

    /// Probe with the secp256k1 endomorphism, halving giant steps
    #[arg(short, long)]
    endomorphism: bool,

    /// Bloom filter bits per table entry
    #[arg(long, default_value = "14")]
    bloom_bits: u32,

    /// Bloom filter hash count
    #[arg(long, default_value = "10")]
    bloom_hashes: u32,

    /// Bloom filter layout
    #[arg(long, value_enum, default_value_t = BloomKindArg::Single)]
    bloom_kind: BloomKindArg,

    /// Memory budget for the baby-step table, in MiB (0 = unlimited)
    #[arg(long, default_value = "0")]
    max_memory: u64,

    /// Checkpoint file; written every checkpoint-interval seconds
    #[arg(short, long)]
    checkpoint: Option<PathBuf>,

    /// Seconds between periodic checkpoints
    #[arg(long, default_value = "300")]
    checkpoint_interval: u64,

    /// Resume from the checkpoint file instead of starting fresh
    #[arg(long, requires = "checkpoint")]
    resume: bool,

    /// Persist the baby-step table here and reuse it across runs
    #[arg(long)]
    table: Option<PathBuf>,

    /// Append found keys (hex) to this file as soon as they are verified
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seed for the random/dance sweep orders
    #[arg(long, default_value = "25214903917")]
    seed: u64,

    /// Use the GPU backend (requires the gpu build feature)
    #[arg(long)]
    gpu: bool,

    /// GPU device index
    #[arg(long, default_value = "0")]
    gpu_device: u32,

    /// Minimal output, just the found key(s) on stdout
    #[arg(short, long)]
    quiet: bool,

    /// Machine-readable JSON summary on stdout
    #[arg(long)]
    json: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

/// clap-friendly mirror of [`BloomKind`].
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum BloomKindArg {
    Single,
    Cascading,
    Partitioned,
}

impl From<BloomKindArg> for BloomKind {
    fn from(value: BloomKindArg) -> Self {
        match value {
            BloomKindArg::Single => BloomKind::Single,
            BloomKindArg::Cascading => BloomKind::Cascading,
            BloomKindArg::Partitioned => BloomKind::Partitioned,
        }
    }
}

impl std::fmt::Display for BloomKindArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BloomKindArg::Single => "single",
            BloomKindArg::Cascading => "cascading",
            BloomKindArg::Partitioned => "partitioned",
        };
        f.write_str(name)
    }
}

#[derive(Serialize)]
struct FoundKey {
    private_key: String,
    target: String,
    found_at_ms: u64,
}

#[derive(Serialize)]
struct SearchSummary {
    algorithm: &'static str,
    found: bool,
    results: Vec<FoundKey>,
    keys_checked: u64,
    elapsed_seconds: f64,
    keys_per_second: u64,
}

pub fn run_from_args<I, S>(args: I) -> i32
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString> + Clone,
{
    run(Args::parse_from(args))
}

/// Run a search from parsed arguments; returns the process exit code.
pub fn run(args: Args) -> i32 {
    cli::init_tracing(args.verbose, args.quiet || args.json);

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid input: {e:#}");
            eprintln!("error: {e:#}");
            return EXIT_INVALID_INPUT;
        }
    };

    match execute(&args, config) {
        Ok(found) => {
            if found {
                EXIT_FOUND
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            error!("search failed: {e:#}");
            eprintln!("error: {e:#}");
            EXIT_INTERNAL_ERROR
        }
    }
}

struct RunConfig {
    targets: Vec<Target>,
    params: BsgsParams,
}

/// Validate every input at the boundary; nothing malformed reaches the
/// engine.
fn build_config(args: &Args) -> Result<RunConfig> {
    let mut targets = Vec::new();
    for spec in &args.targets {
        targets.push(Target::parse(spec)?);
    }
    if let Some(path) = &args.targets_file {
        targets.extend(Target::load_file(path)?);
    }
    if targets.is_empty() && !args.resume {
        bail!("no targets: pass --target, --targets-file, or --resume");
    }

    let range = match (&args.bits, &args.range) {
        (Some(bits), None) => KeyRange::for_bits(*bits)?,
        (None, Some(spec)) => KeyRange::parse(spec)?,
        (None, None) if args.resume => KeyRange::for_bits(32)?, // overwritten by the checkpoint
        _ => bail!("exactly one of --bits or --range is required"),
    };

    if args.gpu && !cfg!(feature = "gpu") {
        bail!("this binary was built without the gpu feature");
    }

    let mut params = BsgsParams::new(range);
    params.m = args.m;
    params.k_factor = args.k_factor;
    params.mode = args.mode;
    params.compression = args.compression;
    params.num_threads = args.threads;
    params.endomorphism = args.endomorphism;
    params.bloom = BloomConfig {
        kind: args.bloom_kind.into(),
        bits_per_item: args.bloom_bits,
        hash_count: args.bloom_hashes,
    };
    params.max_memory_bytes = args.max_memory * 1024 * 1024;
    params.rng_seed = args.seed;
    params.checkpoint_path = args.checkpoint.clone();
    params.checkpoint_interval = Duration::from_secs(args.checkpoint_interval);
    params.table_path = args.table.clone();

    Ok(RunConfig { targets, params })
}

fn make_backend(args: &Args) -> Result<Arc<dyn StepperBackend>> {
    #[cfg(feature = "gpu")]
    if args.gpu {
        let ctx = pollster::block_on(gpu::GpuContext::new(args.gpu_device))?;
        info!("GPU: {}", ctx.device_name());
        return Ok(Arc::new(gpu::GpuStepper::new(ctx)?));
    }
    let _ = args;
    Ok(Arc::new(CpuBackend::new()))
}

fn execute(args: &Args, config: RunConfig) -> Result<bool> {
    let backend = make_backend(args)?;
    let mut engine = BsgsEngine::with_backend(config.params, backend);

    if args.resume {
        let path = args
            .checkpoint
            .as_ref()
            .ok_or_else(|| anyhow!("--resume requires --checkpoint"))?;
        engine.load_checkpoint(path)?;
        if !config.targets.is_empty() {
            info!("targets on the command line are ignored when resuming");
        }
    } else {
        engine.initialize(config.targets)?;
    }

    if !args.quiet && !args.json {
        info!("BSGS ECDLP Solver");
        info!("Range: {}", engine.params().range);
        info!("Mode: {:?}, endomorphism: {}", args.mode, args.endomorphism);
    }

    // write each key the moment it is verified, so a watcher polling the
    // file cannot miss a found key even if we crash right after
    if let Some(output) = args.output.clone() {
        engine.set_result_sink(move |result| {
            let line = format!("{} {}\n", result.private_key.to_hex(), result.target);
            let write = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&output)
                .and_then(|mut f| f.write_all(line.as_bytes()));
            if let Err(e) = write {
                error!("failed to write result file: {e}");
            }
        });
    }

    let progress_bar = if args.quiet || args.json {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(100);
        bar.set_style(cli::sweep_progress_style());
        bar
    };

    engine.start()?;

    while engine.is_running() {
        std::thread::sleep(Duration::from_millis(250));
        let progress = engine.get_progress();
        progress_bar.set_position(progress.progress_percent as u64);
        progress_bar.set_message(progress.format_speed());
    }
    engine.wait();

    let results = engine.get_results();
    let progress = engine.get_progress();
    let found = !results.is_empty();

    if found {
        progress_bar.finish_with_message("FOUND");
    } else {
        progress_bar.finish_with_message("exhausted");
    }

    if args.json {
        let summary = SearchSummary {
            algorithm: "bsgs",
            found,
            results: results
                .iter()
                .map(|r| FoundKey {
                    private_key: r.private_key.to_hex(),
                    target: r.target.to_string(),
                    found_at_ms: r.found_at_ms,
                })
                .collect(),
            keys_checked: progress.keys_checked,
            elapsed_seconds: progress.elapsed.as_secs_f64(),
            keys_per_second: progress.keys_per_second,
        };
        println!(
            "{}",
            serde_json::to_string(&summary).context("serialize summary")?
        );
    } else if args.quiet {
        for result in &results {
            println!("{}", result.private_key.to_hex());
        }
    } else {
        for result in &results {
            info!(
                "private key found: 0x{} ({})",
                result.private_key.to_hex(),
                result.target
            );
        }
        info!(
            "checked {} keys in {} ({})",
            progress.keys_checked,
            progress.format_elapsed(),
            progress.format_speed()
        );
    }

    // leave a final checkpoint behind for inspection or later resume
    if let Some(path) = &args.checkpoint {
        if let Err(e) = engine.save_checkpoint(path) {
            error!("final checkpoint failed: {e:#}");
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_targets() {
        let args = Args::parse_from(["bsgs", "--bits", "20"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn config_requires_range() {
        let args = Args::parse_from([
            "bsgs",
            "--target",
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        ]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn config_accepts_bits_and_pubkey() {
        let args = Args::parse_from([
            "bsgs",
            "--bits",
            "20",
            "--target",
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.params.range.start.to_hex(), "80000");
        assert_eq!(config.params.range.end.to_hex(), "fffff");
    }

    #[test]
    fn config_parses_explicit_range_and_mode() {
        let args = Args::parse_from([
            "bsgs",
            "--range",
            "0x100:0x1fff",
            "--mode",
            "random",
            "--target",
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.params.mode, SearchMode::Random);
        assert_eq!(config.params.range.size().low_u64(), 0x1f00);
    }

    #[test]
    fn config_rejects_bad_range() {
        let args = Args::parse_from([
            "bsgs",
            "--range",
            "20:10",
            "--target",
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        ]);
        assert!(build_config(&args).is_err());
    }
}
