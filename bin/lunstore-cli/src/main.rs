//! lunstore CLI - Operator Command Line Interface
//!
//! Builds the logical units of a target configuration in-process and drives
//! them through a local front end: inspect a unit, walk its provisioning
//! map, or run a random I/O workload against it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use lunstore_block::{
    Capability, Completion, LocalInitiator, LogicalUnit, LunManager, LunParams, Opcode,
    StatsSnapshot,
};
use lunstore_common::config::parse_size;
use lunstore_common::{BlockState, TargetConfig};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lunstore-cli")]
#[command(about = "lunstore logical unit CLI")]
#[command(version)]
struct Args {
    /// Target configuration (TOML); LUNSTORE__* variables override it
    #[arg(short, long, env = "LUNSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the configured logical units
    List,
    /// Show geometry, policy and capacity of one unit
    Probe {
        #[command(flatten)]
        target: Target,
    },
    /// Walk the provisioning state of a unit
    Map {
        #[command(flatten)]
        target: Target,
        /// First LBA to report
        #[arg(long, default_value_t = 0)]
        start: u64,
        /// Stop after this many runs
        #[arg(long, default_value_t = 1024)]
        max_runs: usize,
    },
    /// Run a random read/write workload
    Bench {
        #[command(flatten)]
        target: Target,
        /// Bytes per command (e.g. 4k, 128k, 1m)
        #[arg(long, default_value = "4k")]
        io_size: String,
        /// Total commands
        #[arg(long, default_value_t = 10_000)]
        ops: u64,
        /// Concurrent submitters
        #[arg(long, default_value_t = 8)]
        jobs: u64,
        /// Share of reads, 0-100
        #[arg(long, default_value_t = 70)]
        read_percent: u32,
        /// RNG seed
        #[arg(long, default_value_t = 1)]
        seed: u64,
    },
}

/// A configured unit by name, or a backing path to open ad hoc
#[derive(ClapArgs, Debug)]
struct Target {
    /// LUN name from the configuration, or a file, device or
    /// /dev/zvol/<pool>/<volume> path
    lun: String,

    /// Logical block size for an ad hoc unit
    #[arg(long)]
    block_size: Option<u32>,

    /// Size for an ad hoc unit (e.g. 10G, 512M)
    #[arg(long)]
    size: Option<String>,

    /// Named option for an ad hoc unit (key=value, repeatable)
    #[arg(short, long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,
}

fn parse_option(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {s:?}"))
}

impl Target {
    /// Find the configured unit, or create one over the given path.
    fn resolve(&self, manager: &LunManager) -> Result<Arc<LogicalUnit>> {
        if let Some(lun) = manager.find(&self.lun) {
            return Ok(lun);
        }
        let mut params = LunParams::new(self.lun.clone(), &self.lun);
        params.block_size = self.block_size;
        params.size = self
            .size
            .as_deref()
            .map(|s| parse_size("size", s))
            .transpose()?;
        for (name, value) in &self.options {
            params = params.with_option(name, value);
        }
        manager
            .create(params)
            .with_context(|| format!("open {}", self.lun))
    }
}

fn describe(completion: &Completion) -> String {
    match completion {
        Completion::Ok => "ok".to_string(),
        Completion::BlockStatus { state, blocks } => format!("{state:?} x {blocks}"),
        Completion::Miscompare { offset } => format!("miscompare at byte {offset}"),
        Completion::Failed(err) => err.to_string(),
        Completion::Aborted => "aborted".to_string(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ── probe ─────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ProbeReport {
    #[serde(flatten)]
    info: lunstore_block::LunInfo,
    blocks_used: Option<u64>,
    blocks_available: Option<u64>,
}

fn probe(lun: &LogicalUnit) -> Result<()> {
    print_json(&ProbeReport {
        info: lun.info(),
        blocks_used: lun.capability(Capability::BlocksUsed),
        blocks_available: lun.capability(Capability::BlocksAvailable),
    })
}

// ── map ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Run {
    lba: u64,
    blocks: u64,
    state: BlockState,
}

async fn map(
    initiator: &LocalInitiator,
    lun: &LogicalUnit,
    start: u64,
    max_runs: usize,
) -> Result<()> {
    let capacity = lun.geometry().capacity;
    let mut runs: Vec<Run> = Vec::new();
    let mut lba = start;

    while lba < capacity && runs.len() < max_runs {
        let cmd = initiator.command(Opcode::GetLbaStatus, lba, 0);
        let response = initiator.execute(lun, cmd, Bytes::new()).await;
        let Completion::BlockStatus { state, blocks } = response.completion else {
            bail!("block status at LBA {lba}: {}", describe(&response.completion));
        };
        debug!("LBA {lba}: {state:?} x {blocks}");
        match runs.last_mut() {
            Some(last) if last.state == state && last.lba + last.blocks == lba => {
                last.blocks += blocks;
            }
            _ => runs.push(Run { lba, blocks, state }),
        }
        lba += blocks.max(1);
    }
    print_json(&runs)
}

// ── bench ─────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct BenchReport {
    ops: u64,
    reads: u64,
    writes: u64,
    failures: u64,
    io_size: u64,
    elapsed_ms: u128,
    iops: f64,
    mib_per_sec: f64,
    first_failure: Option<String>,
    stats: StatsSnapshot,
}

#[derive(Default)]
struct JobResult {
    reads: u64,
    writes: u64,
    failures: u64,
    first_failure: Option<String>,
}

struct Workload {
    io_size: u64,
    ops: u64,
    jobs: u64,
    read_percent: u32,
    seed: u64,
}

async fn bench(
    initiator: Arc<LocalInitiator>,
    lun: Arc<LogicalUnit>,
    workload: Workload,
) -> Result<()> {
    let geometry = lun.geometry();
    let bs = u64::from(geometry.block_size);
    if workload.io_size == 0 || workload.io_size % bs != 0 {
        bail!("io size {} is not a multiple of the {bs}-byte block", workload.io_size);
    }
    let blocks = workload.io_size / bs;
    if blocks > geometry.capacity {
        bail!("io size exceeds the unit ({} blocks)", geometry.capacity);
    }
    let slots = geometry.capacity / blocks;
    let jobs = workload.jobs.clamp(1, workload.ops.max(1));
    info!(
        "bench {}: {} ops of {} bytes, {jobs} jobs, {}% reads",
        lun.name(),
        workload.ops,
        workload.io_size,
        workload.read_percent
    );

    let started = Instant::now();
    let mut handles = Vec::with_capacity(jobs as usize);
    for job in 0..jobs {
        let initiator = Arc::clone(&initiator);
        let lun = Arc::clone(&lun);
        let ops = workload.ops / jobs + u64::from(job < workload.ops % jobs);
        let read_percent = workload.read_percent;
        let io_size = workload.io_size;
        let mut rng = StdRng::seed_from_u64(workload.seed ^ job.rotate_left(32));

        handles.push(tokio::spawn(async move {
            let mut payload = vec![0u8; io_size as usize];
            rng.fill_bytes(&mut payload);
            let payload = Bytes::from(payload);
            let mut result = JobResult::default();

            for _ in 0..ops {
                let lba = rng.gen_range(0..slots) * blocks;
                let response = if rng.gen_range(0..100) < read_percent {
                    result.reads += 1;
                    initiator.read(&lun, lba, blocks).await
                } else {
                    result.writes += 1;
                    initiator.write(&lun, lba, payload.clone(), false).await
                };
                if !response.is_ok() {
                    result.failures += 1;
                    result
                        .first_failure
                        .get_or_insert_with(|| describe(&response.completion));
                }
            }
            result
        }));
    }

    let mut total = JobResult::default();
    for handle in handles {
        let result = handle.await.context("bench job panicked")?;
        total.reads += result.reads;
        total.writes += result.writes;
        total.failures += result.failures;
        if total.first_failure.is_none() {
            total.first_failure = result.first_failure;
        }
    }
    let elapsed = started.elapsed().max(Duration::from_micros(1));
    let secs = elapsed.as_secs_f64();

    print_json(&BenchReport {
        ops: workload.ops,
        reads: total.reads,
        writes: total.writes,
        failures: total.failures,
        io_size: workload.io_size,
        elapsed_ms: elapsed.as_millis(),
        iops: workload.ops as f64 / secs,
        mib_per_sec: (workload.ops * workload.io_size) as f64 / secs / f64::from(1 << 20),
        first_failure: total.first_failure,
        stats: lun.stats(),
    })
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = TargetConfig::load(args.config.as_deref()).context("load configuration")?;
    let initiator = Arc::new(LocalInitiator::new());
    let manager = LunManager::from_config(initiator.clone(), &config)
        .context("create configured logical units")?;

    let result = match args.command {
        Commands::List => print_json(&manager.list()),
        Commands::Probe { target } => {
            let lun = target.resolve(&manager)?;
            probe(&lun)
        }
        Commands::Map {
            target,
            start,
            max_runs,
        } => {
            let lun = target.resolve(&manager)?;
            map(&initiator, &lun, start, max_runs).await
        }
        Commands::Bench {
            target,
            io_size,
            ops,
            jobs,
            read_percent,
            seed,
        } => {
            let lun = target.resolve(&manager)?;
            let workload = Workload {
                io_size: parse_size("io_size", &io_size)?,
                ops,
                jobs,
                read_percent: read_percent.min(100),
                seed,
            };
            bench(Arc::clone(&initiator), lun, workload).await
        }
    };

    manager.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option() {
        assert_eq!(
            parse_option("serseq=on").unwrap(),
            ("serseq".to_string(), "on".to_string())
        );
        assert_eq!(
            parse_option(" pblocksize = 4k ").unwrap(),
            ("pblocksize".to_string(), "4k".to_string())
        );
        assert!(parse_option("readonly").is_err());
        assert!(parse_option("=on").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::try_parse_from([
            "lunstore-cli",
            "bench",
            "/tmp/lun.img",
            "--size",
            "64m",
            "-o",
            "num_threads=4",
            "--io-size",
            "128k",
        ])
        .unwrap();
        let Commands::Bench {
            target, io_size, ..
        } = args.command
        else {
            panic!("expected bench");
        };
        assert_eq!(target.lun, "/tmp/lun.img");
        assert_eq!(target.size.as_deref(), Some("64m"));
        assert_eq!(target.options, vec![("num_threads".to_string(), "4".to_string())]);
        assert_eq!(io_size, "128k");
    }

    #[test]
    fn test_resolve_ad_hoc_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(1 << 20).unwrap();
        let manager = LunManager::new(Arc::new(LocalInitiator::new()));
        let target = Target {
            lun: tmp.path().display().to_string(),
            block_size: Some(4096),
            size: None,
            options: vec![("num_threads".to_string(), "1".to_string())],
        };

        let lun = target.resolve(&manager).unwrap();
        assert_eq!(lun.geometry().block_size, 4096);
        assert_eq!(lun.geometry().capacity, 256);
        probe(&lun).unwrap();

        // A second resolve finds the unit instead of opening it again
        assert!(Arc::ptr_eq(&target.resolve(&manager).unwrap(), &lun));
        assert_eq!(manager.list().len(), 1);
        manager.shutdown();
    }
}
