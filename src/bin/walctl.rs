//! Operator tool for a headwal WAL directory.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment
//! variables (`WALCTL_*`), and CLI flags. Then inspects, verifies, recovers or
//! checkpoints the WAL.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::{Config, Environment, File};
use headwal::record::RecordType;
use headwal::segments::{list_segment_ids, read_segment, segment_path};
use headwal::{Head, HeadOptions, SegmentStoreConfig, TracingEventListener, Wal};
use tracing_subscriber::EnvFilter;

// ---------- CLI ----------

/// Inspect and maintain a headwal write-ahead log.
#[derive(Parser, Debug)]
#[command(name = "walctl", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `walctl.toml` is loaded when it exists.
    #[arg(long, env = "WALCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Override the WAL directory.
    #[arg(long, env = "WALCTL_WAL_DIR")]
    pub wal_dir: Option<PathBuf>,

    /// Override the chunk capacity used by `recover`.
    #[arg(long)]
    pub chunk_capacity: Option<usize>,

    /// Override the segment capacity in bytes.
    #[arg(long)]
    pub segment_capacity_bytes: Option<u64>,

    /// Load and validate config (file + env + CLI), print it, then exit.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Print every segment with its size, record counts and first damaged record.
    Inspect,
    /// Exit with status 1 if any record in the log is damaged.
    Verify,
    /// Open a head over the WAL (truncating a damaged tail) and print what it holds.
    Recover,
    /// Repair a damaged tail, checkpoint the WAL, then delete flushed segments.
    Checkpoint,
}

// ---------- File/env config (all optional for partial config) ----------

#[derive(Debug, Default, serde::Deserialize)]
pub struct WalctlFileConfig {
    pub wal_dir: Option<String>,
    pub chunk_capacity: Option<usize>,
    pub segment_capacity_bytes: Option<u64>,
    pub sync_timeout_ms: Option<u64>,
}

fn load_options(cli: &Cli) -> Result<HeadOptions, String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(true));
        } else {
            let default_path = PathBuf::from("walctl.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("WALCTL")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: WalctlFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut options = HeadOptions {
        event_listener: Arc::new(TracingEventListener),
        ..HeadOptions::default()
    };
    if let Some(d) = &partial.wal_dir {
        options.wal_dir = PathBuf::from(d);
    }
    if let Some(n) = partial.chunk_capacity {
        options.chunk_capacity = n;
    }
    if let Some(n) = partial.segment_capacity_bytes {
        options.segment_capacity_bytes = n;
    }
    if let Some(ms) = partial.sync_timeout_ms {
        options.sync_timeout = Some(Duration::from_millis(ms));
    }

    if let Some(d) = &cli.wal_dir {
        options.wal_dir = d.clone();
    }
    if let Some(n) = cli.chunk_capacity {
        options.chunk_capacity = n;
    }
    if let Some(n) = cli.segment_capacity_bytes {
        options.segment_capacity_bytes = n;
    }

    if options.chunk_capacity == 0 {
        return Err("chunk_capacity must be greater than zero".to_string());
    }
    if options.segment_capacity_bytes == 0 {
        return Err("segment_capacity_bytes must be greater than zero".to_string());
    }
    Ok(options)
}

// ---------- Commands ----------

fn inspect(options: &HeadOptions) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut damaged = false;
    for id in list_segment_ids(&options.wal_dir)? {
        let scan = read_segment(&segment_path(&options.wal_dir, id))?;
        let count = |t: RecordType| scan.records.iter().filter(|r| r.typ == t).count();
        let status = match &scan.stop {
            None => "ok".to_string(),
            Some(stop) => {
                damaged = true;
                stop.to_string()
            }
        };
        println!(
            "segment={:08} bytes={} series={} samples={} checkpoints={} status={}",
            id,
            scan.file_len,
            count(RecordType::Series),
            count(RecordType::Samples),
            count(RecordType::Checkpoint),
            status
        );
        if damaged {
            break;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn verify(options: &HeadOptions) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let replay = Wal::replay(&options.wal_dir)?;
    match replay.corruption {
        None => {
            println!(
                "ok segments={} records={}",
                replay.segments,
                replay.records.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(c) => {
            println!(
                "damaged {} (intact records before it: {})",
                c,
                replay.records.len()
            );
            Ok(ExitCode::from(1))
        }
    }
}

fn recover(options: HeadOptions) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let head = Head::open(options)?;
    let mut samples = 0usize;
    let mut chunks = 0usize;
    for s in head.all_series()? {
        samples += s.num_samples()?;
        chunks += s.num_chunks()?;
    }
    println!("series={}", head.num_series()?);
    println!("samples={}", samples);
    println!("chunks={}", chunks);
    match head.time_bounds() {
        Some((min, max)) => println!("min_time={} max_time={}", min, max),
        None => println!("min_time=- max_time=-"),
    }
    head.close()?;
    Ok(ExitCode::SUCCESS)
}

fn checkpoint(options: &HeadOptions) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let wal = Wal::open(
        &options.wal_dir,
        SegmentStoreConfig {
            segment_capacity_bytes: options.segment_capacity_bytes,
            sync_timeout: options.sync_timeout,
            event_listener: options.event_listener.clone(),
        },
    )?;
    // The marker has to land where replay can reach it.
    let summary = Wal::replay_with(&options.wal_dir, |_| Ok(()))?;
    if let Some(c) = &summary.corruption {
        let dropped = wal.repair(c)?;
        println!("repaired={} dropped_segments={}", c, dropped);
    }
    wal.checkpoint()?;
    let removed = wal.clean()?;
    println!("removed={}", removed);
    println!("segments={}", wal.segments()?.len());
    wal.close()?;
    Ok(ExitCode::SUCCESS)
}

// ---------- Main ----------

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = match load_options(&cli) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("config error: {}", e);
            return ExitCode::from(2);
        }
    };

    if cli.validate_config {
        println!("wal_dir={}", options.wal_dir.display());
        println!("chunk_capacity={}", options.chunk_capacity);
        println!("segment_capacity_bytes={}", options.segment_capacity_bytes);
        match options.sync_timeout {
            Some(t) => println!("sync_timeout_ms={}", t.as_millis()),
            None => println!("sync_timeout_ms=none"),
        }
        return ExitCode::SUCCESS;
    }

    let Some(command) = cli.command else {
        eprintln!("no command given (try --help)");
        return ExitCode::from(2);
    };

    let result = match command {
        Command::Inspect => inspect(&options),
        Command::Verify => verify(&options),
        Command::Recover => recover(options),
        Command::Checkpoint => checkpoint(&options),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("walctl {:?} failed: {}", command, e);
            ExitCode::from(2)
        }
    }
}
