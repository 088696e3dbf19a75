//! tsvault CLI
//!
//! Operator interface to a store directory:
//! - Write and read blobs and time series
//! - List keys by pattern
//! - Checkpoint, verify and inspect
//! - Resolve in-doubt transactions

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tsvault::{Config, Key, Samples, Store, TimeSeries, TxId};

#[derive(Parser)]
#[command(name = "tsvault")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transactional store for sparse time series and blobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: search the usual locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum SampleType {
    Int,
    Float,
    Double,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a blob from a file (or stdin with "-")
    PutBlob {
        key: String,
        input: PathBuf,
        /// Producer id recorded with the blob
        #[arg(long, default_value = "0")]
        origin: u64,
    },

    /// Write a blob to a file (or stdout)
    GetBlob {
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write samples starting at an index
    WriteTs {
        key: String,
        /// Index of the first sample
        #[arg(long)]
        start: i64,
        /// Comma-separated values
        #[arg(long, value_delimiter = ',')]
        values: Vec<f64>,
        #[arg(long, value_enum, default_value = "double")]
        sample_type: SampleType,
        #[arg(long, default_value = "0")]
        origin: u64,
    },

    /// Read a time series, optionally an inclusive index range
    ReadTs {
        key: String,
        #[arg(long)]
        from: Option<i64>,
        #[arg(long)]
        to: Option<i64>,
    },

    /// List keys matching a pattern, e.g. "TimeSeries@/pa/flux/[1-84]/*"
    Ls { pattern: String },

    /// Delete a key
    Rm { key: String },

    /// Show store statistics
    Stats,

    /// Checkpoint the index
    Checkpoint,

    /// Check the index and re-read every record
    Verify,

    /// List prepared transactions awaiting an outcome
    InDoubt,

    /// Commit or roll back an in-doubt transaction
    Resolve {
        tx: u64,
        #[arg(long, conflicts_with = "rollback", required_unless_present = "rollback")]
        commit: bool,
        #[arg(long)]
        rollback: bool,
    },
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("tsvault={}", config.logging.level))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.store.data_dir = dir.to_string_lossy().to_string();
    }
    init_logging(&config);

    if let Commands::Config { output } = &cli.command {
        let content = tsvault::generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(path, content)
                    .with_context(|| format!("writing {:?}", path))?;
                eprintln!("Wrote default config to {:?}", path);
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let store = Store::open(config.store_config()?).await?;
    let result = run(&store, cli.command, cli.format).await;
    store.close().await?;
    result
}

async fn run(store: &Store, command: Commands, format: OutputFormat) -> anyhow::Result<()> {
    match command {
        Commands::Config { .. } => {}

        Commands::PutBlob { key, input, origin } => {
            let key = Key::new(&key)?;
            let data = if input.as_os_str() == "-" {
                let mut buf = Vec::new();
                std::io::stdin().read_to_end(&mut buf)?;
                buf
            } else {
                std::fs::read(&input).with_context(|| format!("reading {:?}", input))?
            };
            let len = data.len();
            let tx = store.begin().await?;
            store.write_blob(tx, &key, data, origin).await?;
            let lsn = store.commit(tx).await?;
            eprintln!("Stored {} bytes at {} (LSN {})", len, key, lsn);
        }

        Commands::GetBlob { key, output } => {
            let key = Key::new(&key)?;
            let tx = store.begin().await?;
            let blob = store.read_blob(tx, &key).await;
            store.commit(tx).await?;
            let blob = blob?;
            match output {
                Some(path) => std::fs::write(&path, &blob.data)
                    .with_context(|| format!("writing {:?}", path))?,
                None => std::io::stdout().write_all(&blob.data)?,
            }
        }

        Commands::WriteTs {
            key,
            start,
            values,
            sample_type,
            origin,
        } => {
            if values.is_empty() {
                bail!("no values given");
            }
            let key = Key::new(&key)?;
            let samples = match sample_type {
                SampleType::Int => Samples::Int(values.iter().map(|v| *v as i32).collect()),
                SampleType::Float => Samples::Float(values.iter().map(|v| *v as f32).collect()),
                SampleType::Double => Samples::Double(values),
            };
            let series = TimeSeries::dense(start, samples);
            let end = series.end();
            let tx = store.begin().await?;
            store.write_time_series(tx, &key, series, origin).await?;
            store.commit(tx).await?;
            eprintln!("Wrote [{}, {}] to {}", start, end, key);
        }

        Commands::ReadTs { key, from, to } => {
            let key = Key::new(&key)?;
            let range = match (from, to) {
                (Some(from), Some(to)) => Some((from, to)),
                (None, None) => None,
                _ => bail!("--from and --to go together"),
            };
            let tx = store.begin().await?;
            let series = store.read_time_series(tx, &key, range).await;
            store.commit(tx).await?;
            let series = series?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&series)?),
                OutputFormat::Table => {
                    println!("{} ({}, start {})", key, series.data_type(), series.start);
                    for iv in series.origins.iter() {
                        println!("  [{}, {}] from task {:#x}", iv.start, iv.end, iv.tag);
                    }
                    for iv in series.valid.iter() {
                        for i in iv.start.max(series.start)..=iv.end.min(series.end()) {
                            let at = (i - series.start) as usize;
                            let value = match &series.samples {
                                Samples::Int(v) => v[at].to_string(),
                                Samples::Float(v) => v[at].to_string(),
                                Samples::Double(v) => v[at].to_string(),
                            };
                            println!("{:>10}  {}", i, value);
                        }
                    }
                }
            }
        }

        Commands::Ls { pattern } => {
            let keys = store.match_keys(&pattern).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
                OutputFormat::Table => {
                    for key in &keys {
                        println!("{}", key);
                    }
                    eprintln!("{} keys", keys.len());
                }
            }
        }

        Commands::Rm { key } => {
            let key = Key::new(&key)?;
            let tx = store.begin().await?;
            if let Err(e) = store.delete(tx, &key).await {
                store.rollback(tx).await?;
                return Err(e.into());
            }
            store.commit(tx).await?;
            eprintln!("Deleted {}", key);
        }

        Commands::Stats => {
            let stats = store.stats().await?;
            match format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "transactions": stats.transactions,
                        "throttle": stats.throttle,
                        "keys": stats.index.entries,
                        "index_height": stats.index.height,
                        "next_lsn": stats.journal.next_lsn,
                        "journal_segments": stats.journal.segments,
                        "containers": stats.containers.containers,
                        "used_blocks": stats.containers.used_blocks,
                    }))?
                ),
                OutputFormat::Table => {
                    println!("{}", stats);
                    println!(
                        "Index: {} nodes, {} splits, {} merges",
                        stats.index.nodes, stats.index.splits, stats.index.merges
                    );
                    println!(
                        "Journal: {} segments, {} appended, {} syncs",
                        stats.journal.segments, stats.journal.appended, stats.journal.syncs
                    );
                    println!(
                        "Containers: {} ({} of {} blocks used)",
                        stats.containers.containers,
                        stats.containers.used_blocks,
                        stats.containers.total_blocks
                    );
                    let report = store.recovery_report();
                    println!(
                        "Last recovery: {} commits redone, {} discarded, {} blocks reclaimed",
                        report.commits_redone, report.discarded, report.blocks_reclaimed
                    );
                }
            }
        }

        Commands::Checkpoint => {
            let lsn = store.checkpoint().await?;
            eprintln!("Checkpoint written at LSN {}", lsn);
        }

        Commands::Verify => {
            let report = store.verify().await?;
            println!(
                "{} keys, height {}, {} leaves",
                report.keys, report.height, report.leaves
            );
            for (key, reason) in &report.damaged {
                println!("DAMAGED {}: {}", key, reason);
            }
            if !report.is_clean() {
                bail!("{} damaged records", report.damaged.len());
            }
        }

        Commands::InDoubt => {
            let in_doubt = store.in_doubt();
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&in_doubt)?),
                OutputFormat::Table => {
                    if in_doubt.is_empty() {
                        println!("No in-doubt transactions");
                    }
                    for d in &in_doubt {
                        let xid = d.xid.as_ref().map(|x| x.to_string()).unwrap_or_default();
                        println!("{}  {} keys  {}", d.tx, d.keys, xid);
                    }
                }
            }
        }

        Commands::Resolve { tx, commit, .. } => {
            store.resolve(TxId(tx), commit).await?;
            eprintln!(
                "{} {}",
                TxId(tx),
                if commit { "committed" } else { "rolled back" }
            );
        }
    }
    Ok(())
}
