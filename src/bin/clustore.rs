//! clustore inspection tool
//!
//! ```bash
//! # Header and allocation statistics
//! clustore info data.cls
//!
//! # Walk every chain and report leaked or doubly-owned clusters
//! clustore verify data.cls
//!
//! # Print the bytes of stream 3
//! clustore dump data.cls 3
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clustore::storage::{ClusteredStreams, FileBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Inspect clustered stream stores
#[derive(Parser, Debug)]
#[command(name = "clustore")]
#[command(version = clustore::VERSION)]
#[command(about = "Inspect clustered stream stores", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show header fields and allocation statistics
    Info {
        /// Store file
        file: PathBuf,
    },

    /// Check every cluster chain for consistency
    Verify {
        /// Store file
        file: PathBuf,
    },

    /// Print the contents of one stream
    Dump {
        /// Store file
        file: PathBuf,

        /// Stream index (reserved streams included)
        index: u64,

        /// Write raw bytes instead of a hex listing
        #[arg(long)]
        raw: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, !cli.no_color);

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(level: &str, ansi: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(ansi).with_writer(std::io::stderr))
        .init();
}

fn open(path: &Path) -> Result<ClusteredStreams> {
    let backend = FileBackend::open(path).with_context(|| format!("opening {}", path.display()))?;
    let streams = ClusteredStreams::open(Arc::new(backend))
        .with_context(|| format!("reading store {}", path.display()))?;
    info!(path = %path.display(), "Opened store");
    Ok(streams)
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Info { file } => {
            let stats = open(file)?.stats()?;
            if cli.json {
                let value = serde_json::json!({
                    "stream_count": stats.stream_count,
                    "reserved_streams": stats.reserved_streams,
                    "cluster_size": stats.cluster_size,
                    "total_clusters": stats.total_clusters,
                    "free_clusters": stats.free_clusters,
                    "descriptor_clusters": stats.descriptor_clusters,
                    "store_bytes": stats.store_bytes,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("Streams:             {}", stats.stream_count);
                println!("Reserved streams:    {}", stats.reserved_streams);
                println!("Cluster size:        {} bytes", stats.cluster_size);
                println!("Clusters:            {}", stats.total_clusters);
                println!("Free clusters:       {}", stats.free_clusters);
                println!("Descriptor clusters: {}", stats.descriptor_clusters);
                println!("Store size:          {} bytes", stats.store_bytes);
            }
        }
        Commands::Verify { file } => {
            let report = open(file)?.verify()?;
            if cli.json {
                let value = serde_json::json!({
                    "consistent": report.is_consistent(),
                    "total_clusters": report.total_clusters,
                    "data_clusters": report.data_clusters,
                    "descriptor_clusters": report.descriptor_clusters,
                    "free_clusters": report.free_clusters,
                    "leaked": report.leaked,
                    "problems": report.problems,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "{} clusters: {} data, {} descriptor, {} free, {} leaked",
                    report.total_clusters,
                    report.data_clusters,
                    report.descriptor_clusters,
                    report.free_clusters,
                    report.leaked.len()
                );
                for problem in &report.problems {
                    println!("  problem: {}", problem);
                }
                if !report.leaked.is_empty() {
                    println!("  leaked clusters: {:?}", report.leaked);
                }
            }
            if !report.is_consistent() {
                bail!("store is inconsistent");
            }
        }
        Commands::Dump { file, index, raw } => {
            let streams = open(file)?;
            let descriptor = streams.descriptor(*index)?;
            let bytes = streams.read_all(*index)?;
            match bytes {
                None => {
                    let state = if descriptor.traits.is_null() { "null" } else { "reaped" };
                    println!("Stream {} is {}", index, state);
                }
                Some(bytes) if *raw => {
                    use std::io::Write;
                    std::io::stdout().write_all(&bytes)?;
                }
                Some(bytes) => {
                    println!("Stream {}: {} bytes from cluster {}", index, bytes.len(), descriptor.start_cluster);
                    for (row, chunk) in bytes.chunks(16).enumerate() {
                        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                        let text: String = chunk
                            .iter()
                            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                            .collect();
                        println!("{:08x}  {:<47}  {}", row * 16, hex.join(" "), text);
                    }
                }
            }
        }
    }
    Ok(())
}
