//! Newhelm CLI - maintenance tools for response caches and test assets

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use newhelm_core::cache::{DiskCache, ResponseCache};
use newhelm_core::config::NewhelmConfig;
use newhelm_core::deps::{Decompression, DependencyAsset, DependencyManager};
use newhelm_core::fingerprint::{CacheKey, fingerprint_value};
use newhelm_core::record::InitializationRecord;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "newhelm")]
#[command(about = "Newhelm evaluation substrate CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Read only this configuration file instead of the layered defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Version information
    Version,
    /// Compute the cache key for a component and request
    Fingerprint {
        /// Type identifier of the component
        #[arg(long = "type")]
        type_identifier: String,
        /// Positional constructor argument as JSON (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Keyword constructor argument as name=JSON (repeatable)
        #[arg(long = "kwarg")]
        kwargs: Vec<String>,
        /// Request payload as JSON
        #[arg(long)]
        request: String,
    },
    /// Response cache maintenance
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Test asset management
    Deps {
        #[command(subcommand)]
        command: DepsCommands,
    },
    /// Configuration inspection
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Entry count and size of the current namespace
    Stats,
    /// Delete every entry in the current namespace
    Clear,
    /// Delete namespaces of other schema versions
    Prune,
    /// Print the stored response for a key
    Get {
        /// 64-character hex cache key
        key: String,
    },
}

#[derive(Subcommand)]
enum DepsCommands {
    /// Download and verify an asset, printing its local path
    Resolve {
        /// Asset name
        #[arg(long)]
        name: String,
        /// URL or file path to fetch from
        #[arg(long)]
        source: String,
        /// Expected SHA-256 of the downloaded bytes
        #[arg(long)]
        sha256: String,
        /// none, gzip or tar-gz
        #[arg(long, default_value = "none")]
        decompress: Decompression,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
}

/// Parse JSON, falling back to a plain string for bare words
fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn load_config(path: Option<&PathBuf>) -> Result<NewhelmConfig> {
    let config = match path {
        Some(path) => NewhelmConfig::from_file(path)?,
        None => NewhelmConfig::load()?,
    };
    Ok(config)
}

fn open_disk_cache(config: &NewhelmConfig) -> Result<DiskCache> {
    DiskCache::open_with_version(&config.cache.dir, config.cache.schema_version)
        .with_context(|| format!("opening cache at {}", config.cache.dir.display()))
}

fn fingerprint_command(
    type_identifier: String,
    args: Vec<String>,
    kwargs: Vec<String>,
    request: String,
) -> Result<()> {
    let mut builder = InitializationRecord::builder(type_identifier);
    for arg in &args {
        builder = builder.arg(parse_json_arg(arg));
    }
    for kwarg in &kwargs {
        let (name, raw) = kwarg
            .split_once('=')
            .ok_or_else(|| anyhow!("--kwarg expects name=JSON, got '{}'", kwarg))?;
        builder = builder.kwarg(name, parse_json_arg(raw));
    }
    let record = builder.build()?;
    let request: Value =
        serde_json::from_str(&request).context("--request must be valid JSON")?;

    let key = fingerprint_value(&record, &request)?;
    tracing::debug!(record = %record, "computed fingerprint");
    println!("{}", key);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            println!("newhelm {}", env!("CARGO_PKG_VERSION"));
            println!("newhelm-core {}", newhelm_core::VERSION);
        }
        Commands::Fingerprint {
            type_identifier,
            args,
            kwargs,
            request,
        } => fingerprint_command(type_identifier, args, kwargs, request)?,
        Commands::Cache { command } => {
            let config = load_config(cli.config.as_ref())?;
            let cache = open_disk_cache(&config)?;
            match command {
                CacheCommands::Stats => {
                    let stats = cache.stats()?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                CacheCommands::Clear => {
                    let removed = cache.clear()?;
                    println!("Removed {} entries", removed);
                }
                CacheCommands::Prune => {
                    let pruned = cache.prune_other_versions()?;
                    if pruned.is_empty() {
                        println!("No other schema versions present");
                    } else {
                        for version in pruned {
                            println!("Pruned v{}", version);
                        }
                    }
                }
                CacheCommands::Get { key } => {
                    let key: CacheKey = key.parse()?;
                    match cache.get(&key)? {
                        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                        None => bail!("no cache entry for {}", key),
                    }
                }
            }
        }
        Commands::Deps { command } => match command {
            DepsCommands::Resolve {
                name,
                source,
                sha256,
                decompress,
            } => {
                let config = load_config(cli.config.as_ref())?;
                let manager = DependencyManager::from_config(&config.dependencies)?;
                let asset = DependencyAsset::new(name, source, &sha256)?.with_decompression(decompress);
                let path = manager.resolve(&asset).await?;
                println!("{}", path.display());
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let config = load_config(cli.config.as_ref())?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse()).await
}
