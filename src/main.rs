use clap::{Parser, Subcommand};
use exn::ResultExt;
use kura::error::{ErrorKind, Result};
use kura::{Config, Headers, ImageCache, OwnerId};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Inspect and manage the kura image cache.
#[derive(Debug, Parser)]
#[command(name = "kura", version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON). Environment variables
    /// prefixed KURA_ override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the cached path of a page image, downloading it if needed
    Asset {
        url: String,
        /// Owner to link the asset to, as collection:item
        #[arg(long, value_parser = parse_owner)]
        owner: Option<OwnerId>,
        /// Extra request header, as "Name: value"
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// Print the cached path of a cover, downloading it if needed
    Cover {
        url: String,
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// Show disk usage of the asset cache
    Usage,
    /// Show recorded usage per owner
    Owners,
    /// Run an eviction pass now
    Evict {
        /// Change the size limit (bytes) before evicting
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Delete cached images
    Clear {
        /// Only delete assets linked to this owner
        #[arg(long, value_parser = parse_owner)]
        owner: Option<OwnerId>,
    },
}

fn parse_owner(value: &str) -> std::result::Result<OwnerId, String> {
    value.parse::<OwnerId>().map_err(|e| (*e).to_string())
}

fn parse_header(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim().to_string(), value.trim().to_string())),
        _ => Err(format!("expected \"Name: value\", got {value:?}")),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cache: &ImageCache, command: Command) -> Result<()> {
    match command {
        Command::Asset { url, owner, headers } => {
            let path = match cache.get_cached_asset_path(&url).await? {
                Some(path) => path,
                None => cache.fetch_and_store_asset(&url, &headers.into_iter().collect(), owner.as_ref()).await?,
            };
            println!("{}", path.display());
        },
        Command::Cover { url, headers } => {
            let headers: Headers = headers.into_iter().collect();
            let path = match cache.get_cached_cover_path(&url).await? {
                Some(path) => path,
                None => cache.fetch_and_store_cover(&url, &headers).await?,
            };
            println!("{}", path.display());
        },
        Command::Usage => {
            let used = cache.current_usage_bytes().await?;
            let limit = cache.cache_limit();
            println!("Used:  {used} bytes");
            println!("Limit: {limit} bytes");
        },
        Command::Owners => {
            for usage in cache.owner_usage().await? {
                println!("{:<40} {:>6} assets {:>12} bytes", usage.owner, usage.assets, usage.size_bytes);
            }
        },
        Command::Evict { limit } => {
            if let Some(limit) = limit {
                cache.set_cache_limit(limit);
            }
            let report = cache.evict_now().await?;
            println!(
                "Deleted {} files, freed {} bytes ({} -> {} bytes)",
                report.files_deleted, report.bytes_freed, report.size_before, report.size_after
            );
        },
        Command::Clear { owner: Some(owner) } => {
            let removed = cache.clear_for_owner(&owner).await?;
            println!("Removed {removed} assets for {owner}");
        },
        Command::Clear { owner: None } => {
            cache.clear_all().await?;
            println!("Cleared all cached images");
        },
    }
    Ok(())
}

async fn open(config: Option<PathBuf>) -> Result<ImageCache> {
    let config = Config::load(config.as_deref()).or_raise(|| ErrorKind::Config)?;
    ImageCache::open(&config).await
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let cache = match open(cli.config).await {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Error: {e:?}");
            return ExitCode::FAILURE;
        },
    };
    let result = run(&cache, cli.command).await;
    cache.close().await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}
