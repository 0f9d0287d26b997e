use anyhow::{Context, Result};
use clap::Parser;
use corona_collector::{Collector, CollectorConfig, FileFetcher, Fetcher, HttpFetcher};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "corona-collector")]
#[command(about = "Collect municipal infection statistics into a time-series store")]
struct Args {
    /// JSON configuration file (every field optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read the payload from a local file instead of the server
    #[arg(short, long, num_args = 0..=1, default_missing_value = "query.json")]
    file: Option<PathBuf>,

    /// Archive the raw payload
    #[arg(long)]
    archive: bool,

    /// Detect and log changes without writing points
    #[arg(long)]
    no_persist: bool,

    /// Write tombstone points for removed records
    #[arg(long)]
    tombstones: bool,

    /// State file holding the last known snapshot
    #[arg(long)]
    state: Option<PathBuf>,

    /// SQLite time-series database
    #[arg(long)]
    db: Option<PathBuf>,

    /// Print the cycle result as JSON
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn resolve_config(&self) -> Result<CollectorConfig> {
        let config = match self.config {
            Some(ref path) => CollectorConfig::load(path)
                .with_context(|| format!("Failed to load configuration {}", path.display()))?,
            None => CollectorConfig::default(),
        };
        let mut config = config.apply_env();

        if self.archive {
            config.archive_enabled = true;
        }
        if self.no_persist {
            config.persistence_enabled = false;
        }
        if self.tombstones {
            config.tombstones = true;
        }
        if let Some(ref state) = self.state {
            config.state_path = state.clone();
        }
        if let Some(ref db) = self.db {
            config.db_path = db.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.resolve_config()?;

    let fetcher: Box<dyn Fetcher> = match args.file {
        Some(ref path) => {
            info!("Reading payload from {}", path.display());
            Box::new(FileFetcher::new(path.clone()))
        }
        None => Box::new(
            HttpFetcher::new(Duration::from_secs(config.request_timeout_secs))
                .context("Failed to create HTTP client")?,
        ),
    };

    let collector = Collector::from_config(&config, fetcher).context("Failed to set up collector")?;
    let result = collector.run_cycle().await.context("Collection cycle failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    if result.skipped {
        info!("Cycle skipped, another collector is running");
        return Ok(());
    }

    if !result.is_success() {
        for e in &result.errors {
            error!("{}", e);
        }
        std::process::exit(1);
    }

    Ok(())
}
