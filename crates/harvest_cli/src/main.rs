//! Command-line entry point for the two-phase harvest pipeline.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use harvest_logging::harvest_info;

use harvest_core::{ConcurrencyController, ControllerConfig};
use harvest_engine::{
    ClientSettings, ControllerHandle, DiscoveryStore, FailedPageStore, HttpListingSession,
    HttpPageClient, ItemStore, ListingHarvester, ListingRules, Orchestrator, OrchestratorConfig,
    VehicleDetailExtractor,
};

const DEFAULT_ROOT_URL: &str = "https://crautos.com/autosusados/";

#[derive(Debug, Parser)]
#[command(name = "carharvest", about = "Harvests used-vehicle listings into per-item records")]
struct Cli {
    /// Base directory for discovery files and item records.
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,
    /// Enable debug logging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Duplicate log output into this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk the paginated listing and persist the discovered item URL set.
    Harvest {
        #[arg(long, default_value = DEFAULT_ROOT_URL)]
        root_url: String,
    },
    /// Re-scrape listing pages that failed during a previous harvest.
    RetryPages {
        #[arg(long, default_value = DEFAULT_ROOT_URL)]
        root_url: String,
    },
    /// Fetch detail records for a previously discovered URL set.
    Fetch {
        /// JSON array of item URLs; defaults to today's discovery file.
        #[arg(long)]
        urls_file: Option<PathBuf>,
        #[command(flatten)]
        concurrency: ConcurrencyArgs,
    },
    /// Harvest, then fetch, in one invocation.
    Run {
        #[arg(long, default_value = DEFAULT_ROOT_URL)]
        root_url: String,
        #[command(flatten)]
        concurrency: ConcurrencyArgs,
    },
}

#[derive(Debug, Args)]
struct ConcurrencyArgs {
    /// Lowest parallelism the controller may choose.
    #[arg(long, default_value_t = 1)]
    min: usize,
    /// Starting parallelism.
    #[arg(long, default_value_t = 2)]
    initial: usize,
    /// Highest parallelism the controller may choose.
    #[arg(long, default_value_t = 8)]
    max: usize,
}

/// File layout for one run date under the data directory.
struct RunPaths {
    discovery: PathBuf,
    failed_pages: PathBuf,
    records: PathBuf,
}

impl RunPaths {
    fn today(data_dir: &Path) -> Self {
        let day = Local::now().format("%d_%m_%Y").to_string();
        let base = data_dir.join(day);
        Self {
            discovery: base.join("urls.json"),
            failed_pages: base.join("failed_pages.json"),
            records: base.join("vehicles"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    harvest_logging::initialize(cli.verbose, cli.log_file.as_deref());
    let paths = RunPaths::today(&cli.data_dir);

    match cli.command {
        Command::Harvest { root_url } => {
            harvest(&root_url, &paths).await?;
        }
        Command::RetryPages { root_url } => {
            let mut harvester = listing_harvester(&root_url, &paths)?;
            let urls = harvester.retry_failed().await?;
            harvest_info!("discovery set now holds {} urls", urls.len());
        }
        Command::Fetch { urls_file, concurrency } => {
            let urls = match urls_file {
                Some(path) => load_urls(&path)?,
                None => load_urls(&paths.discovery)?,
            };
            fetch(urls, &concurrency, &paths).await?;
        }
        Command::Run { root_url, concurrency } => {
            let urls = harvest(&root_url, &paths).await?;
            fetch(urls.into_iter().collect(), &concurrency, &paths).await?;
        }
    }
    Ok(())
}

fn listing_harvester(
    root_url: &str,
    paths: &RunPaths,
) -> anyhow::Result<ListingHarvester<HttpListingSession>> {
    let settings = ClientSettings::default();
    let session = HttpListingSession::new(&settings)?;
    Ok(ListingHarvester::new(
        session,
        ListingRules::for_default_site()?,
        root_url,
        DiscoveryStore::new(paths.discovery.clone()),
        FailedPageStore::new(paths.failed_pages.clone()),
    ))
}

async fn harvest(root_url: &str, paths: &RunPaths) -> anyhow::Result<BTreeSet<String>> {
    let mut harvester = listing_harvester(root_url, paths)?;
    let urls = harvester.harvest().await?;
    harvest_info!("discovered {} item urls", urls.len());
    Ok(urls)
}

async fn fetch(
    urls: Vec<String>,
    concurrency: &ConcurrencyArgs,
    paths: &RunPaths,
) -> anyhow::Result<()> {
    let config = ControllerConfig::bounded(concurrency.min, concurrency.initial, concurrency.max)?;
    let controller = ControllerHandle::new(ConcurrencyController::new(config));
    let client = Arc::new(HttpPageClient::new(&ClientSettings::default())?);
    let orchestrator = Orchestrator::new(
        client,
        Arc::new(VehicleDetailExtractor),
        ItemStore::new(paths.records.clone()),
        controller,
        OrchestratorConfig::default(),
    );

    let summary = orchestrator.run(urls).await;
    harvest_info!(
        "run finished: {} fetched, {} failed, {} already stored, {} without id",
        summary.fetched,
        summary.failed,
        summary.skipped_existing,
        summary.invalid_url
    );
    Ok(())
}

fn load_urls(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading url file {}", path.display()))?;
    let urls: Vec<String> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing url file {}", path.display()))?;
    Ok(urls)
}
