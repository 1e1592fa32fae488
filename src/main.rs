use anyhow::Result;
use clap::Parser;
use sentinel_fetch::baseline::select_latest;
use sentinel_fetch::catalog;
use sentinel_fetch::download_plan::{DownloadEndpoint, DownloadPlan};
use sentinel_fetch::retry::RetryPolicy;
use sentinel_fetch::selection::{self, Selection};
use sentinel_fetch::token::{TokenEndpoint, TokenManager};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Fetch the latest processing baseline of each Sentinel-2 acquisition from the
/// Copernicus Data Space catalog.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Selection TOML. The built-in T33SVB query is used when omitted.
    #[arg(long)]
    selection: Option<PathBuf>,

    /// Overrides the selection's download directory. Not allowed with `--plan`, whose
    /// tasks already carry their output paths.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Execute an existing download plan instead of querying the catalog
    #[arg(long, conflicts_with_all = ["plan_only", "download_dir"])]
    plan: Option<PathBuf>,

    /// Write download_plan.json and stop
    #[arg(long)]
    plan_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut selection = match &args.selection {
        Some(path) => Selection::read(path)?,
        None => Selection::from_template(&selection::selection_toml())?,
    };
    if let Some(dir) = args.download_dir {
        selection.download_dir = dir;
    }

    let client = reqwest::Client::builder()
        .connect_timeout(selection.timeout())
        .read_timeout(selection.timeout())
        .build()?;

    let plan = match &args.plan {
        Some(path) => DownloadPlan::read(path)?,
        None => {
            info!(id = %selection.id, "Fetching products");
            let listing = catalog::fetch_products(
                &client,
                &selection.endpoints.catalog,
                &selection.filter_expression(),
            )
            .await;
            if let Some(e) = &listing.interrupted {
                warn!(error = %e, "Continuing with a partial catalog listing");
            }

            let products = select_latest(listing.products);
            info!(total = products.len(), "Total products");

            fs::create_dir_all(&selection.download_dir)?;
            let plan = DownloadPlan::new(&products, &selection.download_dir);
            plan.write(selection.download_dir.join("download_plan.json"))?;
            plan
        }
    };

    if args.plan_only {
        return Ok(());
    }

    let endpoint = TokenEndpoint::new(client.clone(), &selection.endpoints);
    let mut tokens = TokenManager::connect(endpoint, &selection.credentials).await?;

    let downloads = DownloadEndpoint::new(client, &selection.endpoints);
    let policy = RetryPolicy::new(selection.max_attempts);
    let summary = plan.execute(&downloads, &mut tokens, &policy).await?;

    println!(
        "Downloaded {} of {} attempted ({} already present, {} failed)",
        summary.completed,
        summary.attempted,
        summary.skipped,
        summary.failed.len()
    );
    for failure in &summary.failed {
        println!("  {failure}");
    }

    Ok(())
}
