//! `strata-graft`: graft the contents of SQLite changeset databases onto a
//! repository through the gateway.

mod driver;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-graft")]
#[command(about = "Graft the contents of SQLite changeset databases onto a repository")]
#[command(version)]
struct Args {
    /// Input graft database file, or a directory scanned for *.db
    #[arg(short = 'D', value_name = "PATH")]
    input: Option<PathBuf>,

    /// Fully qualified repository name
    #[arg(short = 'N', value_name = "REPO")]
    repo_name: Option<String>,

    /// Gateway base URL (default: client configuration)
    #[arg(short = 'g', value_name = "URL")]
    gateway_url: Option<String>,

    /// Stratum-0 base URL (default: client configuration)
    #[arg(short = 'w', value_name = "URL")]
    stratum0: Option<String>,

    /// Temporary directory (default: $TMPDIR)
    #[arg(short = 't', value_name = "DIR")]
    temp_dir: Option<PathBuf>,

    /// Lease path (default: longest common prefix of all affected paths)
    #[arg(short = 'l', value_name = "PATH")]
    lease_path: Option<String>,

    /// Prefix to add to the lease and to all grafted paths
    #[arg(short = 'p', value_name = "PREFIX")]
    additional_prefix: Option<String>,

    /// Allow deletions
    #[arg(short = 'd')]
    allow_deletions: bool,

    /// Allow additions (implied unless -d is given alone)
    #[arg(short = 'a')]
    allow_additions: bool,

    /// Force cancellation of a stale lease
    #[arg(short = 'x')]
    force_cancel_lease: bool,

    /// Create an empty graft database with the canonical schema and exit
    #[arg(short = 'n', value_name = "FILE")]
    new_db: Option<PathBuf>,

    /// Create missing nested catalogs
    #[arg(short = 'z')]
    create_missing_catalogs: bool,

    /// Check and set the completed_graft property
    #[arg(short = 'Z')]
    check_completed_graft: bool,

    /// Commit priority (default: negated unix timestamp)
    #[arg(short = 'P', value_name = "PRIORITY")]
    priority: Option<i64>,

    /// Lease-busy retry interval in seconds
    #[arg(short = 'r', value_name = "SECONDS")]
    retry_interval: Option<u64>,

    /// Client configuration directory prefix
    #[arg(short = 'C', value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Gateway key file (default: client configuration)
    #[arg(short = 's', value_name = "FILE")]
    key_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(file) = &args.new_db {
        strata_graft::db::create_empty(file).await?;
        return Ok(());
    }

    driver::run(args).await
}
