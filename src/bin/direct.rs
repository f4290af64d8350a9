use anyhow::{Context, Result};
use clap::Parser;
use riskprop::db::migrate;
use riskprop::risk::check_skip_threshold;
use riskprop::risk::direct::DirectRiskLoader;
use riskprop::sanctions::read_sanctions_entries;
use riskprop::{Config, EntityStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "direct")]
#[command(about = "Load direct risk from an OFAC advanced sanctions XML file", long_about = None)]
struct Args {
    /// Path to the sanctions XML (SDN_ADVANCED.XML)
    #[arg(short, long)]
    sanctions: PathBuf,

    /// Print the load report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    let config = Config::load()?;

    let db = config.open_db();
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;

    log::info!("Reading sanctions entries from {}", args.sanctions.display());
    let observations = read_sanctions_entries(&args.sanctions)?
        .collect::<riskprop::Result<Vec<_>>>()
        .with_context(|| format!("Failed to read {}", args.sanctions.display()))?;

    let store = EntityStore::new(db, config.store_settings())?;
    let loader = DirectRiskLoader::new(store, config.tier_table());
    let report = loader.load(observations).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.log_summary();
    }

    check_skip_threshold("direct risk load", report.skipped(), config.reporting.max_skipped)?;
    Ok(())
}
