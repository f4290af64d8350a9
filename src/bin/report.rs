use anyhow::Result;
use clap::Parser;
use riskprop::db::migrate;
use riskprop::risk::ledger::RunLedger;
use riskprop::risk::summary::RiskSummary;
use riskprop::{Config, EntityStore};

#[derive(Parser)]
#[command(name = "report")]
#[command(
    about = "Report stored risk scores and recent runs without recomputing",
    long_about = None
)]
struct Args {
    /// Number of highest-risk entities to list
    #[arg(short, long, default_value_t = 20)]
    top: usize,

    /// Number of recent runs to list
    #[arg(short, long, default_value_t = 10)]
    runs: usize,
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

    let store = EntityStore::new(db.clone(), config.store_settings())?;
    let ledger = RunLedger::new(db);

    let summary = RiskSummary::load(&store).await?;
    println!("\n=== Risk Score Distribution ({} entities) ===\n", summary.total_entities());
    println!("{}", summary);

    let top = store.top_by_inferred(args.top).await?;
    println!("\nTop {} entities by inferred risk:\n", args.top);
    if top.is_empty() {
        println!("No entity has inferred risk yet. Run `direct` then `propagate`.");
    } else {
        println!("{:-<96}", "");
        println!(
            "{:<28} {:<30} {:>8} {:>10}  {}",
            "Entity", "Name", "Direct", "Inferred", "Method"
        );
        println!("{:-<96}", "");
        for entity in &top {
            let name = entity.name.as_deref().unwrap_or("-");
            let name: String = name.chars().take(30).collect();
            let method = entity.risk_method.map(|m| m.as_str()).unwrap_or("-");
            println!(
                "{:<28} {:<30} {:>8.3} {:>10.3}  {}",
                entity.id.to_string(),
                name,
                entity.direct_risk,
                entity.inferred_risk,
                method
            );
        }
        println!("{:-<96}", "");
    }

    let runs = ledger.recent(args.runs).await?;
    println!("\nRecent runs:\n");
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    println!("{:-<112}", "");
    println!(
        "{:<26} {:<18} {:>6} {:>6} {:>9} {:>9} {:>8}  {}",
        "Started", "Method", "Budget", "Rounds", "Converged", "Updated", "Skipped", "Status"
    );
    println!("{:-<112}", "");
    for run in &runs {
        let converged = match run.converged {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        let status = match &run.error {
            Some(error) => format!("{} ({})", run.status, error),
            None => run.status.to_string(),
        };
        println!(
            "{:<26} {:<18} {:>6} {:>6} {:>9} {:>9} {:>8}  {}",
            run.started_at.chars().take(26).collect::<String>(),
            run.method.as_str(),
            run.budget,
            run.rounds_executed,
            converged,
            run.entities_updated,
            run.skipped.total(),
            status
        );
    }
    println!("{:-<112}", "");

    Ok(())
}
