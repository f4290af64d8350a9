use anyhow::Result;
use clap::{Parser, ValueEnum};
use riskprop::db::migrate;
use riskprop::risk::ledger::RunLedger;
use riskprop::risk::max_propagation::MaxPropagationEngine;
use riskprop::risk::path_accumulation::PathAccumulationEngine;
use riskprop::risk::summary::RiskSummary;
use riskprop::risk::{execute, Engine};
use riskprop::{Config, EntityStore, RelationGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EngineArg {
    /// Strongest inbound path, iterated for a round budget
    Max,
    /// Sum over every path up to a depth limit
    Path,
}

#[derive(Parser)]
#[command(name = "propagate")]
#[command(about = "Compute inferred risk with one propagation strategy", long_about = None)]
struct Args {
    /// Strategy to run
    #[arg(short, long, value_enum)]
    engine: EngineArg,

    /// Round budget for the max engine (overrides propagation.rounds)
    #[arg(short, long)]
    rounds: Option<usize>,

    /// Depth limit for the path engine (overrides paths.max_depth)
    #[arg(short = 'd', long)]
    max_depth: Option<usize>,

    /// Run every round even after a fixpoint is reached
    #[arg(long)]
    no_fixpoint_exit: bool,

    /// Report existing scores without recomputing
    #[arg(long)]
    dry_run: bool,

    /// Print output as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Reject flags that belong to the other engine.
    fn check_engine_flags(&self) -> Result<()> {
        match self.engine {
            EngineArg::Path if self.rounds.is_some() => {
                anyhow::bail!(
                    "--rounds only applies to --engine max; use --max-depth for the path engine"
                )
            }
            EngineArg::Path if self.no_fixpoint_exit => {
                anyhow::bail!("--no-fixpoint-exit only applies to --engine max")
            }
            EngineArg::Max if self.max_depth.is_some() => {
                anyhow::bail!(
                    "--max-depth only applies to --engine path; use --rounds for the max engine"
                )
            }
            _ => Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let args = Args::parse();
    args.check_engine_flags()?;
    let config = Config::load()?;

    let db = config.open_db();
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;

    let store = EntityStore::new(db.clone(), config.store_settings())?;

    if args.dry_run {
        log::info!("Dry run: reading existing scores only");
        let summary = RiskSummary::load(&store).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        } else {
            println!("\n=== Stored risk scores ({} entities) ===\n", summary.total_entities());
            println!("{}", summary);
        }
        return Ok(());
    }

    let graph = RelationGraph::new(db.clone(), config.kind_table());
    let engine = match args.engine {
        EngineArg::Max => {
            let mut settings = config.max_propagation_settings();
            if let Some(rounds) = args.rounds {
                settings.rounds = rounds;
            }
            if args.no_fixpoint_exit {
                settings.stop_at_fixpoint = false;
            }
            Engine::Max(MaxPropagationEngine::new(store, graph, settings)?)
        }
        EngineArg::Path => {
            let mut settings = config.path_settings();
            if let Some(depth) = args.max_depth {
                settings.max_depth = depth;
            }
            Engine::Path(PathAccumulationEngine::new(store, graph, settings)?)
        }
    };

    let ledger = RunLedger::new(db);
    let report = execute(&engine, &ledger, config.reporting.max_skipped).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
