use anyhow::Result;
use clap::{Parser, Subcommand};
use riskprop::db::{migrate, Db};
use riskprop::{Config, EntityStore, RelationGraph, RiskError};

#[derive(Parser)]
#[command(name = "riskprop")]
#[command(about = "Risk exposure propagation over a sanctions knowledge graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending migrations and verify the schema (default)
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Verify) {
        Command::Verify => run_schema_verification().await,
    }
}

async fn run_schema_verification() -> Result<()> {
    log::info!("Starting riskprop v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    log::info!("Configuration loaded successfully");
    log::info!("Database path: {}", config.db_path().display());
    log::info!(
        "Rounds: {}, path depth: {}, fixpoint exit: {}",
        config.propagation.rounds,
        config.paths.max_depth,
        config.propagation.stop_at_fixpoint
    );

    let db = config.open_db();
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;
    log::info!("Database initialized successfully");

    verify_database_schema(&db).await?;

    let store = EntityStore::new(db.clone(), config.store_settings())?;
    let graph = RelationGraph::new(db, config.kind_table());
    log::info!("Entities: {}", store.count().await?);
    for (kind, count) in graph.count_by_kind().await? {
        log::info!("Relations ({} / {}): {}", kind, kind.label(), count);
    }

    log::info!("Ready: load direct risk with `direct`, then run `propagate`");
    Ok(())
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    db.with_connection(|conn| {
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = ["entities", "relations", "risk_runs", "schema_migrations"];
        let mut all_tables_exist = true;
        for table in &expected_tables {
            if !tables.iter().any(|t| t == table) {
                log::error!("Missing table: {}", table);
                all_tables_exist = false;
            } else {
                log::debug!("Table exists: {}", table);
            }
        }
        if !all_tables_exist {
            return Err(RiskError::Config("Not all required tables exist".to_string()));
        }

        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")?;
        let indexes: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_indexes = ["idx_entities_key", "idx_relations_source", "idx_relations_target"];
        let mut all_indexes_exist = true;
        for index in &expected_indexes {
            if !indexes.iter().any(|i| i == index) {
                log::error!("Missing index: {}", index);
                all_indexes_exist = false;
            } else {
                log::debug!("Index exists: {}", index);
            }
        }
        if !all_indexes_exist {
            return Err(RiskError::Config("Not all required indexes exist".to_string()));
        }

        let applied = migrate::get_applied_migrations(conn)?;
        log::info!("Applied migrations: {}", applied.join(", "));
        Ok(())
    })
    .await?;

    log::info!("Schema verification passed");
    Ok(())
}
