use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use crate::error::{Result, RiskError};

/// One `NNN_name.sql` file
#[derive(Debug)]
struct Migration {
    version: u32,
    name: String,
    sql: String,
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Names of applied migrations, in version order
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

/// "003_risk_runs.sql" -> (3, "003_risk_runs")
fn parse_migration_filename(filename: &str) -> Result<(u32, String)> {
    let stem = filename
        .strip_suffix(".sql")
        .ok_or_else(|| RiskError::Config(format!("Not a migration file: {}", filename)))?;
    let version_str = stem
        .split('_')
        .next()
        .ok_or_else(|| RiskError::Config(format!("Invalid migration filename: {}", filename)))?;
    let version = version_str
        .parse()
        .map_err(|_| RiskError::Config(format!("Invalid migration version: {}", version_str)))?;
    Ok((version, stem.to_string()))
}

fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();
    let mut seen = HashSet::new();

    for entry in fs::read_dir(migrations_dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("sql") {
            continue;
        }
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RiskError::Config("Invalid migration filename".to_string()))?;

        let (version, name) = parse_migration_filename(filename)?;
        if !seen.insert(version) {
            return Err(RiskError::Config(format!(
                "Duplicate migration version {} in {}",
                version,
                migrations_dir.display()
            )));
        }

        let sql = fs::read_to_string(&path)?;
        migrations.push(Migration { version, name, sql });
    }

    migrations.sort_by_key(|m| m.version);
    Ok(migrations)
}

/// Run all pending migrations, each in its own transaction
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;
    let pending: Vec<Migration> = load_migrations(migrations_dir)?
        .into_iter()
        .filter(|m| !applied.contains(&m.name))
        .collect();

    if pending.is_empty() {
        log::debug!("Schema up to date ({} migrations)", applied.len());
        return Ok(());
    }

    for migration in pending {
        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            RiskError::Config(format!("Failed to execute migration {}: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    log::info!("All migrations completed");
    Ok(())
}
