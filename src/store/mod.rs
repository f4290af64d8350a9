//! Entity risk fields: batched, retried reads and writes.
//!
//! Writes never fail on a missing entity; rows that no longer exist are
//! reported back as `missing` so callers can count them.

pub mod retry;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;

use crate::db::Db;
use crate::error::{Result, RiskError};
use crate::graph::{Collection, EntityRef};
use crate::risk::RiskMethod;
use retry::{retry_with_backoff, RetryPolicy};

/// Batch size and retry policy for store writes.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            retry: RetryPolicy::default(),
        }
    }
}

/// A screened party with its risk fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: EntityRef,
    pub name: Option<String>,
    pub direct_risk: f64,
    pub inferred_risk: f64,
    pub risk_method: Option<RiskMethod>,
    pub risk_updated_at: Option<String>,
}

impl Entity {
    pub fn new(id: EntityRef, name: Option<String>) -> Self {
        Self {
            id,
            name,
            direct_risk: 0.0,
            inferred_risk: 0.0,
            risk_method: None,
            risk_updated_at: None,
        }
    }

    /// Seed direct risk; inferred risk starts equal to it.
    pub fn with_direct_risk(mut self, risk: f64) -> Self {
        self.direct_risk = risk;
        self.inferred_risk = risk;
        self
    }
}

fn entity_from_row(row: &Row<'_>) -> Result<Entity> {
    let collection: String = row.get(0)?;
    let method: Option<String> = row.get(5)?;
    Ok(Entity {
        id: EntityRef::new(collection.parse::<Collection>()?, row.get::<_, String>(1)?),
        name: row.get(2)?,
        direct_risk: row.get(3)?,
        inferred_risk: row.get(4)?,
        risk_method: method.as_deref().map(str::parse::<RiskMethod>).transpose()?,
        risk_updated_at: row.get(6)?,
    })
}

const ENTITY_COLUMNS: &str =
    "collection, entity_key, name, direct_risk, inferred_risk, risk_method, risk_updated_at";

/// Rows written vs. rows whose entity was not found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub written: usize,
    pub missing: usize,
}

impl WriteOutcome {
    fn add(&mut self, other: WriteOutcome) {
        self.written += other.written;
        self.missing += other.missing;
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    RaiseDirect,
    RaiseInferred(RiskMethod),
    OverwriteInferred(RiskMethod),
}

impl WriteMode {
    fn operation(&self) -> &'static str {
        match self {
            WriteMode::RaiseDirect => "raise_direct_risk",
            WriteMode::RaiseInferred(_) => "raise_inferred",
            WriteMode::OverwriteInferred(_) => "write_inferred",
        }
    }

    /// Raises are a single MAX() statement so concurrent writers cannot lose an update.
    fn sql(&self) -> &'static str {
        match self {
            WriteMode::RaiseDirect => {
                "UPDATE entities SET direct_risk = MAX(direct_risk, ?1) \
                 WHERE collection = ?2 AND entity_key = ?3"
            }
            WriteMode::RaiseInferred(_) => {
                "UPDATE entities SET inferred_risk = MAX(inferred_risk, ?1), \
                     risk_method = ?4, risk_updated_at = ?5 \
                 WHERE collection = ?2 AND entity_key = ?3"
            }
            WriteMode::OverwriteInferred(_) => {
                "UPDATE entities SET inferred_risk = ?1, risk_method = ?4, risk_updated_at = ?5 \
                 WHERE collection = ?2 AND entity_key = ?3"
            }
        }
    }

    fn method(&self) -> Option<RiskMethod> {
        match self {
            WriteMode::RaiseDirect => None,
            WriteMode::RaiseInferred(m) | WriteMode::OverwriteInferred(m) => Some(*m),
        }
    }
}

/// Read/write access to entity records keyed by `(collection, key)`.
#[derive(Debug, Clone)]
pub struct EntityStore {
    db: Db,
    settings: StoreSettings,
}

impl EntityStore {
    pub fn new(db: Db, settings: StoreSettings) -> Result<Self> {
        if settings.batch_size == 0 {
            return Err(RiskError::InvalidInput("batch_size must be greater than 0".to_string()));
        }
        Ok(Self { db, settings })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Insert or replace entities. Seeding only; ingestion proper lives elsewhere.
    pub async fn upsert_entities(&self, entities: Vec<Entity>) -> Result<usize> {
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO entities \
                             (collection, entity_key, name, direct_risk, inferred_risk) \
                         VALUES (?1, ?2, ?3, ?4, ?5) \
                         ON CONFLICT(collection, entity_key) DO UPDATE SET \
                             name = excluded.name, \
                             direct_risk = excluded.direct_risk, \
                             inferred_risk = excluded.inferred_risk",
                    )?;
                    for e in &entities {
                        stmt.execute(params![
                            e.id.collection.as_str(),
                            e.id.key,
                            e.name,
                            e.direct_risk,
                            e.inferred_risk,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(entities.len())
            })
            .await
    }

    pub async fn get(&self, id: &EntityRef) -> Result<Option<Entity>> {
        let id = id.clone();
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM entities WHERE collection = ?1 AND entity_key = ?2",
                    ENTITY_COLUMNS
                );
                conn.query_row(&sql, params![id.collection.as_str(), id.key], |row| {
                    Ok(entity_from_row(row))
                })
                .optional()?
                .transpose()
            })
            .await
    }

    pub async fn count(&self) -> Result<u64> {
        self.db
            .with_connection(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
                Ok(n as u64)
            })
            .await
    }

    /// Every stored entity carrying each key. A key may live in several collections.
    pub async fn resolve_keys(&self, keys: Vec<String>) -> Result<HashMap<String, Vec<EntityRef>>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT collection FROM entities WHERE entity_key = ?1")?;
                let mut resolved = HashMap::new();
                for key in keys {
                    let mut rows = stmt.query(params![key])?;
                    let mut refs = Vec::new();
                    while let Some(row) = rows.next()? {
                        let collection: String = row.get(0)?;
                        refs.push(EntityRef::new(collection.parse::<Collection>()?, key.clone()));
                    }
                    if !refs.is_empty() {
                        resolved.insert(key, refs);
                    }
                }
                Ok(resolved)
            })
            .await
    }

    /// `(key, direct_risk)` for every entity of one collection, in key order.
    pub async fn direct_risks_in(&self, collection: Collection) -> Result<Vec<(String, f64)>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT entity_key, direct_risk FROM entities \
                     WHERE collection = ?1 ORDER BY entity_key",
                )?;
                let rows = stmt
                    .query_map(params![collection.as_str()], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
    }

    /// Current inferred risk of every entity.
    pub async fn inferred_snapshot(&self) -> Result<HashMap<EntityRef, f64>> {
        self.db
            .with_connection(|conn| {
                let mut stmt =
                    conn.prepare("SELECT collection, entity_key, inferred_risk FROM entities")?;
                let mut rows = stmt.query([])?;
                let mut snapshot = HashMap::new();
                while let Some(row) = rows.next()? {
                    let collection: String = row.get(0)?;
                    snapshot.insert(
                        EntityRef::new(collection.parse::<Collection>()?, row.get::<_, String>(1)?),
                        row.get::<_, f64>(2)?,
                    );
                }
                Ok(snapshot)
            })
            .await
    }

    /// Start of a full recomputation: `inferred_risk = direct_risk` everywhere.
    pub async fn reset_inferred(&self, method: RiskMethod) -> Result<usize> {
        let db = self.db.clone();
        retry_with_backoff(&self.settings.retry, "reset_inferred", || {
            let db = db.clone();
            async move {
                db.with_connection(move |conn| {
                    let n = conn.execute(
                        "UPDATE entities \
                         SET inferred_risk = direct_risk, risk_method = ?1, risk_updated_at = ?2",
                        params![method.as_str(), Utc::now().to_rfc3339()],
                    )?;
                    Ok(n)
                })
                .await
            }
        })
        .await
    }

    /// `direct_risk = max(direct_risk, score)` per entity.
    pub async fn raise_direct_risk(&self, updates: Vec<(EntityRef, f64)>) -> Result<WriteOutcome> {
        self.write_batches(WriteMode::RaiseDirect, updates).await
    }

    /// `inferred_risk = max(inferred_risk, candidate)`, stamped with `method`.
    pub async fn raise_inferred(
        &self,
        updates: Vec<(EntityRef, f64)>,
        method: RiskMethod,
    ) -> Result<WriteOutcome> {
        self.write_batches(WriteMode::RaiseInferred(method), updates).await
    }

    /// `inferred_risk = score`, stamped with `method`.
    pub async fn write_inferred(
        &self,
        updates: Vec<(EntityRef, f64)>,
        method: RiskMethod,
    ) -> Result<WriteOutcome> {
        self.write_batches(WriteMode::OverwriteInferred(method), updates).await
    }

    /// Highest inferred risk first.
    pub async fn top_by_inferred(&self, limit: usize) -> Result<Vec<Entity>> {
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM entities WHERE inferred_risk > 0 \
                     ORDER BY inferred_risk DESC, collection, entity_key LIMIT ?1",
                    ENTITY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(entity_from_row(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// One transaction per batch; each batch retried as a unit.
    async fn write_batches(
        &self,
        mode: WriteMode,
        updates: Vec<(EntityRef, f64)>,
    ) -> Result<WriteOutcome> {
        let mut outcome = WriteOutcome::default();
        for chunk in updates.chunks(self.settings.batch_size) {
            let batch = chunk.to_vec();
            let db = self.db.clone();
            let written = retry_with_backoff(&self.settings.retry, mode.operation(), || {
                let db = db.clone();
                let batch = batch.clone();
                async move { db.with_connection(move |conn| apply_batch(conn, mode, &batch)).await }
            })
            .await?;
            log::debug!(
                "{}: batch of {} ({} written, {} missing)",
                mode.operation(),
                chunk.len(),
                written.written,
                written.missing
            );
            outcome.add(written);
        }
        Ok(outcome)
    }
}

fn apply_batch(
    conn: &mut rusqlite::Connection,
    mode: WriteMode,
    batch: &[(EntityRef, f64)],
) -> Result<WriteOutcome> {
    let now = Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    let mut outcome = WriteOutcome::default();
    {
        let mut stmt = tx.prepare(mode.sql())?;
        for (id, value) in batch {
            let changed = match mode.method() {
                None => stmt.execute(params![value, id.collection.as_str(), id.key])?,
                Some(method) => stmt.execute(params![
                    value,
                    id.collection.as_str(),
                    id.key,
                    method.as_str(),
                    now
                ])?,
            };
            if changed == 0 {
                outcome.missing += 1;
            } else {
                outcome.written += 1;
            }
        }
    }
    tx.commit()?;
    Ok(outcome)
}
