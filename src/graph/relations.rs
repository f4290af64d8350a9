//! Read access to stored relations: streaming per-kind folds and
//! direction-aware upstream lookups. Edges are never held in memory as a whole.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Collection, EntityRef, Flow, KindTable, Relation, RelationKind};
use crate::db::Db;
use crate::error::{Result, RiskError};

const EDGE_COLUMNS: &str =
    "relation_id, kind, source_collection, source_key, target_collection, target_key, weight";

fn relation_from_row(row: &Row<'_>) -> Result<Relation> {
    let kind: String = row.get(1)?;
    let source_collection: String = row.get(2)?;
    let target_collection: String = row.get(4)?;
    Ok(Relation {
        relation_id: row.get(0)?,
        kind: RelationKind::from_label(&kind)?,
        source: EntityRef::new(source_collection.parse::<Collection>()?, row.get::<_, String>(3)?),
        target: EntityRef::new(target_collection.parse::<Collection>()?, row.get::<_, String>(5)?),
        weight: row.get(6)?,
    })
}

/// One step from a node toward a neighbor that passes risk to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub relation_id: i64,
    pub kind: RelationKind,
    /// Effective weight; `None` when the stored weight is invalid
    pub weight: Option<f64>,
    pub neighbor: EntityRef,
    /// Neighbor's direct risk; `None` when the neighbor is not in the store
    pub neighbor_direct_risk: Option<f64>,
}

/// Upstream neighbors of one node.
#[derive(Debug, Default)]
pub struct Upstream {
    pub hops: Vec<Hop>,
    /// Relations from the node to itself; never returned as hops
    pub self_loops: Vec<i64>,
    /// More edges existed than the fan-out cap allowed
    pub truncated: bool,
}

/// Typed, directed adjacency over the `relations` table.
#[derive(Debug, Clone)]
pub struct RelationGraph {
    db: Db,
    table: KindTable,
}

impl RelationGraph {
    pub fn new(db: Db, table: KindTable) -> Self {
        Self { db, table }
    }

    pub fn table(&self) -> &KindTable {
        &self.table
    }

    /// Store relations in one transaction; returns their assigned ids.
    pub async fn insert_relations(&self, relations: Vec<Relation>) -> Result<Vec<i64>> {
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let mut ids = Vec::with_capacity(relations.len());
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO relations (kind, source_collection, source_key, \
                             target_collection, target_key, weight) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for rel in &relations {
                        stmt.execute(params![
                            rel.kind.label(),
                            rel.source.collection.as_str(),
                            rel.source.key,
                            rel.target.collection.as_str(),
                            rel.target.key,
                            rel.weight,
                        ])?;
                        ids.push(tx.last_insert_rowid());
                    }
                }
                tx.commit()?;
                Ok(ids)
            })
            .await
    }

    pub async fn get(&self, relation_id: i64) -> Result<Option<Relation>> {
        self.db
            .with_connection(move |conn| {
                let sql = format!("SELECT {} FROM relations WHERE relation_id = ?1", EDGE_COLUMNS);
                let row = conn
                    .query_row(&sql, params![relation_id], |row| Ok(relation_from_row(row)))
                    .optional()?;
                row.transpose()
            })
            .await
    }

    /// Edge counts per kind, in `RelationKind::ALL` order.
    pub async fn count_by_kind(&self) -> Result<Vec<(RelationKind, u64)>> {
        self.db
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT COUNT(*) FROM relations WHERE kind = ?1")?;
                let mut out = Vec::new();
                for kind in RelationKind::ALL {
                    let n: i64 = stmt.query_row(params![kind.label()], |row| row.get(0))?;
                    out.push((kind, n as u64));
                }
                Ok(out)
            })
            .await
    }

    /// Fold every edge of one kind through `f`, streaming rows from a cursor.
    pub async fn fold_edges<A, F>(&self, kind: RelationKind, init: A, mut f: F) -> Result<A>
    where
        A: Send + 'static,
        F: FnMut(A, Relation) -> A + Send + 'static,
    {
        self.db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM relations WHERE kind = ?1 ORDER BY relation_id",
                    EDGE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![kind.label()])?;
                let mut acc = init;
                while let Some(row) = rows.next()? {
                    acc = f(acc, relation_from_row(row)?);
                }
                Ok(acc)
            })
            .await
    }

    /// Run `f` against a [`Traversal`] bound to one connection, off the async runtime.
    pub async fn with_traversal<F, T>(&self, max_fan_out: usize, f: F) -> Result<T>
    where
        F: FnOnce(&Traversal<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if max_fan_out == 0 {
            return Err(RiskError::InvalidInput("max_fan_out must be greater than 0".to_string()));
        }
        let table = self.table.clone();
        self.db
            .with_connection(move |conn| {
                let traversal = Traversal {
                    conn,
                    table,
                    max_fan_out,
                };
                f(&traversal)
            })
            .await
    }
}

/// Synchronous, connection-bound neighbor queries for path enumeration.
pub struct Traversal<'c> {
    conn: &'c Connection,
    table: KindTable,
    max_fan_out: usize,
}

/// Node is the target; the neighbor is the edge source.
const UPSTREAM_BY_TARGET: &str = "\
    SELECT r.relation_id, r.weight, r.source_collection, r.source_key, e.direct_risk \
    FROM relations r \
    LEFT JOIN entities e ON e.collection = r.source_collection AND e.entity_key = r.source_key \
    WHERE r.target_collection = ?1 AND r.target_key = ?2 AND r.kind = ?3 \
      AND NOT (r.source_collection = ?1 AND r.source_key = ?2) \
    ORDER BY r.relation_id LIMIT ?4";

/// Node is the source; the neighbor is the edge target.
const UPSTREAM_BY_SOURCE: &str = "\
    SELECT r.relation_id, r.weight, r.target_collection, r.target_key, e.direct_risk \
    FROM relations r \
    LEFT JOIN entities e ON e.collection = r.target_collection AND e.entity_key = r.target_key \
    WHERE r.source_collection = ?1 AND r.source_key = ?2 AND r.kind = ?3 \
      AND NOT (r.target_collection = ?1 AND r.target_key = ?2) \
    ORDER BY r.relation_id LIMIT ?4";

/// Relations of one kind from a node to itself.
const SELF_LOOPS: &str = "\
    SELECT relation_id FROM relations \
    WHERE source_collection = ?1 AND source_key = ?2 \
      AND target_collection = ?1 AND target_key = ?2 AND kind = ?3 \
    ORDER BY relation_id";

impl<'c> Traversal<'c> {
    /// Edges of `kinds` on which `node` is the receiving end, i.e. the
    /// direction risk arrives from. Capped at `max_fan_out` hops.
    /// Self-loops are listed separately, once each.
    pub fn upstream(&self, node: &EntityRef, kinds: &[RelationKind]) -> Result<Upstream> {
        let mut out = Upstream::default();
        for &kind in kinds {
            out.self_loops.extend(self.query_self_loops(node, kind)?);
        }
        for &kind in kinds {
            let queries: &[&str] = match self.table.rule(kind).flow {
                Flow::SourceToTarget => &[UPSTREAM_BY_TARGET],
                Flow::TargetToSource => &[UPSTREAM_BY_SOURCE],
                Flow::Both => &[UPSTREAM_BY_TARGET, UPSTREAM_BY_SOURCE],
            };
            for sql in queries {
                let remaining = self.max_fan_out.saturating_sub(out.hops.len());
                if remaining == 0 {
                    out.truncated = true;
                    return Ok(out);
                }
                let found = self.query_hops(sql, node, kind, remaining + 1)?;
                if found.len() > remaining {
                    out.hops.extend(found.into_iter().take(remaining));
                    out.truncated = true;
                    return Ok(out);
                }
                out.hops.extend(found);
            }
        }
        Ok(out)
    }

    fn query_self_loops(&self, node: &EntityRef, kind: RelationKind) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(SELF_LOOPS)?;
        let ids = stmt
            .query_map(params![node.collection.as_str(), node.key, kind.label()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, rusqlite::Error>>()?;
        Ok(ids)
    }

    fn query_hops(
        &self,
        sql: &str,
        node: &EntityRef,
        kind: RelationKind,
        limit: usize,
    ) -> Result<Vec<Hop>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params![
            node.collection.as_str(),
            node.key,
            kind.label(),
            limit as i64
        ])?;
        let mut hops = Vec::new();
        while let Some(row) = rows.next()? {
            let collection: String = row.get(2)?;
            let neighbor_key: String = row.get(3)?;
            let explicit: Option<f64> = row.get(1)?;
            hops.push(Hop {
                relation_id: row.get(0)?,
                kind,
                weight: self.table.resolve_weight(kind, explicit),
                neighbor: EntityRef::new(collection.parse::<Collection>()?, neighbor_key),
                neighbor_direct_risk: row.get(4)?,
            });
        }
        Ok(hops)
    }
}
