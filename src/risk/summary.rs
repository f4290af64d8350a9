//! Read-only view of the scores currently stored. Never recomputes anything.

use rusqlite::params;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::RiskMethod;
use crate::error::Result;
use crate::graph::Collection;
use crate::store::EntityStore;

/// Score distribution for one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub collection: String,
    pub entities: u64,
    pub with_direct_risk: u64,
    /// Inferred risk above direct risk
    pub raised_by_inference: u64,
    pub avg_direct_risk: f64,
    pub avg_inferred_risk: f64,
    pub max_inferred_risk: f64,
    /// Entity counts per method that last wrote the inferred score; `unscored` when none has
    pub methods: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RiskSummary {
    pub collections: Vec<CollectionSummary>,
}

impl RiskSummary {
    pub async fn load(store: &EntityStore) -> Result<Self> {
        store
            .db()
            .with_connection(|conn| {
                let mut totals = conn.prepare(
                    "SELECT COUNT(*), \
                            COALESCE(SUM(direct_risk > 0), 0), \
                            COALESCE(SUM(inferred_risk > direct_risk), 0), \
                            COALESCE(AVG(direct_risk), 0.0), \
                            COALESCE(AVG(inferred_risk), 0.0), \
                            COALESCE(MAX(inferred_risk), 0.0) \
                     FROM entities WHERE collection = ?1",
                )?;
                let mut methods = conn.prepare(
                    "SELECT risk_method, COUNT(*) FROM entities \
                     WHERE collection = ?1 GROUP BY risk_method",
                )?;

                let mut collections = Vec::new();
                for collection in Collection::ALL {
                    let mut summary = totals.query_row(params![collection.as_str()], |row| {
                        Ok(CollectionSummary {
                            collection: collection.as_str().to_string(),
                            entities: row.get::<_, i64>(0)? as u64,
                            with_direct_risk: row.get::<_, i64>(1)? as u64,
                            raised_by_inference: row.get::<_, i64>(2)? as u64,
                            avg_direct_risk: row.get(3)?,
                            avg_inferred_risk: row.get(4)?,
                            max_inferred_risk: row.get(5)?,
                            methods: BTreeMap::new(),
                        })
                    })?;
                    let mut rows = methods.query(params![collection.as_str()])?;
                    while let Some(row) = rows.next()? {
                        let method: Option<String> = row.get(0)?;
                        let label = match method {
                            Some(m) => m.parse::<RiskMethod>()?.as_str().to_string(),
                            None => "unscored".to_string(),
                        };
                        summary.methods.insert(label, row.get::<_, i64>(1)? as u64);
                    }
                    collections.push(summary);
                }
                Ok(RiskSummary { collections })
            })
            .await
    }

    pub fn total_entities(&self) -> u64 {
        self.collections.iter().map(|c| c.entities).sum()
    }
}

impl fmt::Display for RiskSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:-<96}", "")?;
        writeln!(
            f,
            "{:<14} {:>10} {:>10} {:>10} {:>10} {:>12} {:>10}  {}",
            "Collection",
            "Entities",
            "Direct>0",
            "Raised",
            "Avg dir",
            "Avg inferred",
            "Max inf",
            "Methods"
        )?;
        writeln!(f, "{:-<96}", "")?;
        for c in &self.collections {
            let methods = c
                .methods
                .iter()
                .map(|(m, n)| format!("{}={}", m, n))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "{:<14} {:>10} {:>10} {:>10} {:>10.3} {:>12.3} {:>10.3}  {}",
                c.collection,
                c.entities,
                c.with_direct_risk,
                c.raised_by_inference,
                c.avg_direct_risk,
                c.avg_inferred_risk,
                c.max_inferred_risk,
                methods
            )?;
        }
        write!(f, "{:-<96}", "")
    }
}
