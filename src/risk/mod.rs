//! Risk scoring: direct risk from sanctions tiers, then one of two
//! inferred-risk strategies over the relation graph.
//!
//! The strategies are not interchangeable. [`RiskMethod::MaxPropagation`] keeps
//! the strongest inbound path, [`RiskMethod::PathAccumulation`] sums every path.
//! Every inferred score is stamped with the method that wrote it.

pub mod direct;
pub mod ledger;
pub mod max_propagation;
pub mod path_accumulation;
pub mod summary;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, RiskError};
use ledger::RunLedger;
use max_propagation::MaxPropagationEngine;
use path_accumulation::PathAccumulationEngine;

/// Strategy that produced an inferred score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMethod {
    MaxPropagation,
    PathAccumulation,
}

impl RiskMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskMethod::MaxPropagation => "max_propagation",
            RiskMethod::PathAccumulation => "path_accumulation",
        }
    }
}

impl FromStr for RiskMethod {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max_propagation" => Ok(RiskMethod::MaxPropagation),
            "path_accumulation" => Ok(RiskMethod::PathAccumulation),
            other => Err(RiskError::Parse(format!("Unknown risk method: {}", other))),
        }
    }
}

impl fmt::Display for RiskMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Records skipped during a run, by cause. Each edge is counted once per run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkipCounts {
    /// Edge endpoint (or write target) not in the store
    pub missing_entity: u64,
    /// Edge weight outside (0, 1]
    pub invalid_weight: u64,
    /// Entities whose path enumeration hit a fan-out or path cap
    pub truncated_paths: u64,
    /// Edges whose source and target are the same entity
    pub self_loop: u64,
}

impl SkipCounts {
    pub fn total(&self) -> u64 {
        self.missing_entity + self.invalid_weight + self.truncated_paths + self.self_loop
    }

    pub fn merge(&mut self, other: SkipCounts) {
        self.missing_entity += other.missing_entity;
        self.invalid_weight += other.invalid_weight;
        self.truncated_paths += other.truncated_paths;
        self.self_loop += other.self_loop;
    }
}

/// Fail when `skipped` exceeds the configured maximum; otherwise just warn.
pub fn check_skip_threshold(what: &str, skipped: u64, max: Option<u64>) -> Result<()> {
    if skipped == 0 {
        return Ok(());
    }
    match max {
        Some(max) if skipped > max => Err(RiskError::SkipThresholdExceeded { skipped, max }),
        _ => {
            log::warn!("{}: {} records skipped", what, skipped);
            Ok(())
        }
    }
}

/// Outcome of one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub method: RiskMethod,
    /// Round budget (max propagation) or depth limit (path accumulation)
    pub budget: usize,
    /// Rounds run; path accumulation is a single pass
    pub rounds_executed: usize,
    /// Fixpoint reached; `None` for path accumulation
    pub converged: Option<bool>,
    pub entities_updated: usize,
    pub skipped: SkipCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn start(method: RiskMethod, budget: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            method,
            budget,
            rounds_executed: 0,
            converged: None,
            entities_updated: 0,
            skipped: SkipCounts::default(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn log_summary(&self) {
        log::info!("=== {} run {} ===", self.method, self.run_id);
        log::info!("Budget: {}, rounds executed: {}", self.budget, self.rounds_executed);
        if let Some(converged) = self.converged {
            log::info!("Fixpoint reached: {}", converged);
        }
        log::info!("Entities updated: {}", self.entities_updated);
        log::info!(
            "Skipped: missing_entity={}, invalid_weight={}, truncated_paths={}, self_loop={}",
            self.skipped.missing_entity,
            self.skipped.invalid_weight,
            self.skipped.truncated_paths,
            self.skipped.self_loop
        );
        log::info!("Time: {:?}", (self.finished_at - self.started_at).to_std().unwrap_or_default());
    }
}

/// One selected strategy. Runs never mix the two.
pub enum Engine {
    Max(MaxPropagationEngine),
    Path(PathAccumulationEngine),
}

impl Engine {
    pub fn method(&self) -> RiskMethod {
        match self {
            Engine::Max(_) => RiskMethod::MaxPropagation,
            Engine::Path(_) => RiskMethod::PathAccumulation,
        }
    }

    pub fn budget(&self) -> usize {
        match self {
            Engine::Max(e) => e.settings().rounds,
            Engine::Path(e) => e.settings().max_depth,
        }
    }

    pub async fn run(&self) -> Result<RunReport> {
        match self {
            Engine::Max(e) => e.run().await,
            Engine::Path(e) => e.run().await,
        }
    }
}

/// Run `engine`, record the outcome in the ledger, then apply the skip threshold.
///
/// A failed run is recorded as `failed` and its error returned; scores it may
/// have partially written must not be reported as complete.
pub async fn execute(
    engine: &Engine,
    ledger: &RunLedger,
    max_skipped: Option<u64>,
) -> Result<RunReport> {
    let started_at = Utc::now();
    log::info!("Starting {} run (budget {})", engine.method(), engine.budget());

    match engine.run().await {
        Ok(report) => {
            report.log_summary();
            let skipped = report.skipped.total();
            if let Err(e) = check_skip_threshold(engine.method().as_str(), skipped, max_skipped) {
                ledger.record_rejected(&report, &e).await?;
                return Err(e);
            }
            ledger.record(&report).await?;
            Ok(report)
        }
        Err(e) => {
            log::error!("{} run failed: {}", engine.method(), e);
            if let Err(ledger_err) = ledger
                .record_failure(engine.method(), engine.budget(), started_at, &e)
                .await
            {
                log::error!("Could not record failed run: {}", ledger_err);
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{KindTable, Relation, RelationKind, RelationGraph};
    use crate::store::{Entity, EntityStore, StoreSettings};
    use crate::store::retry::RetryPolicy;
    use crate::test_support::{org, setup_test_db};
    use ledger::RunStatus;
    use max_propagation::MaxPropagationSettings;
    use path_accumulation::PathSettings;
    use std::time::Duration;

    #[test]
    fn test_method_labels_parse_back() {
        for m in [RiskMethod::MaxPropagation, RiskMethod::PathAccumulation] {
            assert_eq!(m.as_str().parse::<RiskMethod>().unwrap(), m);
        }
        assert!("sum".parse::<RiskMethod>().is_err());
    }

    #[test]
    fn test_skip_threshold() {
        assert!(check_skip_threshold("run", 0, Some(0)).is_ok());
        assert!(check_skip_threshold("run", 5, None).is_ok());
        assert!(check_skip_threshold("run", 5, Some(5)).is_ok());
        assert!(matches!(
            check_skip_threshold("run", 6, Some(5)),
            Err(RiskError::SkipThresholdExceeded { skipped: 6, max: 5 })
        ));
    }

    #[test]
    fn test_skip_counts_merge() {
        let mut a = SkipCounts {
            missing_entity: 1,
            invalid_weight: 2,
            truncated_paths: 0,
            self_loop: 1,
        };
        a.merge(SkipCounts {
            missing_entity: 3,
            truncated_paths: 4,
            ..SkipCounts::default()
        });
        assert_eq!(a.total(), 11);
    }

    /// Two sanctioned owners: the max strategy keeps the stronger one, the path strategy sums both.
    #[tokio::test]
    async fn test_strategies_differ_on_two_owners() {
        let (db, _temp) = setup_test_db().await;
        let store = EntityStore::new(db.clone(), StoreSettings::default()).unwrap();
        let graph = RelationGraph::new(db.clone(), KindTable::default());
        let ledger = RunLedger::new(db);

        store
            .upsert_entities(vec![
                Entity::new(org("o1"), None).with_direct_risk(0.7),
                Entity::new(org("o2"), None).with_direct_risk(1.0),
                Entity::new(org("x"), None),
            ])
            .await
            .unwrap();
        graph
            .insert_relations(vec![
                Relation::new(RelationKind::Ownership, org("x"), org("o1")),
                Relation::new(RelationKind::Ownership, org("x"), org("o2")),
            ])
            .await
            .unwrap();

        let settings = MaxPropagationSettings::default();
        let max = Engine::Max(
            MaxPropagationEngine::new(store.clone(), graph.clone(), settings).unwrap(),
        );
        let report = execute(&max, &ledger, None).await.unwrap();
        assert_eq!(report.method, RiskMethod::MaxPropagation);
        let x = store.get(&org("x")).await.unwrap().unwrap();
        assert!((x.inferred_risk - 1.0).abs() < 1e-9);
        assert_eq!(x.risk_method, Some(RiskMethod::MaxPropagation));

        let path = Engine::Path(
            PathAccumulationEngine::new(store.clone(), graph, PathSettings::default()).unwrap(),
        );
        execute(&path, &ledger, None).await.unwrap();
        let x = store.get(&org("x")).await.unwrap().unwrap();
        assert!((x.inferred_risk - 1.7).abs() < 1e-9);
        assert_eq!(x.risk_method, Some(RiskMethod::PathAccumulation));

        let runs = ledger.recent(10).await.unwrap();
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn test_skip_threshold_fails_run_but_records_it() {
        let (db, _temp) = setup_test_db().await;
        let store = EntityStore::new(db.clone(), StoreSettings::default()).unwrap();
        let graph = RelationGraph::new(db.clone(), KindTable::default());
        let ledger = RunLedger::new(db);

        store
            .upsert_entities(vec![Entity::new(org("a"), None).with_direct_risk(1.0)])
            .await
            .unwrap();
        graph
            .insert_relations(vec![
                Relation::new(RelationKind::Ownership, org("ghost"), org("a")),
                Relation::new(RelationKind::Ownership, org("b"), org("a")).with_weight(0.0),
            ])
            .await
            .unwrap();

        let engine = Engine::Max(
            MaxPropagationEngine::new(store, graph, MaxPropagationSettings::default()).unwrap(),
        );
        let result = execute(&engine, &ledger, Some(1)).await;
        assert!(matches!(result, Err(RiskError::SkipThresholdExceeded { skipped: 2, max: 1 })));
        let runs = ledger.recent(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].skipped.total(), 2);
        assert!(runs[0].error.as_deref().unwrap().contains("above the configured maximum"));
    }

    #[tokio::test]
    async fn test_storage_error_fails_run_and_is_recorded() {
        let (db, _temp) = setup_test_db().await;
        let store = EntityStore::new(db.clone(), StoreSettings::default()).unwrap();
        let graph = RelationGraph::new(db.clone(), KindTable::default());
        let ledger = RunLedger::new(db.clone());
        store
            .upsert_entities(vec![Entity::new(org("a"), None).with_direct_risk(1.0)])
            .await
            .unwrap();
        db.with_connection(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER entities_read_only BEFORE UPDATE ON entities \
                 BEGIN SELECT RAISE(ABORT, 'entities are read-only'); END;",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let engine = Engine::Max(
            MaxPropagationEngine::new(store, graph, MaxPropagationSettings::default()).unwrap(),
        );
        let err = execute(&engine, &ledger, None).await.unwrap_err();
        assert!(matches!(err, RiskError::Database(_)));
        assert!(!err.is_retryable());

        let runs = ledger.recent(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].method, RiskMethod::MaxPropagation);
        assert!(runs[0].error.as_deref().unwrap().contains("read-only"));
    }

    #[tokio::test]
    async fn test_locked_database_exhausts_retries_and_is_recorded() {
        let (db, _temp) = setup_test_db().await;
        let db = db.with_busy_timeout(Duration::from_millis(20));
        let settings = StoreSettings {
            retry: RetryPolicy { max_retries: 2, base_delay: Duration::from_millis(1) },
            ..StoreSettings::default()
        };
        let store = EntityStore::new(db.clone(), settings).unwrap();
        let graph = RelationGraph::new(db.clone(), KindTable::default());
        store
            .upsert_entities(vec![Entity::new(org("a"), None).with_direct_risk(1.0)])
            .await
            .unwrap();

        // ledger lives elsewhere so the failure can still be written
        let (ledger_db, _ledger_temp) = setup_test_db().await;
        let ledger = RunLedger::new(ledger_db);

        let writer = rusqlite::Connection::open(db.path()).unwrap();
        writer.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let engine = Engine::Path(
            PathAccumulationEngine::new(store, graph, PathSettings::default()).unwrap(),
        );
        let err = execute(&engine, &ledger, None).await.unwrap_err();
        writer.execute_batch("ROLLBACK").unwrap();

        match err {
            RiskError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        let runs = ledger.recent(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].method, RiskMethod::PathAccumulation);
    }
}
