//! Persisted history of engine runs (`risk_runs`).

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use super::{RiskMethod, RunReport, SkipCounts};
use crate::db::Db;
use crate::error::{Result, RiskError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(RiskError::Parse(format!("Unknown run status: {}", other))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the run ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub run_id: String,
    pub method: RiskMethod,
    pub budget: usize,
    pub rounds_executed: usize,
    pub converged: Option<bool>,
    pub entities_updated: usize,
    pub skipped: SkipCounts,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

fn entry_from_row(row: &Row<'_>) -> Result<LedgerEntry> {
    let method: String = row.get(1)?;
    let skipped_json: String = row.get(6)?;
    let status: String = row.get(7)?;
    let skipped = serde_json::from_str(&skipped_json)
        .map_err(|e| RiskError::Parse(format!("Bad skip counts in ledger: {}", e)))?;
    Ok(LedgerEntry {
        run_id: row.get(0)?,
        method: method.parse()?,
        budget: row.get::<_, i64>(2)? as usize,
        rounds_executed: row.get::<_, i64>(3)? as usize,
        converged: row.get(4)?,
        entities_updated: row.get::<_, i64>(5)? as usize,
        skipped,
        status: RunStatus::parse(&status)?,
        error: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
    })
}

const INSERT_RUN: &str = "INSERT INTO risk_runs \
    (run_id, method, budget, rounds_executed, converged, entities_updated, \
     skipped_json, status, error, started_at, finished_at) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

#[derive(Debug, Clone)]
pub struct RunLedger {
    db: Db,
}

impl RunLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn record(&self, report: &RunReport) -> Result<()> {
        self.insert_report(report, RunStatus::Completed, None).await
    }

    /// Record a run that finished its work but was rejected afterwards,
    /// e.g. for skipping too many records. Keeps the report's counts.
    pub async fn record_rejected(&self, report: &RunReport, error: &RiskError) -> Result<()> {
        self.insert_report(report, RunStatus::Failed, Some(error.to_string())).await
    }

    async fn insert_report(
        &self,
        report: &RunReport,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        let skipped_json = serde_json::to_string(&report.skipped)
            .map_err(|e| RiskError::Storage(format!("Could not encode skip counts: {}", e)))?;
        let report = report.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    INSERT_RUN,
                    params![
                        report.run_id.to_string(),
                        report.method.as_str(),
                        report.budget as i64,
                        report.rounds_executed as i64,
                        report.converged,
                        report.entities_updated as i64,
                        skipped_json,
                        status.as_str(),
                        error,
                        report.started_at.to_rfc3339(),
                        report.finished_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Record a run that aborted. Its partial scores are not to be trusted.
    pub async fn record_failure(
        &self,
        method: RiskMethod,
        budget: usize,
        started_at: DateTime<Utc>,
        error: &RiskError,
    ) -> Result<()> {
        let message = error.to_string();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    INSERT_RUN,
                    params![
                        Uuid::new_v4().to_string(),
                        method.as_str(),
                        budget as i64,
                        0i64,
                        Option::<bool>::None,
                        0i64,
                        "{}",
                        RunStatus::Failed.as_str(),
                        Some(message),
                        started_at.to_rfc3339(),
                        Utc::now().to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Most recent runs first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.db
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT run_id, method, budget, rounds_executed, converged, entities_updated, \
                            skipped_json, status, error, started_at, finished_at \
                     FROM risk_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(entry_from_row(row)?);
                }
                Ok(out)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_test_db;

    #[tokio::test]
    async fn test_record_and_read_back() {
        let (db, _temp) = setup_test_db().await;
        let ledger = RunLedger::new(db);

        let mut report = RunReport::start(RiskMethod::MaxPropagation, 5);
        report.rounds_executed = 2;
        report.converged = Some(true);
        report.entities_updated = 12;
        report.skipped.invalid_weight = 3;
        report.finish();
        ledger.record(&report).await.unwrap();

        let runs = ledger.recent(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.run_id, report.run_id.to_string());
        assert_eq!(run.method, RiskMethod::MaxPropagation);
        assert_eq!(run.budget, 5);
        assert_eq!(run.converged, Some(true));
        assert_eq!(run.skipped.invalid_weight, 3);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn test_rejected_run_keeps_its_counts() {
        let (db, _temp) = setup_test_db().await;
        let ledger = RunLedger::new(db);

        let mut report = RunReport::start(RiskMethod::PathAccumulation, 3);
        report.rounds_executed = 1;
        report.entities_updated = 4;
        report.skipped.missing_entity = 7;
        report.finish();
        let err = RiskError::SkipThresholdExceeded { skipped: 7, max: 5 };
        ledger.record_rejected(&report, &err).await.unwrap();

        let run = &ledger.recent(1).await.unwrap()[0];
        assert_eq!(run.run_id, report.run_id.to_string());
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.entities_updated, 4);
        assert_eq!(run.skipped.missing_entity, 7);
        assert_eq!(run.error.as_deref(), Some(err.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_failure_is_recorded() {
        let (db, _temp) = setup_test_db().await;
        let ledger = RunLedger::new(db);
        let err = RiskError::RetriesExhausted {
            operation: "write_inferred".to_string(),
            attempts: 4,
            last_error: "database is locked".to_string(),
        };
        ledger
            .record_failure(RiskMethod::PathAccumulation, 3, Utc::now(), &err)
            .await
            .unwrap();

        let runs = ledger.recent(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].converged, None);
        assert!(runs[0].error.as_deref().unwrap().contains("database is locked"));
    }
}
