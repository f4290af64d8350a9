//! Direct risk from sanctions list membership.

use serde::Serialize;
use std::collections::HashMap;

use crate::error::Result;
use crate::graph::EntityRef;
use crate::store::EntityStore;

/// OFAC list ids and their scores.
const OFAC_TIERS: [(&str, f64); 4] = [
    ("1550", 1.0),  // SDN
    ("91512", 0.7), // consolidated
    ("91507", 0.5), // SSI
    ("91243", 0.3), // non-SDN Palestinian
];

/// Tier label -> score, with a low default for labels it does not know.
///
/// Unknown tiers still score above zero so the entity stays visible when tracing.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    scores: HashMap<String, f64>,
    default_score: f64,
}

impl TierTable {
    pub fn new(scores: HashMap<String, f64>, default_score: f64) -> Self {
        Self { scores, default_score }
    }

    pub fn ofac(default_score: f64) -> Self {
        let scores = OFAC_TIERS
            .iter()
            .map(|(tier, score)| (tier.to_string(), *score))
            .collect();
        Self::new(scores, default_score)
    }

    /// Score for `tier`, and whether the tier was recognised.
    pub fn score(&self, tier: &str) -> (f64, bool) {
        match self.scores.get(tier) {
            Some(score) => (*score, true),
            None => (self.default_score, false),
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::ofac(0.1)
    }
}

/// One `(entity id, list tier)` observation from a sanctions list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub entity_key: String,
    pub tier: String,
}

impl Observation {
    pub fn new(entity_key: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            entity_key: entity_key.into(),
            tier: tier.into(),
        }
    }
}

/// Counts from one load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub observations: u64,
    /// Blank entity id or tier
    pub malformed: u64,
    /// Scored with the default because the tier was not in the table
    pub unclassified_tier: u64,
    pub unique_entities: u64,
    /// Keys with no stored entity in any collection
    pub unknown_entities: u64,
    pub entities_updated: u64,
    /// Entities deleted between lookup and write
    pub missing_on_write: u64,
}

impl LoadReport {
    /// Records dropped without being applied.
    pub fn skipped(&self) -> u64 {
        self.malformed + self.unknown_entities + self.missing_on_write
    }

    pub fn log_summary(&self) {
        log::info!("=== Direct risk load ===");
        log::info!("Observations read: {}", self.observations);
        log::info!("Unique entities: {}", self.unique_entities);
        log::info!("Entities updated: {}", self.entities_updated);
        log::info!("Unclassified tiers (default score): {}", self.unclassified_tier);
        log::info!(
            "Skipped: malformed={}, unknown_entities={}, missing_on_write={}",
            self.malformed,
            self.unknown_entities,
            self.missing_on_write
        );
    }
}

/// Collapse observations to one score per entity key, keeping the highest.
pub fn collapse_observations<I>(
    observations: I,
    tiers: &TierTable,
    report: &mut LoadReport,
) -> HashMap<String, f64>
where
    I: IntoIterator<Item = Observation>,
{
    let mut best: HashMap<String, f64> = HashMap::new();
    for obs in observations {
        report.observations += 1;
        let key = obs.entity_key.trim();
        let tier = obs.tier.trim();
        if key.is_empty() || tier.is_empty() {
            log::debug!("Skipping malformed observation {:?}", obs);
            report.malformed += 1;
            continue;
        }
        let (score, known) = tiers.score(tier);
        if !known {
            log::debug!("Unclassified tier {} for {}, using {}", tier, key, score);
            report.unclassified_tier += 1;
        }
        best.entry(key.to_string())
            .and_modify(|current| *current = current.max(score))
            .or_insert(score);
    }
    report.unique_entities = best.len() as u64;
    best
}

/// Applies sanctions observations as `direct_risk = max(existing, score)`.
#[derive(Debug, Clone)]
pub struct DirectRiskLoader {
    store: EntityStore,
    tiers: TierTable,
}

impl DirectRiskLoader {
    pub fn new(store: EntityStore, tiers: TierTable) -> Self {
        Self { store, tiers }
    }

    /// Observations for keys with no stored entity are counted and dropped.
    /// A key stored in several collections is raised in each of them.
    pub async fn load<I>(&self, observations: I) -> Result<LoadReport>
    where
        I: IntoIterator<Item = Observation>,
    {
        let mut report = LoadReport::default();
        let scores = collapse_observations(observations, &self.tiers, &mut report);
        log::info!(
            "Collapsed {} observations to {} entities",
            report.observations,
            report.unique_entities
        );

        let resolved = self.store.resolve_keys(scores.keys().cloned().collect()).await?;

        let mut updates: Vec<(EntityRef, f64)> = Vec::new();
        for (key, score) in &scores {
            match resolved.get(key) {
                Some(refs) => updates.extend(refs.iter().map(|id| (id.clone(), *score))),
                None => {
                    log::debug!("No stored entity for sanctions id {}", key);
                    report.unknown_entities += 1;
                }
            }
        }
        updates.sort_by(|a, b| a.0.cmp(&b.0));

        let written = self.store.raise_direct_risk(updates).await?;
        report.entities_updated = written.written as u64;
        report.missing_on_write = written.missing as u64;
        Ok(report)
    }
}
