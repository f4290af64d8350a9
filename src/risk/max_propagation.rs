//! Iterative max-propagation of inferred risk.
//!
//! Each round reads one snapshot of inferred risk, folds every relation kind
//! against it (kinds run concurrently, edges streamed), merges the candidates
//! by max, and writes the raises before the next round starts. Reading only the
//! snapshot makes the result independent of edge and kind order.

use futures_util::future::try_join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{RiskMethod, RunReport, SkipCounts};
use crate::error::{Result, RiskError};
use crate::graph::{EntityRef, KindTable, Relation, RelationGraph};
use crate::store::{EntityStore, WriteOutcome};

const METHOD: RiskMethod = RiskMethod::MaxPropagation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxPropagationSettings {
    /// Round budget; each round reaches one hop further
    pub rounds: usize,
    /// Stop as soon as a round raises nothing
    pub stop_at_fixpoint: bool,
}

impl Default for MaxPropagationSettings {
    fn default() -> Self {
        Self {
            rounds: 3,
            stop_at_fixpoint: true,
        }
    }
}

/// Result of one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundOutcome {
    pub round: usize,
    /// Entities whose inferred risk went up, in sorted order
    pub raised: Vec<EntityRef>,
    pub written: WriteOutcome,
    pub skipped: SkipCounts,
}

/// Best candidate per receiving entity for one round.
#[derive(Debug, Default)]
struct Candidates {
    best: HashMap<EntityRef, f64>,
    skipped: SkipCounts,
}

impl Candidates {
    fn offer(&mut self, entity: &EntityRef, candidate: f64) {
        match self.best.get_mut(entity) {
            Some(current) if *current >= candidate => {}
            Some(current) => *current = candidate,
            None => {
                self.best.insert(entity.clone(), candidate);
            }
        }
    }

    fn offer_edge(
        &mut self,
        table: &KindTable,
        snapshot: &HashMap<EntityRef, f64>,
        relation: &Relation,
    ) {
        if relation.source == relation.target {
            log::debug!(
                "Skipping relation {}: {} points at itself",
                relation.relation_id,
                relation.source
            );
            self.skipped.self_loop += 1;
            return;
        }
        let Some(weight) = table.effective_weight(relation) else {
            log::debug!(
                "Skipping relation {}: invalid weight {:?}",
                relation.relation_id,
                relation.weight
            );
            self.skipped.invalid_weight += 1;
            return;
        };
        if !snapshot.contains_key(&relation.source) || !snapshot.contains_key(&relation.target) {
            log::debug!(
                "Skipping relation {}: {} -> {} has a missing endpoint",
                relation.relation_id,
                relation.source,
                relation.target
            );
            self.skipped.missing_entity += 1;
            return;
        }
        for (giver, receiver) in table.flows(relation) {
            let risk = snapshot[giver];
            if risk <= 0.0 {
                continue;
            }
            let candidate = risk * weight;
            if candidate > snapshot[receiver] {
                self.offer(receiver, candidate);
            }
        }
    }

    fn merge(&mut self, other: Candidates) {
        for (entity, candidate) in &other.best {
            self.offer(entity, *candidate);
        }
        self.skipped.merge(other.skipped);
    }
}

/// Breadth-limited max relaxation: after `R` rounds an entity holds the
/// strongest product of weights times source risk over paths of at most `R` hops.
#[derive(Debug, Clone)]
pub struct MaxPropagationEngine {
    store: EntityStore,
    graph: RelationGraph,
    settings: MaxPropagationSettings,
}

impl MaxPropagationEngine {
    pub fn new(
        store: EntityStore,
        graph: RelationGraph,
        settings: MaxPropagationSettings,
    ) -> Result<Self> {
        if settings.rounds == 0 {
            return Err(RiskError::Config(
                "round budget must be at least 1; 0 rounds would leave inferred risk unpropagated"
                    .to_string(),
            ));
        }
        Ok(Self { store, graph, settings })
    }

    pub fn settings(&self) -> &MaxPropagationSettings {
        &self.settings
    }

    /// Full recomputation: reset inferred risk to direct risk, then run rounds.
    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::start(METHOD, self.settings.rounds);
        report.converged = Some(false);

        let reset = self.store.reset_inferred(METHOD).await?;
        log::info!("Reset inferred risk for {} entities", reset);

        let mut updated: HashSet<EntityRef> = HashSet::new();
        for round in 1..=self.settings.rounds {
            let outcome = self.propagate_round(round).await?;
            report.rounds_executed = round;
            if round == 1 {
                report.skipped = outcome.skipped;
            }
            // rows deleted between snapshot and write
            report.skipped.missing_entity += outcome.written.missing as u64;

            log::info!(
                "Round {}/{}: raised {} entities",
                round,
                self.settings.rounds,
                outcome.raised.len()
            );

            if outcome.raised.is_empty() {
                report.converged = Some(true);
                if self.settings.stop_at_fixpoint {
                    log::info!("Fixpoint reached after {} rounds", round);
                    break;
                }
            }
            updated.extend(outcome.raised);
        }

        report.entities_updated = updated.len();
        report.finish();
        Ok(report)
    }

    /// One synchronous relaxation step over every relation kind.
    ///
    /// Does not reset; after a converged [`run`](Self::run) another round raises nothing.
    pub async fn propagate_round(&self, round: usize) -> Result<RoundOutcome> {
        let snapshot = Arc::new(self.store.inferred_snapshot().await?);

        let folds = self.graph.table().rules().map(|rule| {
            let table = self.graph.table().clone();
            let snapshot = Arc::clone(&snapshot);
            self.graph.fold_edges(rule.kind, Candidates::default(), move |mut acc, relation| {
                acc.offer_edge(&table, &snapshot, &relation);
                acc
            })
        });
        let per_kind = try_join_all(folds).await?;

        let mut merged = Candidates::default();
        for candidates in per_kind {
            merged.merge(candidates);
        }

        let mut raises: Vec<(EntityRef, f64)> = merged.best.into_iter().collect();
        raises.sort_by(|a, b| a.0.cmp(&b.0));

        let written = if raises.is_empty() {
            WriteOutcome::default()
        } else {
            self.store.raise_inferred(raises.clone(), METHOD).await?
        };

        Ok(RoundOutcome {
            round,
            raised: raises.into_iter().map(|(entity, _)| entity).collect(),
            written,
            skipped: merged.skipped,
        })
    }
}
