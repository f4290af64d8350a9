//! Bounded-depth path accumulation.
//!
//! For every entity, walk upstream along ownership, leadership and kinship
//! edges up to `max_depth` hops and add `product(weights) * direct_risk(endpoint)`
//! for every path found. A path never uses the same relation twice, so a single
//! kinship edge cannot bounce risk back to where it came from, and an edge
//! from an entity to itself is never walked.

use futures_util::future::try_join_all;
use lru::LruCache;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::rc::Rc;

use super::{RiskMethod, RunReport, SkipCounts};
use crate::error::{Result, RiskError};
use crate::graph::{Collection, EntityRef, RelationGraph, RelationKind, Traversal, Upstream};
use crate::store::EntityStore;

const METHOD: RiskMethod = RiskMethod::PathAccumulation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSettings {
    /// Longest path walked, in hops
    pub max_depth: usize,
    /// Upstream edges considered per node
    pub max_fan_out: usize,
    /// Paths enumerated per scored entity
    pub max_paths_per_entity: usize,
    /// Nodes whose upstream neighbors are kept in memory per collection
    pub upstream_cache_size: usize,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_fan_out: 1000,
            max_paths_per_entity: 10_000,
            upstream_cache_size: 10_000,
        }
    }
}

/// Scores and skip bookkeeping for one collection.
#[derive(Debug, Default)]
struct CollectionScores {
    scores: Vec<(EntityRef, f64)>,
    /// Entities that picked up at least one non-zero path
    raised: usize,
    invalid_weight: HashSet<i64>,
    missing_entity: HashSet<i64>,
    self_loop: HashSet<i64>,
    truncated: u64,
}

/// Depth-first path enumeration over one connection.
struct PathScorer<'t, 'c> {
    traversal: &'t Traversal<'c>,
    max_depth: usize,
    max_paths: usize,
    upstream: LruCache<EntityRef, Rc<Upstream>>,
    invalid_weight: HashSet<i64>,
    missing_entity: HashSet<i64>,
    self_loop: HashSet<i64>,
}

/// Running totals for the entity being scored.
#[derive(Debug, Default)]
struct Walk {
    sum: f64,
    paths: usize,
    truncated: bool,
    used: Vec<i64>,
}

impl<'t, 'c> PathScorer<'t, 'c> {
    fn new(traversal: &'t Traversal<'c>, settings: &PathSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.upstream_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            traversal,
            max_depth: settings.max_depth,
            max_paths: settings.max_paths_per_entity,
            upstream: LruCache::new(capacity),
            invalid_weight: HashSet::new(),
            missing_entity: HashSet::new(),
            self_loop: HashSet::new(),
        }
    }

    fn upstream_of(&mut self, node: &EntityRef) -> Result<Rc<Upstream>> {
        if let Some(cached) = self.upstream.get(node) {
            return Ok(Rc::clone(cached));
        }
        let found = Rc::new(self.traversal.upstream(node, &RelationKind::PRIMARY)?);
        self.self_loop.extend(found.self_loops.iter().copied());
        self.upstream.put(node.clone(), Rc::clone(&found));
        Ok(found)
    }

    /// Sum of all path values ending upstream of `entity`, and whether a cap was hit.
    fn score(&mut self, entity: &EntityRef) -> Result<(f64, bool)> {
        let mut walk = Walk::default();
        self.extend(entity, 0, 1.0, &mut walk)?;
        Ok((walk.sum, walk.truncated))
    }

    fn extend(
        &mut self,
        node: &EntityRef,
        depth: usize,
        product: f64,
        walk: &mut Walk,
    ) -> Result<()> {
        if depth == self.max_depth {
            return Ok(());
        }
        let upstream = self.upstream_of(node)?;
        if upstream.truncated {
            walk.truncated = true;
        }
        for hop in &upstream.hops {
            if walk.used.contains(&hop.relation_id) {
                continue;
            }
            let Some(weight) = hop.weight else {
                self.invalid_weight.insert(hop.relation_id);
                continue;
            };
            let Some(endpoint_risk) = hop.neighbor_direct_risk else {
                self.missing_entity.insert(hop.relation_id);
                continue;
            };
            if walk.paths == self.max_paths {
                walk.truncated = true;
                return Ok(());
            }
            walk.paths += 1;

            let value = product * weight;
            walk.sum += value * endpoint_risk;

            walk.used.push(hop.relation_id);
            self.extend(&hop.neighbor, depth + 1, value, walk)?;
            walk.used.pop();
        }
        Ok(())
    }
}

/// Additive estimator: unlike max propagation, two sanctioned owners both count.
#[derive(Debug, Clone)]
pub struct PathAccumulationEngine {
    store: EntityStore,
    graph: RelationGraph,
    settings: PathSettings,
}

impl PathAccumulationEngine {
    pub fn new(store: EntityStore, graph: RelationGraph, settings: PathSettings) -> Result<Self> {
        if settings.max_depth == 0 {
            return Err(RiskError::Config("paths.max_depth must be at least 1".to_string()));
        }
        if settings.max_fan_out == 0 || settings.max_paths_per_entity == 0 {
            return Err(RiskError::Config(
                "paths.max_fan_out and paths.max_paths_per_entity must be greater than 0"
                    .to_string(),
            ));
        }
        if settings.upstream_cache_size == 0 {
            return Err(RiskError::Config(
                "paths.upstream_cache_size must be greater than 0".to_string(),
            ));
        }
        Ok(Self { store, graph, settings })
    }

    pub fn settings(&self) -> &PathSettings {
        &self.settings
    }

    /// Score every entity and overwrite its inferred risk.
    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::start(METHOD, self.settings.max_depth);

        let per_collection =
            try_join_all(Collection::ALL.into_iter().map(|c| self.score_collection(c))).await?;

        let mut scores = Vec::new();
        let mut invalid_weight = HashSet::new();
        let mut missing_entity = HashSet::new();
        let mut self_loop = HashSet::new();
        let mut truncated = 0;
        for collection in per_collection {
            scores.extend(collection.scores);
            report.entities_updated += collection.raised;
            invalid_weight.extend(collection.invalid_weight);
            missing_entity.extend(collection.missing_entity);
            self_loop.extend(collection.self_loop);
            truncated += collection.truncated;
        }

        let written = self.store.write_inferred(scores, METHOD).await?;
        log::info!("Wrote path scores for {} entities", written.written);

        report.rounds_executed = 1;
        report.skipped = SkipCounts {
            missing_entity: missing_entity.len() as u64 + written.missing as u64,
            invalid_weight: invalid_weight.len() as u64,
            truncated_paths: truncated,
            self_loop: self_loop.len() as u64,
        };
        report.finish();
        Ok(report)
    }

    async fn score_collection(&self, collection: Collection) -> Result<CollectionScores> {
        let entities = self.store.direct_risks_in(collection).await?;
        if entities.is_empty() {
            return Ok(CollectionScores::default());
        }
        log::info!("Scoring {} {} entities", entities.len(), collection);

        let settings = self.settings.clone();
        let scored = self
            .graph
            .with_traversal(settings.max_fan_out, move |traversal| {
                let mut scorer = PathScorer::new(traversal, &settings);
                let mut out = CollectionScores::default();
                for (key, direct_risk) in entities {
                    let entity = EntityRef::new(collection, key);
                    let (sum, truncated) = scorer.score(&entity)?;
                    if truncated {
                        log::debug!("Path enumeration for {} hit a cap", entity);
                        out.truncated += 1;
                    }
                    if sum > 0.0 {
                        out.raised += 1;
                    }
                    out.scores.push((entity, direct_risk + sum));
                }
                out.invalid_weight = scorer.invalid_weight;
                out.missing_entity = scorer.missing_entity;
                out.self_loop = scorer.self_loop;
                Ok(out)
            })
            .await?;

        log::info!(
            "{}: {} entities gained path risk, {} truncated",
            collection,
            scored.raised,
            scored.truncated
        );
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{KindTable, Relation};
    use crate::store::{Entity, StoreSettings};
    use crate::test_support::{org, person, setup_test_db, vessel};

    struct Fixture {
        store: EntityStore,
        graph: RelationGraph,
        _temp: tempfile::TempDir,
    }

    async fn fixture(entities: Vec<Entity>, relations: Vec<Relation>) -> Fixture {
        let (db, temp) = setup_test_db().await;
        let store = EntityStore::new(db.clone(), StoreSettings::default()).unwrap();
        let graph = RelationGraph::new(db, KindTable::default());
        store.upsert_entities(entities).await.unwrap();
        graph.insert_relations(relations).await.unwrap();
        Fixture { store, graph, _temp: temp }
    }

    async fn run(f: &Fixture, settings: PathSettings) -> RunReport {
        PathAccumulationEngine::new(f.store.clone(), f.graph.clone(), settings)
            .unwrap()
            .run()
            .await
            .unwrap()
    }

    fn depth(max_depth: usize) -> PathSettings {
        PathSettings { max_depth, ..PathSettings::default() }
    }

    async fn inferred(f: &Fixture, id: &EntityRef) -> f64 {
        f.store.get(id).await.unwrap().unwrap().inferred_risk
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {}, got {}", expected, actual);
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected() {
        let f = fixture(vec![], vec![]).await;
        for settings in [
            depth(0),
            PathSettings { max_fan_out: 0, ..PathSettings::default() },
            PathSettings { max_paths_per_entity: 0, ..PathSettings::default() },
            PathSettings { upstream_cache_size: 0, ..PathSettings::default() },
        ] {
            let result = PathAccumulationEngine::new(f.store.clone(), f.graph.clone(), settings);
            assert!(matches!(result, Err(RiskError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_two_owners_are_summed() {
        let f = fixture(
            vec![
                Entity::new(org("o1"), None).with_direct_risk(0.7),
                Entity::new(org("o2"), None).with_direct_risk(1.0),
                Entity::new(vessel("x"), None),
            ],
            vec![
                Relation::new(RelationKind::Ownership, vessel("x"), org("o1")),
                Relation::new(RelationKind::Ownership, vessel("x"), org("o2")),
            ],
        )
        .await;
        let report = run(&f, PathSettings::default()).await;
        assert_close(inferred(&f, &vessel("x")).await, 1.7);
        // owners do not inherit from what they own
        assert_close(inferred(&f, &org("o1")).await, 0.7);
        assert_eq!(report.entities_updated, 1);
        assert_eq!(report.rounds_executed, 1);
        assert_eq!(report.converged, None);
        assert_eq!(
            f.store.get(&vessel("x")).await.unwrap().unwrap().risk_method,
            Some(RiskMethod::PathAccumulation)
        );
    }

    #[tokio::test]
    async fn test_depth_limit_is_monotone() {
        // a owns b owns c owns d, a sanctioned
        let f = fixture(
            vec![
                Entity::new(org("a"), None).with_direct_risk(1.0),
                Entity::new(org("b"), None),
                Entity::new(org("c"), None),
                Entity::new(vessel("d"), None),
            ],
            vec![
                Relation::new(RelationKind::Ownership, org("b"), org("a")),
                Relation::new(RelationKind::Ownership, org("c"), org("b")),
                Relation::new(RelationKind::Ownership, vessel("d"), org("c")),
            ],
        )
        .await;

        let mut previous = 0.0;
        for (max_depth, expected) in [(1, 0.0), (2, 0.0), (3, 1.0), (4, 1.0)] {
            run(&f, depth(max_depth)).await;
            let d = inferred(&f, &vessel("d")).await;
            assert_close(d, expected);
            assert!(d >= previous);
            previous = d;
        }
        assert_close(inferred(&f, &org("b")).await, 1.0);
    }

    #[tokio::test]
    async fn test_kinship_does_not_bounce_back() {
        let f = fixture(
            vec![
                Entity::new(person("a"), None).with_direct_risk(1.0),
                Entity::new(person("b"), None),
            ],
            vec![Relation::new(RelationKind::Kinship, person("a"), person("b"))],
        )
        .await;
        run(&f, PathSettings::default()).await;
        assert_close(inferred(&f, &person("b")).await, 0.5);
        assert_close(inferred(&f, &person("a")).await, 1.0);
    }

    #[tokio::test]
    async fn test_self_kinship_is_skipped_and_counted() {
        let f = fixture(
            vec![
                Entity::new(person("a"), None).with_direct_risk(1.0),
                Entity::new(person("b"), None),
            ],
            vec![
                Relation::new(RelationKind::Kinship, person("a"), person("a")),
                Relation::new(RelationKind::Kinship, person("a"), person("b")),
            ],
        )
        .await;
        let report = run(&f, PathSettings::default()).await;
        assert_close(inferred(&f, &person("a")).await, 1.0);
        assert_close(inferred(&f, &person("b")).await, 0.5);
        // reached from both a and b, still one edge
        assert_eq!(report.skipped.self_loop, 1);
        assert_eq!(report.skipped.total(), 1);
    }

    #[tokio::test]
    async fn test_small_upstream_cache_gives_same_scores() {
        // diamond: v owned by o1 and o2, both owned by a
        let f = fixture(
            vec![
                Entity::new(org("a"), None).with_direct_risk(1.0),
                Entity::new(org("o1"), None).with_direct_risk(0.3),
                Entity::new(org("o2"), None),
                Entity::new(vessel("v"), None),
            ],
            vec![
                Relation::new(RelationKind::Ownership, org("o1"), org("a")),
                Relation::new(RelationKind::Ownership, org("o2"), org("a")),
                Relation::new(RelationKind::Ownership, vessel("v"), org("o1")),
                Relation::new(RelationKind::Ownership, vessel("v"), org("o2")),
            ],
        )
        .await;

        run(&f, PathSettings::default()).await;
        let expected = inferred(&f, &vessel("v")).await;
        assert_close(expected, 0.3 + 1.0 + 1.0);

        let tiny_cache = PathSettings { upstream_cache_size: 1, ..PathSettings::default() };
        let report = run(&f, tiny_cache).await;
        assert_close(inferred(&f, &vessel("v")).await, expected);
        assert_close(inferred(&f, &org("o1")).await, 1.3);
        assert_eq!(report.skipped.total(), 0);
    }

    #[tokio::test]
    async fn test_leadership_reaches_organization_only() {
        let f = fixture(
            vec![
                Entity::new(person("l"), None).with_direct_risk(1.0),
                Entity::new(org("o"), None),
                Entity::new(vessel("v"), None),
            ],
            vec![
                Relation::new(RelationKind::Leadership, person("l"), org("o")),
                Relation::new(RelationKind::Ownership, vessel("v"), org("o")),
            ],
        )
        .await;
        run(&f, PathSettings::default()).await;
        assert_close(inferred(&f, &org("o")).await, 0.8);
        assert_close(inferred(&f, &vessel("v")).await, 0.8);
        assert_close(inferred(&f, &person("l")).await, 1.0);
    }

    #[tokio::test]
    async fn test_operation_edges_are_not_walked() {
        let f = fixture(
            vec![
                Entity::new(org("op"), None).with_direct_risk(1.0),
                Entity::new(vessel("ship"), None),
            ],
            vec![Relation::new(RelationKind::Operation, org("op"), vessel("ship"))],
        )
        .await;
        let report = run(&f, PathSettings::default()).await;
        assert_close(inferred(&f, &vessel("ship")).await, 0.0);
        assert_eq!(report.entities_updated, 0);
    }

    #[tokio::test]
    async fn test_monotone_in_edge_weight() {
        let mut scores = Vec::new();
        for weight in [0.2, 0.6, 1.0] {
            let f = fixture(
                vec![
                    Entity::new(person("p"), None).with_direct_risk(0.9),
                    Entity::new(person("k"), None),
                    Entity::new(org("o"), None),
                ],
                vec![
                    Relation::new(RelationKind::Kinship, person("p"), person("k"))
                        .with_weight(weight),
                    Relation::new(RelationKind::Leadership, person("k"), org("o")),
                ],
            )
            .await;
            run(&f, PathSettings::default()).await;
            scores.push(inferred(&f, &org("o")).await);
        }
        assert_close(scores[0], 0.8 * 0.2 * 0.9);
        assert!(scores.windows(2).all(|w| w[1] >= w[0]));
    }

    #[tokio::test]
    async fn test_caps_truncate_and_are_counted() {
        let mut entities = vec![Entity::new(vessel("v"), None)];
        let mut relations = Vec::new();
        for i in 0..5 {
            entities.push(Entity::new(org(&format!("o{}", i)), None).with_direct_risk(1.0));
            let owner = org(&format!("o{}", i));
            relations.push(Relation::new(RelationKind::Ownership, vessel("v"), owner));
        }
        let f = fixture(entities, relations).await;

        let few_paths = PathSettings { max_paths_per_entity: 3, ..PathSettings::default() };
        let report = run(&f, few_paths).await;
        assert_close(inferred(&f, &vessel("v")).await, 3.0);
        assert_eq!(report.skipped.truncated_paths, 1);

        let report = run(&f, PathSettings { max_fan_out: 2, ..PathSettings::default() }).await;
        assert_close(inferred(&f, &vessel("v")).await, 2.0);
        assert_eq!(report.skipped.truncated_paths, 1);

        let report = run(&f, PathSettings::default()).await;
        assert_close(inferred(&f, &vessel("v")).await, 5.0);
        assert_eq!(report.skipped.truncated_paths, 0);
    }

    #[tokio::test]
    async fn test_bad_edges_counted_once_across_entities() {
        let f = fixture(
            vec![
                Entity::new(org("a"), None).with_direct_risk(1.0),
                Entity::new(org("b"), None),
                Entity::new(vessel("v"), None),
            ],
            vec![
                // b owned by a ghost and by a, the latter with a broken weight
                Relation::new(RelationKind::Ownership, org("b"), org("ghost")),
                Relation::new(RelationKind::Ownership, org("b"), org("a")).with_weight(1.5),
                // v owned by b, so both bad edges are reached twice
                Relation::new(RelationKind::Ownership, vessel("v"), org("b")),
            ],
        )
        .await;
        let report = run(&f, PathSettings::default()).await;
        assert_eq!(report.skipped.missing_entity, 1);
        assert_eq!(report.skipped.invalid_weight, 1);
        assert_close(inferred(&f, &vessel("v")).await, 0.0);
    }

    #[tokio::test]
    async fn test_rerun_overwrites_previous_scores() {
        let f = fixture(
            vec![
                Entity::new(org("o"), None).with_direct_risk(1.0),
                Entity::new(vessel("v"), None),
            ],
            vec![Relation::new(RelationKind::Ownership, vessel("v"), org("o"))],
        )
        .await;
        run(&f, PathSettings::default()).await;
        run(&f, PathSettings::default()).await;
        assert_close(inferred(&f, &vessel("v")).await, 1.0);
        assert_close(inferred(&f, &org("o")).await, 1.0);
    }
}
