//! Typed relationship graph over screened entities.
//!
//! Relation kinds are described by a declarative [`KindTable`]: each kind has a
//! flow rule (which stored endpoint passes risk to which) and a decay weight.
//! Both risk engines read edges through that table rather than per-kind code.

mod relations;

pub use relations::{Hop, RelationGraph, Traversal, Upstream};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RiskError};

/// Entity category; doubles as the collection an entity is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    Person,
    Organization,
    Vessel,
    Aircraft,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Person,
        Collection::Organization,
        Collection::Vessel,
        Collection::Aircraft,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Person => "Person",
            Collection::Organization => "Organization",
            Collection::Vessel => "Vessel",
            Collection::Aircraft => "Aircraft",
        }
    }
}

impl FromStr for Collection {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| RiskError::Parse(format!("Unknown collection: {}", s)))
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of an entity: collection plus key, rendered `Person/123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub collection: Collection,
    pub key: String,
}

impl EntityRef {
    pub fn new(collection: Collection, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

impl FromStr for EntityRef {
    type Err = RiskError;

    fn from_str(s: &str) -> Result<Self> {
        let (collection, key) = s
            .split_once('/')
            .ok_or_else(|| RiskError::Parse(format!("Expected Collection/key, got {}", s)))?;
        if key.is_empty() {
            return Err(RiskError::Parse(format!("Empty entity key in {}", s)));
        }
        Ok(EntityRef::new(collection.parse()?, key))
    }
}

/// Relation kinds. Stored under their source edge labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Ownership,
    Leadership,
    Kinship,
    Operation,
}

impl RelationKind {
    pub const ALL: [RelationKind; 4] = [
        RelationKind::Ownership,
        RelationKind::Leadership,
        RelationKind::Kinship,
        RelationKind::Operation,
    ];

    /// Kinds walked by path accumulation.
    pub const PRIMARY: [RelationKind; 3] = [
        RelationKind::Ownership,
        RelationKind::Leadership,
        RelationKind::Kinship,
    ];

    /// Edge label as stored in `relations.kind`
    pub fn label(&self) -> &'static str {
        match self {
            RelationKind::Ownership => "owned_by",
            RelationKind::Leadership => "leader_of",
            RelationKind::Kinship => "family_member_of",
            RelationKind::Operation => "operates",
        }
    }

    /// Human name, also the `[weights]` config key
    pub fn name(&self) -> &'static str {
        match self {
            RelationKind::Ownership => "ownership",
            RelationKind::Leadership => "leadership",
            RelationKind::Kinship => "kinship",
            RelationKind::Operation => "operation",
        }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        RelationKind::ALL
            .into_iter()
            .find(|k| k.label() == label)
            .ok_or_else(|| RiskError::Parse(format!("Unknown relation label: {}", label)))
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which stored endpoint passes risk to which.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// `leader_of`, `operates`: source gives, target receives
    SourceToTarget,
    /// `owned_by` (owned -> owner): target gives, source receives
    TargetToSource,
    /// `family_member_of`
    Both,
}

/// One row of the kind table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KindRule {
    pub kind: RelationKind,
    pub flow: Flow,
    pub weight: f64,
}

/// Declarative kind -> flow -> weight table consumed by both engines.
#[derive(Debug, Clone, PartialEq)]
pub struct KindTable {
    rules: [KindRule; 4],
}

impl Default for KindTable {
    fn default() -> Self {
        Self::with_weights(1.0, 0.8, 0.5, 1.0)
    }
}

impl KindTable {
    pub fn with_weights(ownership: f64, leadership: f64, kinship: f64, operation: f64) -> Self {
        Self {
            rules: [
                KindRule {
                    kind: RelationKind::Ownership,
                    flow: Flow::TargetToSource,
                    weight: ownership,
                },
                KindRule {
                    kind: RelationKind::Leadership,
                    flow: Flow::SourceToTarget,
                    weight: leadership,
                },
                KindRule { kind: RelationKind::Kinship, flow: Flow::Both, weight: kinship },
                KindRule {
                    kind: RelationKind::Operation,
                    flow: Flow::SourceToTarget,
                    weight: operation,
                },
            ],
        }
    }

    pub fn rule(&self, kind: RelationKind) -> &KindRule {
        // rules are laid out in RelationKind::ALL order
        &self.rules[kind as usize]
    }

    pub fn rules(&self) -> impl Iterator<Item = &KindRule> {
        self.rules.iter()
    }

    /// Effective weight of an edge: its own weight, else the kind's.
    /// `None` when the weight is outside (0, 1] or not finite.
    pub fn effective_weight(&self, relation: &Relation) -> Option<f64> {
        self.resolve_weight(relation.kind, relation.weight)
    }

    pub fn resolve_weight(&self, kind: RelationKind, explicit: Option<f64>) -> Option<f64> {
        let w = explicit.unwrap_or(self.rule(kind).weight);
        (w.is_finite() && w > 0.0 && w <= 1.0).then_some(w)
    }

    /// `(giver, receiver)` pairs an edge contributes under its kind's flow rule.
    pub fn flows<'r>(&self, relation: &'r Relation) -> Vec<(&'r EntityRef, &'r EntityRef)> {
        match self.rule(relation.kind).flow {
            Flow::SourceToTarget => vec![(&relation.source, &relation.target)],
            Flow::TargetToSource => vec![(&relation.target, &relation.source)],
            Flow::Both => vec![
                (&relation.source, &relation.target),
                (&relation.target, &relation.source),
            ],
        }
    }
}

/// A stored edge `(source, target, kind, weight)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Row id; zero until stored
    pub relation_id: i64,
    pub kind: RelationKind,
    pub source: EntityRef,
    pub target: EntityRef,
    /// Explicit weight; `None` defers to the kind table
    pub weight: Option<f64>,
}

impl Relation {
    pub fn new(kind: RelationKind, source: EntityRef, target: EntityRef) -> Self {
        Self {
            relation_id: 0,
            kind,
            source,
            target,
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}
