pub mod config;
pub mod error;
pub mod db;
pub mod graph;
pub mod store;
pub mod risk;
pub mod sanctions;

pub use config::Config;
pub use error::{Result, RiskError};
pub use graph::{Collection, EntityRef, KindTable, Relation, RelationGraph, RelationKind};
pub use risk::{Engine, RiskMethod, RunReport};
pub use store::EntityStore;
