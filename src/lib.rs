//! Cohort scoring engine for student assessment spreadsheets.
//!
//! Raw `;`-delimited score sheets are normalized into immutable
//! [`CohortSnapshot`]s, from which the engine derives totals, percentile
//! classifications, per-skill mastery tallies, cross-edition comparisons and
//! superlatives. Every computation is a pure function of its inputs.

pub mod cache;
pub mod compare;
pub mod error;
pub mod ingest;
pub mod mastery;
pub mod metrics;
pub mod models;
pub mod report;
pub mod schema;
pub mod superlative;

pub use cache::SnapshotCache;
pub use compare::{compare_editions, CrossEditionSummary};
pub use error::{EngineError, Result};
pub use ingest::{load_and_normalize, normalize_rows};
pub use mastery::{aggregate_skill_mastery, MasterySummary};
pub use metrics::{compute_metrics, compute_metrics_with, ScoredCohort};
pub use models::{
    ClassLabel, Classification, CohortSnapshot, DerivedMetrics, MasteryDomain, MasteryLevel,
    ScoreRecord, SkillCode, SourceTag, StudentId,
};
pub use schema::{DatasetSchema, MissingPolicy, SchemaPreset, TieMethod};
pub use superlative::{find_superlative, Superlative};
