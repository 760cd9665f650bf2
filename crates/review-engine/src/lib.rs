//! Review orchestration engine: stage pipeline, reviewer assignment, score aggregation,
//! PII-aware visibility, and cache/live-update reconciliation for application review.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
