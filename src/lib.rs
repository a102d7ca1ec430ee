//! Canonical patient registry with deterministic cross-HIS identity
//! reconciliation.
//!
//! Raw patient snapshots from heterogeneous hospital information systems
//! land in a staging table; the reconciliation engine folds each one into a
//! single canonical record per real person — matching on HIS identifiers,
//! government documents and mobile pre-registrations, merging canonicals
//! when a late-arriving document proves two records are one patient, and
//! writing an append-only audit log of every decision.

pub mod config;
pub mod db;
pub mod engine;
pub mod models;

pub use config::EngineConfig;
pub use db::DatabaseError;
pub use engine::{drain_backlog, Engine, EngineError, ReconcileEvent};
