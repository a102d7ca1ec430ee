//! Identity Reconciliation Engine.
//!
//! `rules` decides, `mutator` applies, `reconcile` orchestrates the two
//! under the identity lock discipline in `locks`. `protection` carries the
//! administrative matching-lock surface and `worker` drains the staging
//! backlog with a thread pool.

pub mod locks;
pub mod mutator;
pub mod protection;
pub mod reconcile;
pub mod rules;
pub mod worker;

pub use mutator::Applied;
pub use reconcile::{Engine, EngineHealth, ReconcileOutcome};
pub use rules::{CsView, Decision, SqliteView};
pub use worker::{drain_backlog, DrainReport};

use std::time::Duration;

use thiserror::Error;

use crate::db::DatabaseError;
use crate::models::RawPatient;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A concurrent writer claimed a source slot or document pair first.
    /// Handled by the reconcile retry loop; surfaced only past the cap.
    #[error("retryable conflict: {0}")]
    RetryableConflict(String),

    #[error("identity locks not acquired within {0:?}")]
    LockTimeout(Duration),

    /// The raw record violates the ingest contract. Fatal for this event;
    /// the record stays unstamped for triage.
    #[error("invalid raw record: {0}")]
    InvalidRaw(String),

    #[error("reconcile deadline elapsed")]
    DeadlineElapsed,

    #[error("storage failure: {0}")]
    Storage(DatabaseError),
}

impl From<DatabaseError> for EngineError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::UniqueViolation(msg) => EngineError::RetryableConflict(msg),
            other => EngineError::Storage(other),
        }
    }
}

impl EngineError {
    /// Whether the enclosing worker loop should requeue the event.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RetryableConflict(_)
                | EngineError::LockTimeout(_)
                | EngineError::DeadlineElapsed
        )
    }
}

/// One reconciliation trigger: a fresh raw record, or a known record
/// re-emitted by its adapter with changed fields.
#[derive(Debug, Clone)]
pub enum ReconcileEvent {
    Insert { raw: RawPatient },
    Update { old: RawPatient, new: RawPatient },
}

impl ReconcileEvent {
    /// The current raw state the decision runs against.
    pub fn raw(&self) -> &RawPatient {
        match self {
            ReconcileEvent::Insert { raw } => raw,
            ReconcileEvent::Update { new, .. } => new,
        }
    }

    /// Whether the document pair differs between the old and new snapshot.
    pub fn doc_changed(&self) -> bool {
        match self {
            ReconcileEvent::Insert { .. } => false,
            ReconcileEvent::Update { old, new } => {
                (old.doc_type, old.doc_number) != (new.doc_type, new.doc_number)
            }
        }
    }

    /// The identity-lock set for this event: always the (source, his_number)
    /// key, plus the document key(s) involved, plus the already-assigned
    /// canonical. Merge targets are locked separately once known.
    pub fn lock_keys(&self) -> Vec<String> {
        let raw = self.raw();
        let mut keys = vec![locks::source_key(raw.source, &raw.his_number)];
        if let Some((t, n)) = raw.document() {
            keys.push(locks::doc_key(t, n));
        }
        if let ReconcileEvent::Update { old, .. } = self {
            if let Some((t, n)) = old.document() {
                keys.push(locks::doc_key(t, n));
            }
        }
        if let Some(canonical_id) = raw.canonical_id {
            keys.push(locks::canonical_key(&canonical_id));
        }
        keys
    }
}
