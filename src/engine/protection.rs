//! Lock Protection Layer — administrative matching freeze, plus the
//! operator-initiated merge.
//!
//! A locked canonical is invisible to every matching lookup: new raw records
//! that would have matched it create fresh canonicals instead, and its own
//! source updates take the regular-update path without the merge check, so a
//! locked canonical can never lose a merge.

use chrono::Utc;
use uuid::Uuid;

use super::locks::{canonical_key, doc_key, source_key};
use super::reconcile::Engine;
use super::{mutator, EngineError};
use crate::db::repository;
use crate::db::DatabaseError;
use crate::models::{CanonicalPatient, MatchType, Source};

/// The identity-lock set guarding one canonical: its id, every populated
/// source slot, and its document pair.
fn identity_keys(canonical: &CanonicalPatient) -> Vec<String> {
    let mut keys = vec![canonical_key(&canonical.canonical_id)];
    for source in Source::ALL {
        if let Some(his_number) = &canonical.slot(source).his_number {
            keys.push(source_key(source, his_number));
        }
    }
    if let Some((doc_type, doc_number)) = canonical.document() {
        keys.push(doc_key(doc_type, doc_number));
    }
    keys
}

impl Engine {
    /// Freeze a canonical against automated matching and merging.
    pub fn lock_matching(&self, canonical_id: &Uuid, reason: &str) -> Result<(), EngineError> {
        self.toggle_lock(canonical_id, Some(reason))
    }

    /// Re-admit a canonical to matching.
    ///
    /// Fails with a conflict if a duplicate document pair was created while
    /// the canonical was locked; resolve with `merge_manual` first.
    pub fn unlock_matching(&self, canonical_id: &Uuid) -> Result<(), EngineError> {
        self.toggle_lock(canonical_id, None)
    }

    fn toggle_lock(&self, canonical_id: &Uuid, reason: Option<&str>) -> Result<(), EngineError> {
        let snapshot = self.load_canonical(canonical_id)?;
        let _guard = self
            .locks()
            .acquire(identity_keys(&snapshot), self.config().lock_timeout)?;

        self.with_conn_mut(|conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(DatabaseError::from)?;
            let mut canonical =
                repository::get_canonical(&tx, canonical_id)?.ok_or_else(|| {
                    EngineError::Storage(DatabaseError::NotFound {
                        entity_type: "CanonicalPatient".into(),
                        id: canonical_id.to_string(),
                    })
                })?;

            match reason {
                Some(reason) => {
                    canonical.matching_locked = true;
                    canonical.locked_at = Some(Utc::now().naive_utc());
                    canonical.lock_reason = Some(reason.to_string());
                }
                None => {
                    canonical.matching_locked = false;
                    canonical.locked_at = None;
                    canonical.lock_reason = None;
                }
            }
            repository::update_canonical(&tx, &canonical)?;
            tx.commit().map_err(DatabaseError::from)?;

            tracing::info!(
                canonical_id = %canonical_id,
                locked = reason.is_some(),
                "Toggled matching lock"
            );
            Ok(())
        })
    }

    /// Operator-initiated merge with an explicit winner.
    ///
    /// A locked canonical may win (that is how a duplicate created during
    /// the freeze gets folded back before unlocking) but never lose.
    pub fn merge_manual(
        &self,
        winner_id: &Uuid,
        loser_id: &Uuid,
    ) -> Result<MatchType, EngineError> {
        if winner_id == loser_id {
            return Err(EngineError::Storage(DatabaseError::ConstraintViolation(
                "cannot merge a canonical into itself".into(),
            )));
        }
        let winner = self.load_canonical(winner_id)?;
        let loser = self.load_canonical(loser_id)?;

        let mut keys = identity_keys(&winner);
        keys.extend(identity_keys(&loser));
        let _guard = self.locks().acquire(keys, self.config().lock_timeout)?;

        self.with_conn_mut(|conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(DatabaseError::from)?;

            for id in [winner_id, loser_id] {
                let current = repository::get_canonical(&tx, id)?.ok_or_else(|| {
                    EngineError::Storage(DatabaseError::NotFound {
                        entity_type: "CanonicalPatient".into(),
                        id: id.to_string(),
                    })
                })?;
                if current.matching_locked && id == loser_id {
                    return Err(EngineError::Storage(DatabaseError::ConstraintViolation(
                        format!("canonical {id} is matching-locked and cannot lose a merge"),
                    )));
                }
            }

            let applied = mutator::merge_manual(&tx, *winner_id, *loser_id, Utc::now().naive_utc())?;
            tx.commit().map_err(DatabaseError::from)?;
            Ok(applied.match_type)
        })
    }

    fn load_canonical(&self, id: &Uuid) -> Result<CanonicalPatient, EngineError> {
        self.with_conn(|conn| repository::get_canonical(conn, id))?
            .ok_or_else(|| {
                EngineError::Storage(DatabaseError::NotFound {
                    entity_type: "CanonicalPatient".into(),
                    id: id.to_string(),
                })
            })
    }
}
