//! The reconciliation orchestrator.
//!
//! One `Engine` owns the registry connection, the identity lock manager and
//! the retry discipline. `reconcile` is the single ingress: it serializes
//! same-identity events through the lock manager, runs rules + mutator in
//! one immediate transaction, and restarts on conflict with bounded backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use uuid::Uuid;

use super::locks::{canonical_key, LockManager};
use super::rules::{self, Decision, SqliteView};
use super::{mutator, EngineError, ReconcileEvent};
use crate::config::EngineConfig;
use crate::db::repository;
use crate::db::DatabaseError;
use crate::models::MatchType;

/// Result of a successful reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub match_type: MatchType,
    pub canonical_id: Uuid,
    pub created_new_canonical: bool,
    /// 1 on the happy path; higher when the retry loop fired.
    pub attempts: u32,
}

/// Engine health: storage backlog plus in-process counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineHealth {
    pub backlog: i64,
    pub dead_letters: i64,
    pub last_processed_at: Option<NaiveDateTime>,
    pub processed: u64,
    pub retries: u64,
}

pub struct Engine {
    conn: Mutex<Connection>,
    locks: LockManager,
    config: EngineConfig,
    processed: AtomicU64,
    retries: AtomicU64,
}

impl Engine {
    pub fn new(conn: Connection, config: EngineConfig) -> Self {
        Self {
            conn: Mutex::new(conn),
            locks: LockManager::new(),
            config,
            processed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Run a read (or administrative write) against the registry connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, DatabaseError>,
    ) -> Result<T, EngineError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn).map_err(EngineError::from)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut conn)
    }

    /// Reconcile one raw-record event into the canonical registry.
    ///
    /// Idempotent: replaying an already-reconciled state is a canonical-level
    /// no-op that only appends a `regular_update` audit entry.
    pub fn reconcile(&self, event: &ReconcileEvent) -> Result<ReconcileOutcome, EngineError> {
        event.raw().validate().map_err(EngineError::InvalidRaw)?;

        let deadline = Instant::now() + self.config.reconcile_deadline;
        let mut attempt: u32 = 0;
        loop {
            match self.try_reconcile(event, deadline) {
                Ok(applied) => {
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    return Ok(ReconcileOutcome {
                        match_type: applied.match_type,
                        canonical_id: applied.canonical_id,
                        created_new_canonical: applied.created_new_canonical,
                        attempts: attempt + 1,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.config.retry_cap => {
                    attempt += 1;
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.config.backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        his_number = %event.raw().his_number,
                        "Reconcile conflicted, backing off"
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_reconcile(
        &self,
        event: &ReconcileEvent,
        deadline: Instant,
    ) -> Result<mutator::Applied, EngineError> {
        let _identity_guard = self
            .locks
            .acquire(event.lock_keys(), self.config.lock_timeout)?;

        self.with_conn_mut(|conn| {
            check_deadline(deadline)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(DatabaseError::from)?;

            let decision = rules::decide(event, &SqliteView::new(&tx))?;

            // A merge touches two canonicals; both ids join the lock set
            // before any row moves. The raw's own canonical key is already
            // held by the identity guard and must not be re-acquired.
            let _merge_guard = match &decision {
                Decision::Merge { winner, loser } => {
                    let held = event.lock_keys();
                    let extra: Vec<String> = [canonical_key(winner), canonical_key(loser)]
                        .into_iter()
                        .filter(|key| !held.contains(key))
                        .collect();
                    if extra.is_empty() {
                        None
                    } else {
                        Some(self.locks.acquire(extra, self.config.lock_timeout)?)
                    }
                }
                _ => None,
            };

            check_deadline(deadline)?;
            let applied = mutator::apply(&tx, event, &decision, Utc::now().naive_utc())?;

            check_deadline(deadline)?;
            tx.commit().map_err(DatabaseError::from)?;
            Ok(applied)
        })
    }

    /// The engine-health admin view.
    pub fn health(&self) -> Result<EngineHealth, EngineError> {
        let stats = self.with_conn(repository::backlog_stats)?;
        Ok(EngineHealth {
            backlog: stats.backlog,
            dead_letters: stats.dead_letters,
            last_processed_at: stats.last_processed_at,
            processed: self.processed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        })
    }
}

fn check_deadline(deadline: Instant) -> Result<(), EngineError> {
    if Instant::now() >= deadline {
        return Err(EngineError::DeadlineElapsed);
    }
    Ok(())
}
