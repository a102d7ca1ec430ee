//! Worker pool draining the raw-record staging backlog.
//!
//! Each worker pulls one pending raw id at a time and runs `reconcile`.
//! Retryable outcomes requeue with a bounded budget, contract violations
//! dead-letter, storage failures stop the worker.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;

use super::reconcile::Engine;
use super::{EngineError, ReconcileEvent};
use crate::db::repository;

/// How many times a retryable event is put back on the queue before it is
/// dead-lettered. The engine already retries internally per attempt.
const MAX_REQUEUES: u32 = 3;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct DrainReport {
    pub processed: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub storage_failures: u64,
}

/// Reconcile every unprocessed raw record with `workers` threads.
pub fn drain_backlog(engine: &Engine, workers: usize) -> Result<DrainReport, EngineError> {
    let ids = engine.with_conn(|conn| repository::pending_raw_ids(conn, i64::MAX))?;
    if ids.is_empty() {
        return Ok(DrainReport::default());
    }
    tracing::info!(backlog = ids.len(), workers, "Draining raw-record backlog");

    let queue: Mutex<VecDeque<(i64, u32)>> =
        Mutex::new(ids.into_iter().map(|id| (id, 0)).collect());
    let report = Mutex::new(DrainReport::default());

    std::thread::scope(|scope| {
        for _ in 0..workers.max(1) {
            scope.spawn(|| worker_loop(engine, &queue, &report));
        }
    });

    let report = report.into_inner().unwrap_or_else(|e| e.into_inner());
    tracing::info!(
        processed = report.processed,
        dead_lettered = report.dead_lettered,
        "Backlog drain finished"
    );
    Ok(report)
}

fn worker_loop(engine: &Engine, queue: &Mutex<VecDeque<(i64, u32)>>, report: &Mutex<DrainReport>) {
    loop {
        let next = {
            let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.pop_front()
        };
        let Some((raw_id, requeues)) = next else {
            return;
        };

        let raw = match engine.with_conn(|conn| repository::get_raw(conn, raw_id)) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(raw_id, error = %e, "Worker stopping: cannot load raw record");
                bump(report, |r| r.storage_failures += 1);
                return;
            }
        };
        if raw.processed_at.is_some() {
            // Another worker (or a previous drain) already got here.
            continue;
        }

        let event = ReconcileEvent::Insert { raw };
        match engine.reconcile(&event) {
            Ok(outcome) => {
                tracing::debug!(
                    raw_id,
                    match_type = outcome.match_type.as_str(),
                    canonical_id = %outcome.canonical_id,
                    "Reconciled raw record"
                );
                bump(report, |r| r.processed += 1);
            }
            Err(e) if e.is_retryable() => {
                if requeues < MAX_REQUEUES {
                    bump(report, |r| r.requeued += 1);
                    let mut queue = queue.lock().unwrap_or_else(|e| e.into_inner());
                    queue.push_back((raw_id, requeues + 1));
                } else {
                    dead_letter(engine, report, raw_id, &format!("retry budget exhausted: {e}"));
                }
            }
            Err(EngineError::InvalidRaw(reason)) => {
                dead_letter(engine, report, raw_id, &reason);
            }
            Err(e) => {
                tracing::error!(raw_id, error = %e, "Worker stopping on storage failure");
                bump(report, |r| r.storage_failures += 1);
                return;
            }
        }
    }
}

fn dead_letter(engine: &Engine, report: &Mutex<DrainReport>, raw_id: i64, reason: &str) {
    tracing::warn!(raw_id, reason, "Dead-lettering raw record");
    let result = engine.with_conn(|conn| {
        repository::insert_dead_letter(conn, raw_id, reason, Utc::now().naive_utc())
    });
    if let Err(e) = result {
        tracing::error!(raw_id, error = %e, "Failed to write dead letter");
    }
    bump(report, |r| r.dead_lettered += 1);
}

fn bump(report: &Mutex<DrainReport>, f: impl FnOnce(&mut DrainReport)) {
    let mut report = report.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::repository::{insert_raw, list_dead_letters, matching_stats};
    use crate::db::sqlite::open_memory_database;
    use crate::models::{NewRawPatient, Source};

    fn seed(engine: &Engine, source: Source, his: &str, doc: Option<(i32, i64)>) {
        engine
            .with_conn(|conn| {
                insert_raw(
                    conn,
                    &NewRawPatient {
                        his_number: his.into(),
                        source,
                        doc_type: doc.map(|d| d.0),
                        doc_number: doc.map(|d| d.1.to_string()),
                        ..NewRawPatient::default()
                    },
                )
            })
            .unwrap();
    }

    #[test]
    fn drains_mixed_backlog_with_dead_letters() {
        let engine = Engine::new(open_memory_database().unwrap(), EngineConfig::default());
        seed(&engine, Source::Qms, "Q1", Some((1, 1000)));
        seed(&engine, Source::Infoclinica, "I1", Some((1, 1000)));
        seed(&engine, Source::Qms, "Q2", None);
        // Contract violation: blank HIS number
        engine
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO raw_patient (his_number, source) VALUES ('  ', 'qms')",
                    [],
                )
                .map_err(Into::into)
            })
            .unwrap();

        let report = drain_backlog(&engine, 2).unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.storage_failures, 0);

        // The two same-document raws landed on one canonical
        let stats = engine.with_conn(matching_stats).unwrap();
        assert_eq!(stats.total_canonicals, 2);
        assert_eq!(stats.multi_source_canonicals, 1);

        let letters = engine.with_conn(list_dead_letters).unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].reason.contains("his_number"));

        // Backlog empty except the dead-lettered record, which stays
        // unstamped for triage
        assert_eq!(engine.health().unwrap().backlog, 1);
    }

    #[test]
    fn drain_is_safe_to_run_twice() {
        let engine = Engine::new(open_memory_database().unwrap(), EngineConfig::default());
        seed(&engine, Source::Qms, "Q5", None);

        let first = drain_backlog(&engine, 2).unwrap();
        assert_eq!(first.processed, 1);
        let second = drain_backlog(&engine, 2).unwrap();
        assert_eq!(second.processed, 0);

        let stats = engine.with_conn(matching_stats).unwrap();
        assert_eq!(stats.total_canonicals, 1);
    }

    #[test]
    fn empty_backlog_is_a_noop() {
        let engine = Engine::new(open_memory_database().unwrap(), EngineConfig::default());
        let report = drain_backlog(&engine, 4).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.dead_lettered, 0);
    }
}
