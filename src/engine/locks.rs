//! Identity lock manager.
//!
//! Serializes concurrent reconciliations that touch the same identity:
//! the same (source, HIS number) pair, the same document pair, or the same
//! canonical id. Lock sets are acquired all-or-nothing in sorted key order,
//! so two workers can never hold halves of each other's sets.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::EngineError;
use crate::models::Source;

pub fn source_key(source: Source, his_number: &str) -> String {
    format!("src:{}/his:{}", source.as_str(), his_number)
}

pub fn doc_key(doc_type: i32, doc_number: i64) -> String {
    format!("doc:{doc_type}/{doc_number}")
}

pub fn canonical_key(id: &Uuid) -> String {
    format!("can:{id}")
}

/// In-process named lock table keyed on identity-key strings.
#[derive(Debug)]
pub struct LockManager {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    /// Acquire every key in the set, or none. Blocks until the whole set is
    /// free or the timeout elapses.
    pub fn acquire(&self, mut keys: Vec<String>, timeout: Duration) -> Result<LockGuard<'_>, EngineError> {
        keys.sort();
        keys.dedup();

        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if keys.iter().all(|k| !held.contains(k)) {
                for key in &keys {
                    held.insert(key.clone());
                }
                return Ok(LockGuard { manager: self, keys });
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(EngineError::LockTimeout(timeout)),
            };
            let (guard, wait) = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(|e| e.into_inner());
            held = guard;
            if wait.timed_out() && keys.iter().any(|k| held.contains(k)) {
                return Err(EngineError::LockTimeout(timeout));
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases its keys and wakes waiters on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    keys: Vec<String>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .manager
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for key in &self.keys {
            held.remove(key);
        }
        self.manager.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn disjoint_sets_acquire_concurrently() {
        let manager = LockManager::new();
        let a = manager
            .acquire(vec![source_key(Source::Qms, "Q1")], Duration::from_millis(50))
            .unwrap();
        let b = manager
            .acquire(vec![source_key(Source::Infoclinica, "I1")], Duration::from_millis(50))
            .unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn overlapping_set_times_out_while_held() {
        let manager = LockManager::new();
        let _guard = manager
            .acquire(vec![doc_key(1, 1000)], Duration::from_millis(50))
            .unwrap();

        let err = manager
            .acquire(
                vec![source_key(Source::Qms, "Q2"), doc_key(1, 1000)],
                Duration::from_millis(30),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout(_)));
    }

    #[test]
    fn released_keys_unblock_waiters() {
        let manager = Arc::new(LockManager::new());
        let guard = manager
            .acquire(vec![doc_key(1, 2000)], Duration::from_millis(50))
            .unwrap();

        let waiter = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                manager
                    .acquire(vec![doc_key(1, 2000)], Duration::from_secs(5))
                    .map(|g| drop(g))
                    .is_ok()
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn duplicate_keys_collapse() {
        let manager = LockManager::new();
        let guard = manager
            .acquire(
                vec![doc_key(1, 3000), doc_key(1, 3000)],
                Duration::from_millis(50),
            )
            .unwrap();
        assert_eq!(guard.keys.len(), 1);
    }

    #[test]
    fn key_formats_are_stable() {
        let id = Uuid::nil();
        assert_eq!(source_key(Source::Qms, "Q1"), "src:qms/his:Q1");
        assert_eq!(doc_key(1, 1000), "doc:1/1000");
        assert_eq!(canonical_key(&id), format!("can:{id}"));
    }
}
