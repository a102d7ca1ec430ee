use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "patient-registry";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the application data directory
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join(".patient-registry")
}

/// Default location of the registry database
pub fn registry_db_path() -> PathBuf {
    app_data_dir().join("registry.db")
}

/// Reconciliation tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many times a conflicted reconcile is restarted before the
    /// conflict surfaces to the caller.
    pub retry_cap: u32,
    /// Upper bound on waiting for an identity-lock set.
    pub lock_timeout: Duration,
    /// Wall-clock budget for one `reconcile` call including retries.
    pub reconcile_deadline: Duration,
    /// First retry backoff; doubles per attempt.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_cap: Duration,
    /// Worker threads used by `drain_backlog`.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_cap: 5,
            lock_timeout: Duration::from_secs(30),
            reconcile_deadline: Duration::from_secs(60),
            backoff_base: Duration::from_millis(25),
            backoff_cap: Duration::from_secs(1),
            workers: 4,
        }
    }
}

impl EngineConfig {
    /// Bounded exponential backoff for the given retry attempt (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}
