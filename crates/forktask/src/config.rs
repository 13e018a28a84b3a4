//! Runtime configuration.
//!
//! `spec.md` §6 lists a set of "build-time switches". Axes that change the
//! shape of the protocol (steal discipline, split policy, victim selection,
//! backoff, future flavour) are Cargo features selected at compile time
//! (see `Cargo.toml`); axes that are plain numbers or flags with no
//! type-level impact (`MAXSTEAL`, `MAX_STEAL_ATTEMPTS`, `CHANNEL_CACHE`,
//! `VICTIM_CHECK`, `STEAL_EARLY`) live here as ordinary runtime
//! configuration, mirroring how the teacher crate's `WorkStealingScheduler`
//! reads its worker count from `num_cpus::get()` at construction time.

use crate::error::RuntimeError;
use std::env;

/// Maximum number of steal requests a worker may have outstanding at once.
pub const DEFAULT_MAXSTEAL: usize = 1;

/// Window size (in completed steals) over which the adaptive steal
/// discipline re-evaluates its tasks-per-steal ratio.
pub const STEAL_ADAPTIVE_INTERVAL: usize = 64;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads, including the master.
    pub num_workers: usize,
    /// Maximum outstanding steal requests per worker.
    pub max_steal: usize,
    /// Attempts a steal request makes before becoming a lifeline.
    pub max_steal_attempts: usize,
    /// Capacity of the optional channel recycling cache; `0` disables it.
    pub channel_cache: usize,
    /// Enable the cheap "does the victim look empty" pre-check before
    /// issuing a steal request.
    pub victim_check: bool,
    /// Deque occupancy below which a worker may issue a steal request
    /// early, before actually running dry. `None` disables early stealing.
    pub steal_early: Option<usize>,
    /// Default split-stop threshold for newly created loop tasks.
    pub default_sst: i64,
}

impl RuntimeConfig {
    /// Builds configuration from the environment, matching `spec.md` §6:
    /// `NUM_THREADS` as a decimal integer, defaulting to the online CPU
    /// count when absent.
    pub fn from_env() -> Result<Self, RuntimeError> {
        let num_workers = match env::var("NUM_THREADS") {
            Ok(val) => val.parse::<i64>().map_err(|_| RuntimeError::InvalidWorkerCount(-1))?,
            Err(_) => num_cpus::get() as i64,
        };
        if num_workers < 1 {
            return Err(RuntimeError::InvalidWorkerCount(num_workers));
        }
        Ok(Self {
            num_workers: num_workers as usize,
            max_steal: DEFAULT_MAXSTEAL,
            max_steal_attempts: (num_workers as usize).saturating_sub(1).max(1),
            channel_cache: 0,
            victim_check: false,
            steal_early: None,
            default_sst: 1,
        })
    }

    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }
}

/// Explicit override builder, used by tests that need to run the same
/// workload under several worker counts within one process (e.g. the
/// fibonacci scenario across `N ∈ {1,2,4,8}`).
#[derive(Default)]
pub struct RuntimeConfigBuilder {
    num_workers: Option<usize>,
    max_steal: Option<usize>,
    max_steal_attempts: Option<usize>,
    channel_cache: Option<usize>,
    victim_check: Option<bool>,
    steal_early: Option<usize>,
}

impl RuntimeConfigBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.num_workers = Some(n);
        self
    }

    pub fn max_steal(mut self, n: usize) -> Self {
        self.max_steal = Some(n);
        self
    }

    pub fn max_steal_attempts(mut self, n: usize) -> Self {
        self.max_steal_attempts = Some(n);
        self
    }

    pub fn channel_cache(mut self, n: usize) -> Self {
        self.channel_cache = Some(n);
        self
    }

    pub fn victim_check(mut self, enabled: bool) -> Self {
        self.victim_check = Some(enabled);
        self
    }

    pub fn steal_early(mut self, threshold: usize) -> Self {
        self.steal_early = Some(threshold);
        self
    }

    pub fn build(self) -> Result<RuntimeConfig, RuntimeError> {
        let num_workers = self.num_workers.unwrap_or_else(num_cpus::get);
        if num_workers < 1 {
            return Err(RuntimeError::InvalidWorkerCount(num_workers as i64));
        }
        Ok(RuntimeConfig {
            num_workers,
            max_steal: self.max_steal.unwrap_or(DEFAULT_MAXSTEAL),
            max_steal_attempts: self.max_steal_attempts.unwrap_or_else(|| num_workers.saturating_sub(1).max(1)),
            channel_cache: self.channel_cache.unwrap_or(0),
            victim_check: self.victim_check.unwrap_or(false),
            steal_early: self.steal_early,
            default_sst: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_attempts_to_n_minus_one() {
        let cfg = RuntimeConfig::builder().workers(8).build().unwrap();
        assert_eq!(cfg.max_steal_attempts, 7);
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(RuntimeConfig::builder().workers(0).build().is_err());
    }
}
