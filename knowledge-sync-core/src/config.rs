use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::state::DEFAULT_STATE_FILE;

/// Bounded retry parameters applied to every remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: u32,
    /// Delay before the n-th retry. The last entry repeats when attempts outnumber it.
    pub backoff: Vec<Duration>,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// Everything one synchronisation run needs besides the client.
#[derive(Debug, Clone)]
pub struct SynchroniseConfig {
    /// Root whose subdirectories are mirrored as collections.
    pub base_dir: PathBuf,
    /// Where the sync state lives. Defaults to a hidden file in `base_dir`.
    pub state_file: Option<PathBuf>,
    /// Remote operations in flight at once within a collection.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl SynchroniseConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            state_file: None,
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(DEFAULT_STATE_FILE))
    }

    pub fn trace_loaded(&self) {
        info!(
            base_dir = %self.base_dir.display(),
            state_file = %self.state_path().display(),
            concurrency = self.concurrency,
            max_attempts = self.retry.max_attempts,
            "Loaded SynchroniseConfig"
        );
        debug!(?self, "SynchroniseConfig loaded (full debug)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_repeats_last_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: vec![Duration::from_millis(10), Duration::from_millis(20)],
            attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(4), Duration::from_millis(20));
    }

    #[test]
    fn test_empty_backoff_means_no_delay() {
        let policy = RetryPolicy {
            backoff: vec![],
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::ZERO);
    }

    #[test]
    fn test_state_path_defaults_into_base_dir() {
        let mut config = SynchroniseConfig::new("/data/knowledge");
        assert_eq!(
            config.state_path(),
            PathBuf::from("/data/knowledge/.knowledge-sync-state.json")
        );
        config.state_file = Some(PathBuf::from("/var/lib/sync.json"));
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/sync.json"));
    }
}
