//! Scheduler configuration.

use std::time::Duration;

/// Configuration for stores, the LRT limiter and the dispatcher.
///
/// Built once at startup and injected into every component; there is no
/// global settings registry.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default timeout for an activated task.
    pub task_timeout: Duration,

    /// Maximum number of LRT contexts draining concurrently.
    pub lrt_context_limit: usize,

    /// Minimum delay for rescheduled LRT submissions.
    pub lrt_min_retry_delay: Duration,

    /// Maximum delay for rescheduled LRT submissions.
    pub lrt_max_retry_delay: Duration,

    /// Completed persistent tasks older than this are archived away.
    pub archive_after: Duration,

    /// When true an external maintenance job owns cleanup and the
    /// opportunistic archival sweep is skipped.
    pub auto_maintenance: bool,

    /// Number of dispatcher workers executing named hooks.
    pub dispatch_workers: usize,

    /// Bound of the dispatch queue; submissions wait when it is full.
    pub dispatch_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(900),
            lrt_context_limit: 1,
            lrt_min_retry_delay: Duration::from_secs(10),
            lrt_max_retry_delay: Duration::from_secs(120),
            archive_after: Duration::from_secs(28 * 86_400),
            auto_maintenance: false,
            dispatch_workers: 4,
            dispatch_queue_depth: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.task_timeout, Duration::from_secs(900));
        assert_eq!(config.lrt_context_limit, 1);
        assert_eq!(config.lrt_min_retry_delay, Duration::from_secs(10));
        assert_eq!(config.lrt_max_retry_delay, Duration::from_secs(120));
        assert_eq!(config.archive_after, Duration::from_secs(2_419_200));
        assert!(!config.auto_maintenance);
    }
}
