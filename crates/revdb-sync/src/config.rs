//! Replicator configuration.

use std::time::Duration;

use revdb_core::Properties;
use url::Url;

use crate::error::{Result, SyncError};

/// Which way revisions flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local database to remote.
    Push,
    /// Remote database to local.
    Pull,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
        }
    }
}

/// Restricts which documents replicate.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFilter {
    /// Only these document IDs.
    DocIds(Vec<String>),
    /// A filter registered under `name`, with parameters.
    ///
    /// Push looks it up with `Database::filter`; pull forwards name and
    /// parameters to the remote `_changes` feed.
    Named { name: String, params: Properties },
}

impl ReplicationFilter {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named {
            name: name.into(),
            params: Properties::new(),
        }
    }

    /// Stable text form, part of the checkpoint ID.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::DocIds(ids) => {
                let mut ids = ids.clone();
                ids.sort();
                format!("doc_ids:{}", ids.join(","))
            }
            Self::Named { name, params } => {
                // Properties is a sorted map, so this is canonical.
                let params = serde_json::to_string(params).unwrap_or_default();
                format!("filter:{name}:{params}")
            }
        }
    }
}

/// Backoff between failed replication rounds.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Consecutive failed rounds tolerated before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (1-based). Non-decreasing in
    /// `attempt` and never above `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Whether a round that failed as attempt `attempt` may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

/// Configuration for one replication.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// URL of the remote database.
    pub remote_url: String,
    pub direction: Direction,
    pub filter: Option<ReplicationFilter>,
    /// Revisions per inbox batch.
    pub batch_size: usize,
    /// How long a partial batch waits before it is flushed.
    pub batch_delay: Duration,
    /// Changes fetched per page.
    pub changes_limit: usize,
    /// Requests in flight at once.
    pub max_concurrent_requests: usize,
    /// Push only: create the remote database if it is missing.
    pub create_target: bool,
    /// Keep running after catching up.
    pub continuous: bool,
    /// Discard the local checkpoint on start and replicate from zero.
    pub reset_checkpoint: bool,
    /// Continuous pull: how often `_changes` is polled once caught up.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ReplicatorConfig {
    pub fn new(remote_url: impl Into<String>, direction: Direction) -> Self {
        Self {
            remote_url: remote_url.into(),
            direction,
            filter: None,
            batch_size: 100,
            batch_delay: Duration::from_millis(500),
            changes_limit: 100,
            max_concurrent_requests: 4,
            create_target: false,
            continuous: false,
            reset_checkpoint: false,
            poll_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    pub fn push(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Push)
    }

    pub fn pull(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Pull)
    }

    pub fn with_filter(mut self, filter: ReplicationFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_changes_limit(mut self, limit: usize) -> Self {
        self.changes_limit = limit;
        self
    }

    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n;
        self
    }

    pub fn with_create_target(mut self, create: bool) -> Self {
        self.create_target = create;
        self
    }

    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn with_reset_checkpoint(mut self, reset: bool) -> Self {
        self.reset_checkpoint = reset;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The remote URL parsed and normalized (trailing slash removed).
    pub fn normalized_url(&self) -> Result<String> {
        let url = Url::parse(&self.remote_url)
            .map_err(|e| SyncError::Config(format!("remote url {:?}: {e}", self.remote_url)))?;
        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    /// Reject configurations the replicator cannot run.
    pub fn validate(&self) -> Result<()> {
        self.normalized_url()?;
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be positive".into()));
        }
        if self.changes_limit == 0 {
            return Err(SyncError::Config("changes_limit must be positive".into()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(SyncError::Config("max_concurrent_requests must be positive".into()));
        }
        if self.create_target && self.direction == Direction::Pull {
            return Err(SyncError::Config("create_target only applies to push".into()));
        }
        Ok(())
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self::new("", Direction::Push)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_grow_and_cap() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
        assert!(policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn test_retry_delays_non_decreasing() {
        let policy = RetryPolicy::default().with_multiplier(0.5);
        let delays: Vec<_> = (1..10).map(|n| policy.delay_for_attempt(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_validate() {
        assert!(ReplicatorConfig::push("http://host:5984/db").validate().is_ok());
        assert!(ReplicatorConfig::push("not a url").validate().is_err());
        assert!(ReplicatorConfig::push("http://h/db").with_batch_size(0).validate().is_err());
        assert!(ReplicatorConfig::pull("http://h/db")
            .with_create_target(true)
            .validate()
            .is_err());
    }

    #[test]
    fn test_normalized_url_drops_trailing_slash() {
        let a = ReplicatorConfig::push("http://host/db/").normalized_url().unwrap();
        let b = ReplicatorConfig::push("http://host/db").normalized_url().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_filter_fingerprint_ignores_id_order() {
        let a = ReplicationFilter::DocIds(vec!["b".into(), "a".into()]);
        let b = ReplicationFilter::DocIds(vec!["a".into(), "b".into()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), ReplicationFilter::named("a,b").fingerprint());
    }
}
