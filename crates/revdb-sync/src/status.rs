//! Replication state and progress, published on a watch channel.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::SyncError;

/// Lifecycle of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationState {
    Idle,
    /// Loading the checkpoint and preparing the remote.
    Starting,
    Running,
    /// Suspended until the remote is reachable again.
    Offline,
    Stopping,
    Stopped,
}

impl ReplicationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Offline => "offline",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Offline)
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a replicator's progress.
#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    pub state: ReplicationState,
    /// Revisions transferred (or found already present) so far.
    pub changes_processed: u64,
    /// Revisions queued for transfer so far.
    pub changes_total: u64,
    /// Last saved checkpoint.
    pub checkpoint: Option<Value>,
    /// Most recent failure. When the replicator stops because it gave up,
    /// this is the reason.
    pub last_error: Option<Arc<SyncError>>,
    /// Consecutive failed rounds.
    pub retry_attempt: u32,
    /// Whether the replicator had caught up at the last check.
    pub caught_up: bool,
}

impl Default for ReplicationStatus {
    fn default() -> Self {
        Self {
            state: ReplicationState::Idle,
            changes_processed: 0,
            changes_total: 0,
            checkpoint: None,
            last_error: None,
            retry_attempt: 0,
            caught_up: false,
        }
    }
}

/// Network reachability of the remote, as reported by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

impl Reachability {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable)
    }
}
