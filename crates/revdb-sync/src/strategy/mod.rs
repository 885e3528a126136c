//! Direction-specific replication work.
//!
//! The driver in [`crate::replicator`] owns scheduling, checkpoints and
//! retry; a [`DirectionStrategy`] knows how to list changes on the source
//! and how to move one batch of revisions to the target.

mod pull;
mod push;

pub use pull::PullStrategy;
pub use push::PushStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use revdb_core::{Revision, RevisionList};
use revdb_store::Database;

use crate::config::{Direction, ReplicatorConfig};
use crate::error::{Result, SyncError};
use crate::request::RemoteClient;

/// Everything a strategy needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct ReplicationContext {
    pub db: Arc<Database>,
    pub remote: RemoteClient,
    pub config: Arc<ReplicatorConfig>,
}

/// One page of source changes.
#[derive(Debug, Default)]
pub struct ChangesPage {
    /// Changed revisions (metadata only) with their source sequence.
    pub revisions: Vec<(Revision, Value)>,
    /// Source sequence this page reaches, including changes a filter
    /// dropped. `None` when the page is empty.
    pub last_seq: Option<Value>,
    /// No further changes are available right now.
    pub caught_up: bool,
}

/// Result of processing one inbox batch, by tracking ID.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<u64>,
    pub failed: Vec<(u64, SyncError)>,
}

impl BatchOutcome {
    pub fn succeed(&mut self, rev: &Revision) {
        self.succeeded.push(tracking_id(rev));
    }

    pub fn fail(&mut self, rev: &Revision, error: SyncError) {
        tracing::warn!(
            doc_id = %rev.doc_id,
            rev_id = %rev.rev_id,
            error = %error,
            "revision failed"
        );
        self.failed.push((tracking_id(rev), error));
    }
}

/// The tracking ID the driver stored in an inbox revision.
pub fn tracking_id(rev: &Revision) -> u64 {
    rev.sequence.unwrap_or(0)
}

/// Push or pull.
#[async_trait]
pub trait DirectionStrategy: Send + Sync {
    fn direction(&self) -> Direction;

    /// Checks and setup before the first change is fetched.
    async fn prepare(&self, ctx: &ReplicationContext) -> Result<()>;

    /// Up to `limit` source changes after `since`.
    async fn fetch_changes(
        &self,
        ctx: &ReplicationContext,
        since: Option<Value>,
        limit: usize,
    ) -> Result<ChangesPage>;

    /// Transfer one batch. An `Err` fails the whole batch.
    async fn process_inbox(&self, ctx: &ReplicationContext, batch: RevisionList) -> Result<BatchOutcome>;
}

/// The strategy for `direction`.
pub fn strategy_for(direction: Direction) -> Arc<dyn DirectionStrategy> {
    match direction {
        Direction::Push => Arc::new(PushStrategy),
        Direction::Pull => Arc::new(PullStrategy),
    }
}

/// A `_changes` sequence as a query parameter.
pub(crate) fn sequence_param(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
