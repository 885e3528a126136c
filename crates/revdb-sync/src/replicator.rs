//! The replicator driver.
//!
//! One tokio task owns all session state. Transfer work (listing changes,
//! processing inbox batches) runs in spawned tasks whose results come back
//! over an mpsc channel tagged with an epoch. Restarting from the checkpoint
//! bumps the epoch: late results are ignored, and the superseded tasks may
//! finish the requests they already sent but cannot start new ones.
//!
//! Going offline closes the [`RequestGate`]. Requests in flight complete;
//! everything else waits, including checkpoint saves.
//!
//! ```text
//!   fetch_changes ──► inbox ──► process_inbox ──► sequence map ──► checkpoint
//!        ▲                            │
//!        └──── more / poll / db change┘
//! ```

use std::future::pending;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use revdb_core::{Revision, RevisionList, Sequence};
use revdb_store::Database;

use crate::checkpoint::{checkpoint_id, Checkpointer};
use crate::config::{Direction, ReplicatorConfig};
use crate::error::{Result, SyncError};
use crate::inbox::Inbox;
use crate::request::{RemoteClient, RequestGate, RequestInfo, RequestRegistry};
use crate::sequence_map::SequenceMap;
use crate::status::{Reachability, ReplicationState, ReplicationStatus};
use crate::strategy::{strategy_for, BatchOutcome, ChangesPage, DirectionStrategy, ReplicationContext};
use crate::transport::RemoteTransport;

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// A configured, not yet started replication.
pub struct Replicator {
    db: Arc<Database>,
    transport: Arc<dyn RemoteTransport>,
    config: ReplicatorConfig,
    reachability: Option<watch::Receiver<Reachability>>,
    checkpoint_id: String,
}

impl Replicator {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn RemoteTransport>,
        config: ReplicatorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let url = config.normalized_url()?;
        let checkpoint_id = checkpoint_id(db.private_uuid(), &url, config.direction, config.filter.as_ref());
        Ok(Self {
            db,
            transport,
            config,
            reachability: None,
            checkpoint_id,
        })
    }

    /// Follow an application-provided reachability signal.
    pub fn with_reachability(mut self, reachability: watch::Receiver<Reachability>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    /// Spawn the driver. Must be called inside a tokio runtime.
    pub fn start(self) -> ReplicatorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ReplicationStatus::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let config = Arc::new(self.config);
        let remote = RemoteClient::new(
            self.transport,
            config.max_concurrent_requests,
            config.request_timeout,
        );
        let registry = Arc::clone(remote.registry());
        let checkpointer = Checkpointer::new(self.checkpoint_id.clone(), Arc::clone(&self.db), remote.clone());
        let ctx = ReplicationContext {
            db: self.db,
            remote,
            config: Arc::clone(&config),
        };

        let driver = Driver {
            strategy: strategy_for(config.direction),
            inbox: Inbox::new(config.batch_size, config.batch_delay),
            ctx,
            checkpointer,
            status: ReplicationStatus::default(),
            status_tx,
            commands: Some(command_rx),
            event_tx,
            event_rx,
            reachability: self.reachability,
            db_changes: None,
            tasks: JoinSet::new(),
            epoch: 0,
            seq_map: SequenceMap::new(),
            since: None,
            started: false,
            fetching: false,
            caught_up: false,
            pending_db_change: false,
            async_tasks: 0,
            batches_in_flight: 0,
            round_error: None,
            checkpoint_deferred: false,
            retry_at: None,
            poll_at: None,
        };
        tracing::info!(
            checkpoint_id = %self.checkpoint_id,
            direction = config.direction.as_str(),
            url = %config.remote_url,
            "starting replicator"
        );
        tokio::spawn(driver.run());

        ReplicatorHandle {
            checkpoint_id: self.checkpoint_id.into(),
            commands: command_tx,
            status: status_rx,
            registry,
        }
    }
}

/// Controls a running replicator. Cloning shares the same replicator.
#[derive(Clone)]
pub struct ReplicatorHandle {
    checkpoint_id: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ReplicationStatus>,
    registry: Arc<RequestRegistry>,
}

impl ReplicatorHandle {
    pub fn checkpoint_id(&self) -> &str {
        &self.checkpoint_id
    }

    pub fn status(&self) -> ReplicationStatus {
        self.status.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<ReplicationStatus> {
        self.status.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.status.borrow().state == ReplicationState::Stopped
    }

    /// Requests currently in flight.
    pub fn outstanding_requests(&self) -> usize {
        self.registry.len()
    }

    pub fn requests_in_flight(&self) -> Vec<RequestInfo> {
        self.registry.outstanding()
    }

    pub fn go_online(&self) {
        let _ = self.commands.send(Command::GoOnline);
    }

    pub fn go_offline(&self) {
        let _ = self.commands.send(Command::GoOffline);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Wait until the status satisfies `f`, returning that status.
    pub async fn wait_for<F>(&self, f: F) -> ReplicationStatus
    where
        F: FnMut(&ReplicationStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let result = rx.wait_for(f).await.map(|s| s.clone());
        match result {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Wait for the replicator to stop; returns the final status.
    pub async fn wait_until_stopped(&self) -> ReplicationStatus {
        self.wait_for(|s| s.state == ReplicationState::Stopped).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    GoOnline,
    GoOffline,
    Stop,
}

// ─────────────────────────────────────────────────────────────────────────────
// Completions
// ─────────────────────────────────────────────────────────────────────────────

enum Work {
    Fetch,
    Batch(Vec<u64>),
}

enum Outcome {
    Fetched(Result<ChangesPage>),
    Processed(Vec<u64>, Result<BatchOutcome>),
    /// The task ended without reporting (panic or abort).
    Lost(Work),
}

struct Event {
    epoch: u64,
    outcome: Outcome,
}

/// Reports a spawned task's result; reports `Lost` if dropped unused.
struct Completion {
    tx: mpsc::UnboundedSender<Event>,
    epoch: u64,
    work: Option<Work>,
}

impl Completion {
    fn fetched(mut self, result: Result<ChangesPage>) {
        self.work = None;
        self.send(Outcome::Fetched(result));
    }

    fn processed(mut self, result: Result<BatchOutcome>) {
        let ids = match self.work.take() {
            Some(Work::Batch(ids)) => ids,
            _ => Vec::new(),
        };
        self.send(Outcome::Processed(ids, result));
    }

    fn send(&self, outcome: Outcome) {
        let _ = self.tx.send(Event {
            epoch: self.epoch,
            outcome,
        });
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(work) = self.work.take() {
            self.send(Outcome::Lost(work));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

struct Driver {
    ctx: ReplicationContext,
    strategy: Arc<dyn DirectionStrategy>,
    checkpointer: Checkpointer,
    status: ReplicationStatus,
    status_tx: watch::Sender<ReplicationStatus>,
    /// `None` once every handle is gone.
    commands: Option<mpsc::UnboundedReceiver<Command>>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    reachability: Option<watch::Receiver<Reachability>>,
    /// Continuous push: local commits.
    db_changes: Option<broadcast::Receiver<Sequence>>,
    tasks: JoinSet<()>,
    epoch: u64,
    inbox: Inbox,
    seq_map: SequenceMap<Value>,
    /// Source sequence the next fetch starts after.
    since: Option<Value>,
    /// Checkpoint loaded and remote prepared.
    started: bool,
    fetching: bool,
    caught_up: bool,
    pending_db_change: bool,
    async_tasks: usize,
    batches_in_flight: usize,
    /// First failure of the current round.
    round_error: Option<Arc<SyncError>>,
    /// The checkpoint advanced while offline and is not saved yet.
    checkpoint_deferred: bool,
    retry_at: Option<Instant>,
    poll_at: Option<Instant>,
}

impl Driver {
    async fn run(mut self) {
        if self.ctx.config.continuous && self.strategy.direction() == Direction::Push {
            self.db_changes = Some(self.ctx.db.subscribe_changes());
        }
        let reachable = self
            .reachability
            .as_ref()
            .map_or(true, |rx| rx.borrow().is_reachable());
        if reachable {
            self.start().await;
        } else {
            self.gate().close();
            self.set_state(ReplicationState::Offline);
        }

        while self.status.state != ReplicationState::Stopped {
            let running = self.status.state == ReplicationState::Running;
            let flush_at = if running { self.inbox.deadline() } else { None };
            let retry_at = self.retry_at;
            let poll_at = if running { self.poll_at } else { None };

            tokio::select! {
                command = recv_command(&mut self.commands) => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.commands = None;
                        if !self.ctx.config.continuous {
                            continue;
                        }
                        tracing::debug!(checkpoint_id = %self.checkpoint_id(), "all handles dropped");
                        self.stop().await;
                    }
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event).await,
                _ = sleep_until_opt(retry_at) => {
                    self.retry_at = None;
                    self.retry().await;
                }
                _ = sleep_until_opt(flush_at) => {
                    if let Some(batch) = self.inbox.flush() {
                        self.dispatch(batch);
                    }
                }
                _ = sleep_until_opt(poll_at) => {
                    self.poll_at = None;
                    self.caught_up = false;
                    self.fetch_next();
                }
                change = recv_db_change(&mut self.db_changes) => match change {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => self.db_changed(),
                    Err(broadcast::error::RecvError::Closed) => self.db_changes = None,
                },
                signal = recv_reachability(&mut self.reachability) => match signal {
                    Some(signal) => self.reachability_changed(signal).await,
                    None => self.reachability = None,
                },
                Some(_) = self.tasks.join_next() => {}
            }
        }
        tracing::info!(checkpoint_id = %self.checkpoint_id(), "replicator stopped");
    }

    fn checkpoint_id(&self) -> &str {
        self.checkpointer.id()
    }

    fn gate(&self) -> &RequestGate {
        self.ctx.remote.gate()
    }

    /// Start a new epoch and admit its requests only.
    fn open_session(&mut self) {
        self.epoch += 1;
        self.ctx.remote.gate().open(self.epoch);
    }

    /// Context for work spawned in the current epoch.
    fn session_ctx(&self) -> ReplicationContext {
        ReplicationContext {
            remote: self.ctx.remote.for_session(self.epoch),
            ..self.ctx.clone()
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────

    fn set_state(&mut self, state: ReplicationState) {
        if self.status.state == state {
            return;
        }
        tracing::info!(
            checkpoint_id = %self.checkpoint_id(),
            from = %self.status.state,
            state = %state,
            "replication state changed"
        );
        self.status.state = state;
        self.publish();
    }

    fn publish(&mut self) {
        self.status_tx.send_replace(self.status.clone());
    }

    /// Load the checkpoint and prepare the remote, then start scanning.
    async fn start(&mut self) {
        self.set_state(ReplicationState::Starting);
        self.open_session();
        let loaded = async {
            if self.ctx.config.reset_checkpoint && !self.started {
                self.checkpointer.reset().await?;
            }
            let checkpoint = self.checkpointer.load().await?;
            self.strategy.prepare(&self.ctx).await?;
            Ok::<_, SyncError>(checkpoint)
        }
        .await;

        match loaded {
            Ok(checkpoint) => {
                tracing::debug!(checkpoint_id = %self.checkpoint_id(), ?checkpoint, "loaded checkpoint");
                self.started = true;
                self.status.checkpoint = checkpoint.clone();
                self.reset_session(checkpoint);
                self.begin_replicating();
            }
            Err(e) if e.is_transient() => {
                self.round_failed(e);
                self.schedule_retry().await;
            }
            Err(e) => self.give_up(Arc::new(e)).await,
        }
    }

    fn begin_replicating(&mut self) {
        self.set_state(ReplicationState::Running);
        self.fetch_next();
    }

    /// Forget all session progress and continue from `checkpoint`.
    ///
    /// Tasks of the previous epoch are left to drain.
    fn reset_session(&mut self, checkpoint: Option<Value>) {
        self.open_session();
        self.inbox.clear();
        self.seq_map = SequenceMap::starting_at(checkpoint.clone());
        self.since = checkpoint;
        self.fetching = false;
        self.caught_up = false;
        self.async_tasks = 0;
        self.batches_in_flight = 0;
        self.round_error = None;
        self.checkpoint_deferred = false;
        self.retry_at = None;
        self.poll_at = None;
        self.status.caught_up = false;
    }

    /// Restart from the last saved checkpoint after a failed round.
    async fn retry(&mut self) {
        match self.status.state {
            ReplicationState::Starting => self.start().await,
            ReplicationState::Running => {
                tracing::info!(
                    checkpoint_id = %self.checkpoint_id(),
                    attempt = self.status.retry_attempt,
                    "retrying from checkpoint"
                );
                self.restart_from_checkpoint();
            }
            _ => {}
        }
    }

    fn restart_from_checkpoint(&mut self) {
        let checkpoint = self.checkpointer.last_saved().cloned();
        self.reset_session(checkpoint);
        self.begin_replicating();
    }

    async fn handle_command(&mut self, command: Command) {
        tracing::debug!(checkpoint_id = %self.checkpoint_id(), ?command, "command");
        match command {
            Command::GoOnline => self.go_online().await,
            Command::GoOffline => self.go_offline(),
            Command::Stop => self.stop().await,
        }
    }

    async fn reachability_changed(&mut self, signal: Reachability) {
        tracing::debug!(checkpoint_id = %self.checkpoint_id(), ?signal, "reachability changed");
        match signal {
            Reachability::Reachable => self.go_online().await,
            Reachability::Unreachable => self.go_offline(),
        }
    }

    fn go_offline(&mut self) {
        if matches!(
            self.status.state,
            ReplicationState::Starting | ReplicationState::Running
        ) {
            // Requests in flight finish normally; nothing new is sent.
            self.gate().close();
            self.retry_at = None;
            self.poll_at = None;
            self.set_state(ReplicationState::Offline);
        }
    }

    async fn go_online(&mut self) {
        if self.status.state != ReplicationState::Offline {
            return;
        }
        if !self.started {
            self.start().await;
            return;
        }
        if std::mem::take(&mut self.checkpoint_deferred) {
            if let Some(value) = self.seq_map.checkpointed_value().cloned() {
                self.open_session();
                if let Err(e) = self.write_checkpoint(value).await {
                    tracing::warn!(
                        checkpoint_id = %self.checkpoint_id(),
                        error = %e,
                        "saving deferred checkpoint failed"
                    );
                }
            }
        }
        self.restart_from_checkpoint();
    }

    async fn stop(&mut self) {
        if self.status.state == ReplicationState::Stopped {
            return;
        }
        self.set_state(ReplicationState::Stopping);
        self.epoch += 1;
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.inbox.clear();
        self.retry_at = None;
        self.poll_at = None;
        self.async_tasks = 0;
        self.set_state(ReplicationState::Stopped);
    }

    async fn give_up(&mut self, error: Arc<SyncError>) {
        tracing::error!(checkpoint_id = %self.checkpoint_id(), error = %error, "giving up");
        self.status.last_error = Some(error);
        self.stop().await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Work dispatch
    // ─────────────────────────────────────────────────────────────────────

    fn async_task_started(&mut self) {
        self.async_tasks += 1;
    }

    fn async_tasks_finished(&mut self, n: usize) {
        self.async_tasks = self.async_tasks.saturating_sub(n);
    }

    fn completion(&self, work: Work) -> Completion {
        Completion {
            tx: self.event_tx.clone(),
            epoch: self.epoch,
            work: Some(work),
        }
    }

    /// Request the next page of changes, if allowed.
    fn fetch_next(&mut self) {
        if self.status.state != ReplicationState::Running
            || self.fetching
            || self.caught_up
            || self.round_error.is_some()
            || self.batches_in_flight >= self.ctx.config.max_concurrent_requests
        {
            return;
        }
        self.fetching = true;
        self.async_task_started();

        let completion = self.completion(Work::Fetch);
        let strategy = Arc::clone(&self.strategy);
        let ctx = self.session_ctx();
        let since = self.since.clone();
        let limit = self.ctx.config.changes_limit;
        self.tasks.spawn(async move {
            let result = strategy.fetch_changes(&ctx, since, limit).await;
            completion.fetched(result);
        });
    }

    fn add_to_inbox(&mut self, rev: Revision) {
        self.inbox.add(rev);
        self.status.changes_total += 1;
        if self.status.state == ReplicationState::Running {
            while let Some(batch) = self.inbox.take_full_batch() {
                self.dispatch(batch);
            }
        }
    }

    fn add_revs_to_inbox(&mut self, revs: RevisionList) {
        for rev in revs {
            self.add_to_inbox(rev);
        }
    }

    fn flush_all(&mut self) {
        if self.status.state != ReplicationState::Running {
            return;
        }
        while let Some(batch) = self.inbox.flush() {
            self.dispatch(batch);
        }
    }

    fn dispatch(&mut self, batch: RevisionList) {
        let ids: Vec<u64> = batch.iter().map(crate::strategy::tracking_id).collect();
        tracing::debug!(
            checkpoint_id = %self.checkpoint_id(),
            size = ids.len(),
            "processing inbox batch"
        );
        self.async_task_started();
        self.batches_in_flight += 1;

        let completion = self.completion(Work::Batch(ids));
        let strategy = Arc::clone(&self.strategy);
        let ctx = self.session_ctx();
        self.tasks.spawn(async move {
            let result = strategy.process_inbox(&ctx, batch).await;
            completion.processed(result);
        });
    }

    fn db_changed(&mut self) {
        self.pending_db_change = true;
        if self.status.state == ReplicationState::Running && self.caught_up && !self.fetching {
            self.pending_db_change = false;
            self.caught_up = false;
            self.fetch_next();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Completions
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_event(&mut self, event: Event) {
        if event.epoch != self.epoch {
            return;
        }
        match event.outcome {
            Outcome::Fetched(result) => {
                self.fetching = false;
                self.async_tasks_finished(1);
                match result {
                    Ok(page) => self.changes_fetched(page).await,
                    Err(e) => self.round_failed(e),
                }
            }
            Outcome::Processed(ids, result) => {
                self.batches_in_flight = self.batches_in_flight.saturating_sub(1);
                self.async_tasks_finished(1);
                match result {
                    Ok(outcome) => self.batch_processed(outcome).await,
                    Err(e) => {
                        let error = Arc::new(e);
                        for id in ids {
                            self.revision_failed(id, Arc::clone(&error));
                        }
                    }
                }
                self.fetch_next();
            }
            Outcome::Lost(work) => {
                self.async_tasks_finished(1);
                let error = Arc::new(SyncError::TaskFailed("task ended without result".into()));
                match work {
                    Work::Fetch => {
                        self.fetching = false;
                        self.round_error.get_or_insert(error);
                    }
                    Work::Batch(ids) => {
                        self.batches_in_flight = self.batches_in_flight.saturating_sub(1);
                        for id in ids {
                            self.revision_failed(id, Arc::clone(&error));
                        }
                    }
                }
            }
        }
        self.publish();
        self.check_quiescent().await;
    }

    async fn changes_fetched(&mut self, page: ChangesPage) {
        let mut revs = RevisionList::new();
        for (mut rev, seq) in page.revisions {
            rev.sequence = Some(self.seq_map.add(seq));
            revs.push(rev);
        }
        self.add_revs_to_inbox(revs);

        if let Some(last_seq) = page.last_seq {
            // Marks the end of the page so filtered changes still advance
            // the checkpoint.
            let marker = self.seq_map.add(last_seq.clone());
            self.since = Some(last_seq);
            if self.seq_map.remove(marker) {
                self.save_checkpoint().await;
            }
        }

        let more_changes = std::mem::take(&mut self.pending_db_change);
        self.caught_up = page.caught_up && !more_changes;
        if page.caught_up {
            self.flush_all();
        }
        self.fetch_next();
    }

    async fn batch_processed(&mut self, outcome: BatchOutcome) {
        let mut advanced = false;
        for id in outcome.succeeded {
            self.status.changes_processed += 1;
            advanced |= self.seq_map.remove(id);
        }
        for (id, error) in outcome.failed {
            self.revision_failed(id, Arc::new(error));
        }
        if advanced {
            self.save_checkpoint().await;
        }
    }

    /// Hold `id` back from the checkpoint and mark the round for retry.
    fn revision_failed(&mut self, id: u64, error: Arc<SyncError>) {
        tracing::warn!(
            checkpoint_id = %self.checkpoint_id(),
            tracking_id = id,
            seq = ?self.seq_map.value(id),
            error = %error,
            "revision not replicated"
        );
        self.status.last_error = Some(Arc::clone(&error));
        self.round_error.get_or_insert(error);
    }

    fn round_failed(&mut self, error: SyncError) {
        tracing::warn!(checkpoint_id = %self.checkpoint_id(), error = %error, "replication round failed");
        let error = Arc::new(error);
        self.status.last_error = Some(Arc::clone(&error));
        self.round_error.get_or_insert(error);
    }

    async fn save_checkpoint(&mut self) {
        let Some(value) = self.seq_map.checkpointed_value().cloned() else {
            return;
        };
        if self.status.state == ReplicationState::Offline {
            tracing::debug!(checkpoint_id = %self.checkpoint_id(), ?value, "offline, checkpoint save deferred");
            self.checkpoint_deferred = true;
            return;
        }
        if let Err(e) = self.write_checkpoint(value).await {
            self.round_failed(e);
        }
    }

    async fn write_checkpoint(&mut self, value: Value) -> Result<()> {
        self.checkpointer.save(&value).await?;
        self.status.checkpoint = Some(value);
        Ok(())
    }

    /// Decide what happens once nothing is in flight.
    async fn check_quiescent(&mut self) {
        if self.async_tasks > 0 || !self.inbox.is_empty() || self.fetching {
            return;
        }
        let state = self.status.state;
        if self.round_error.is_some() {
            if state == ReplicationState::Running {
                self.schedule_retry().await;
            }
            return;
        }
        // Offline never completes; going online rescans from the checkpoint.
        if !self.caught_up || state != ReplicationState::Running {
            return;
        }

        self.status.retry_attempt = 0;
        self.status.caught_up = true;
        self.publish();
        if !self.ctx.config.continuous {
            tracing::info!(
                checkpoint_id = %self.checkpoint_id(),
                processed = self.status.changes_processed,
                "replication complete"
            );
            self.stop().await;
            return;
        }
        match self.strategy.direction() {
            Direction::Push => {
                if std::mem::take(&mut self.pending_db_change) {
                    self.caught_up = false;
                    self.fetch_next();
                }
            }
            Direction::Pull => {
                self.poll_at = Some(Instant::now() + self.ctx.config.poll_interval);
            }
        }
    }

    async fn schedule_retry(&mut self) {
        self.status.retry_attempt += 1;
        self.status.caught_up = false;
        let attempt = self.status.retry_attempt;
        let policy = self.ctx.config.retry.clone();
        if !policy.should_retry(attempt) {
            let error = self
                .round_error
                .take()
                .unwrap_or_else(|| Arc::new(SyncError::Cancelled));
            self.give_up(error).await;
            return;
        }
        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(
            checkpoint_id = %self.checkpoint_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        self.retry_at = Some(Instant::now() + delay);
        self.publish();
    }
}

async fn recv_command(rx: &mut Option<mpsc::UnboundedReceiver<Command>>) -> Option<Command> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn recv_db_change(
    rx: &mut Option<broadcast::Receiver<Sequence>>,
) -> std::result::Result<Sequence, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

/// The new signal, or `None` once the sender is gone.
async fn recv_reachability(rx: &mut Option<watch::Receiver<Reachability>>) -> Option<Reachability> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use tempfile::TempDir;

    use revdb_core::{NewRevision, Properties};
    use revdb_store::ContentOptions;

    use crate::config::RetryPolicy;
    use crate::transport::memory::{FailureRule, InjectedFailure, MemoryPeer};
    use crate::transport::Method;

    const URL: &str = "memory://remote/db";

    struct Pair {
        _dirs: (TempDir, TempDir),
        local: Arc<Database>,
        peer: Arc<MemoryPeer>,
    }

    fn pair() -> Pair {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let local = Arc::new(Database::open(a.path()).unwrap());
        let remote = Arc::new(Database::open(b.path()).unwrap());
        Pair {
            _dirs: (a, b),
            local,
            peer: Arc::new(MemoryPeer::new(URL, remote)),
        }
    }

    fn body(n: u64) -> Properties {
        json!({ "n": n }).as_object().cloned().unwrap()
    }

    fn put_docs(db: &Database, ids: &[&str]) {
        db.in_transaction(|txn| {
            for (i, id) in ids.iter().enumerate() {
                txn.put_revision(NewRevision::new(*id, body(i as u64)), None, false)?;
            }
            Ok(())
        })
        .unwrap();
    }

    fn has_doc(db: &Database, id: &str) -> bool {
        db.in_transaction(|txn| txn.get_document(id, None, ContentOptions::default()))
            .unwrap()
            .is_some()
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_initial_delay(Duration::from_millis(20))
            .with_max_delay(Duration::from_millis(50))
    }

    fn start(p: &Pair, config: ReplicatorConfig) -> ReplicatorHandle {
        Replicator::new(p.local.clone(), p.peer.clone(), config)
            .unwrap()
            .start()
    }

    #[tokio::test]
    async fn test_one_shot_push_copies_and_checkpoints() {
        let p = pair();
        put_docs(&p.local, &["a", "b", "c"]);

        let handle = start(&p, ReplicatorConfig::push(URL).with_batch_size(2));
        let status = handle.wait_until_stopped().await;
        assert!(status.last_error.is_none(), "{:?}", status.last_error);
        assert_eq!(status.changes_processed, 3);
        assert_eq!(status.checkpoint, Some(json!(3)));
        for id in ["a", "b", "c"] {
            assert!(has_doc(&p.peer.database(), id));
        }

        // A second run resumes after the checkpoint.
        let again = start(&p, ReplicatorConfig::push(URL));
        let status = again.wait_until_stopped().await;
        assert_eq!(status.changes_processed, 0);
        assert_eq!(p.peer.request_count(Method::Post, "_bulk_docs"), 2);
    }

    #[tokio::test]
    async fn test_one_shot_pull_copies() {
        let p = pair();
        put_docs(&p.peer.database(), &["x", "y"]);

        let handle = start(&p, ReplicatorConfig::pull(URL));
        let status = handle.wait_until_stopped().await;
        assert!(status.last_error.is_none(), "{:?}", status.last_error);
        assert_eq!(status.changes_processed, 2);
        assert!(has_doc(&p.local, "x"));
        assert!(has_doc(&p.local, "y"));
    }

    #[tokio::test]
    async fn test_pull_of_missing_database_gives_up() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let local = Arc::new(Database::open(a.path()).unwrap());
        let remote = Arc::new(Database::open(b.path()).unwrap());
        let peer = Arc::new(MemoryPeer::new(URL, remote).missing());

        let handle = Replicator::new(local, peer, ReplicatorConfig::pull(URL))
            .unwrap()
            .start();
        let status = handle.wait_until_stopped().await;
        assert!(matches!(
            status.last_error.as_deref(),
            Some(SyncError::Http { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let p = pair();
        put_docs(&p.local, &["a", "b"]);
        p.peer
            .inject(FailureRule::new(InjectedFailure::Status(503)).on(Method::Post).at(["_bulk_docs"]).times(1));

        let handle = start(&p, ReplicatorConfig::push(URL).with_retry(fast_retry(3)));
        let status = handle.wait_until_stopped().await;
        assert_eq!(status.retry_attempt, 0);
        assert_eq!(status.checkpoint, Some(json!(2)));
        assert!(has_doc(&p.peer.database(), "a"));
        assert_eq!(p.peer.request_count(Method::Post, "_bulk_docs"), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let p = pair();
        put_docs(&p.local, &["a"]);
        p.peer.set_reachable(false);

        let handle = start(&p, ReplicatorConfig::push(URL).with_retry(fast_retry(2)));
        let status = handle.wait_until_stopped().await;
        assert_eq!(status.state, ReplicationState::Stopped);
        assert!(matches!(status.last_error.as_deref(), Some(SyncError::Transport(_))));
        assert_eq!(handle.outstanding_requests(), 0);
    }

    #[tokio::test]
    async fn test_continuous_push_follows_new_changes() {
        let p = pair();
        put_docs(&p.local, &["a"]);

        let handle = start(
            &p,
            ReplicatorConfig::push(URL)
                .with_continuous(true)
                .with_batch_delay(Duration::from_millis(10)),
        );
        handle.wait_for(|s| s.caught_up && s.changes_processed == 1).await;
        assert_eq!(handle.status().state, ReplicationState::Running);

        put_docs(&p.local, &["b"]);
        handle.wait_for(|s| s.changes_processed == 2).await;
        assert!(has_doc(&p.peer.database(), "b"));

        handle.stop();
        let status = handle.wait_until_stopped().await;
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_waits_while_unreachable() {
        let p = pair();
        put_docs(&p.local, &["a"]);
        let (signal, rx) = watch::channel(Reachability::Unreachable);

        let handle = Replicator::new(p.local.clone(), p.peer.clone(), ReplicatorConfig::push(URL))
            .unwrap()
            .with_reachability(rx)
            .start();
        handle.wait_for(|s| s.state == ReplicationState::Offline).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(p.peer.requests().is_empty());

        signal.send(Reachability::Reachable).unwrap();
        let status = handle.wait_until_stopped().await;
        assert_eq!(status.changes_processed, 1);
        assert!(has_doc(&p.peer.database(), "a"));
    }
}
