//! Push: local changes to the remote.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use revdb_core::{AttachmentData, Properties, RevId, Revision, RevisionList};
use revdb_store::{ContentOptions, RevisionFilter, RevsDiffEntry, StoreError, Txn};

use super::{tracking_id, BatchOutcome, ChangesPage, DirectionStrategy, ReplicationContext};
use crate::config::{Direction, ReplicationFilter};
use crate::error::{Result, SyncError};
use crate::transport::{Method, RemoteRequest};

/// Replicates local revisions to the remote with `_revs_diff` and
/// `_bulk_docs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushStrategy;

enum LocalFilter {
    DocIds(Vec<String>),
    Named(Arc<dyn RevisionFilter>, Properties),
}

fn resolve_filter(ctx: &ReplicationContext) -> Result<Option<LocalFilter>> {
    Ok(match &ctx.config.filter {
        None => None,
        Some(ReplicationFilter::DocIds(ids)) => Some(LocalFilter::DocIds(ids.clone())),
        Some(ReplicationFilter::Named { name, params }) => {
            let filter = ctx
                .db
                .filter(name)
                .ok_or_else(|| SyncError::Config(format!("unknown filter {name:?}")))?;
            Some(LocalFilter::Named(filter, params.clone()))
        }
    })
}

impl PushStrategy {
    /// Create the remote database unless it exists.
    pub async fn maybe_create_remote_db(&self, ctx: &ReplicationContext) -> Result<()> {
        let response = ctx.remote.send(RemoteRequest::get(Vec::<String>::new())).await?;
        if response.is_success() {
            return Ok(());
        }
        if response.status != 404 {
            return response.error_for_status(Method::Get, "/").map(|_| ());
        }
        let response = ctx
            .remote
            .send(RemoteRequest::new(Method::Put, Vec::<String>::new()))
            .await?;
        // 412: created by someone else in the meantime.
        if response.status != 412 {
            response.error_for_status(Method::Put, "/")?;
        }
        tracing::info!(url = %ctx.remote.url(), "created remote database");
        Ok(())
    }
}

#[async_trait]
impl DirectionStrategy for PushStrategy {
    fn direction(&self) -> Direction {
        Direction::Push
    }

    async fn prepare(&self, ctx: &ReplicationContext) -> Result<()> {
        resolve_filter(ctx)?;
        if ctx.config.create_target {
            self.maybe_create_remote_db(ctx).await?;
        } else {
            ctx.remote
                .send_async_request(RemoteRequest::get(Vec::<String>::new()))
                .await?;
        }
        Ok(())
    }

    async fn fetch_changes(
        &self,
        ctx: &ReplicationContext,
        since: Option<Value>,
        limit: usize,
    ) -> Result<ChangesPage> {
        let since_seq = since.as_ref().and_then(Value::as_u64).unwrap_or(0);
        let filter = resolve_filter(ctx)?;

        let (revisions, last_seq, fetched) = ctx
            .db
            .transact(move |txn| {
                let changes = txn.changes_since(since_seq, Some(limit))?;
                let fetched = changes.len();
                let last_seq = changes.max_sequence();
                let mut revisions = Vec::new();
                for change in changes {
                    let keep = match &filter {
                        None => true,
                        Some(LocalFilter::DocIds(ids)) => ids.contains(&change.doc_id),
                        Some(LocalFilter::Named(filter, params)) => {
                            match txn.get_document(
                                &change.doc_id,
                                Some(&change.rev_id),
                                ContentOptions::default(),
                            )? {
                                Some(rev) => filter.matches(&rev, params),
                                // Deletions carry no body; let them through.
                                None => change.deleted,
                            }
                        }
                    };
                    if keep {
                        let seq = json!(change.sequence.unwrap_or(0));
                        revisions.push((change, seq));
                    }
                }
                Ok((revisions, last_seq, fetched))
            })
            .await?;

        Ok(ChangesPage {
            revisions,
            last_seq: last_seq.map(Value::from),
            caught_up: fetched < limit,
        })
    }

    async fn process_inbox(&self, ctx: &ReplicationContext, batch: RevisionList) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        // 1. Ask the remote which revisions it lacks.
        let mut query: BTreeMap<String, Vec<RevId>> = BTreeMap::new();
        for rev in &batch {
            query.entry(rev.doc_id.clone()).or_default().push(rev.rev_id.clone());
        }
        let diff: BTreeMap<String, RevsDiffEntry> = serde_json::from_value(
            ctx.remote
                .send_async_request(RemoteRequest::post(["_revs_diff"], serde_json::to_value(&query)?))
                .await?
                .into_json()?,
        )?;

        let mut to_send = Vec::new();
        for rev in batch {
            let missing = diff
                .get(&rev.doc_id)
                .is_some_and(|entry| entry.missing.contains(&rev.rev_id));
            if missing {
                let ancestors = diff
                    .get(&rev.doc_id)
                    .map(|entry| entry.possible_ancestors.clone())
                    .unwrap_or_default();
                to_send.push((rev, ancestors));
            } else {
                outcome.succeed(&rev);
            }
        }
        if to_send.is_empty() {
            return Ok(outcome);
        }

        // 2. Load bodies, history and attachments.
        let loaded = ctx
            .db
            .transact(move |txn| {
                let mut loaded = Vec::with_capacity(to_send.len());
                for (rev, ancestors) in to_send {
                    let doc = load_for_push(txn, &rev, &ancestors);
                    loaded.push((rev, doc));
                }
                Ok(loaded)
            })
            .await?;

        let mut docs = Vec::new();
        let mut sent = Vec::new();
        for (rev, doc) in loaded {
            match doc {
                Ok(Some(props)) => {
                    docs.push(Value::Object(props));
                    sent.push(rev);
                }
                // Gone locally (compacted or superseded): nothing to send.
                Ok(None) => outcome.succeed(&rev),
                Err(e) => outcome.fail(&rev, e.into()),
            }
        }
        if docs.is_empty() {
            return Ok(outcome);
        }

        // 3. Upload with their history.
        let results = ctx
            .remote
            .send_async_request(RemoteRequest::post(
                ["_bulk_docs"],
                json!({"docs": docs, "new_edits": false}),
            ))
            .await?
            .into_json()?;

        let mut errors: BTreeMap<(String, Option<String>), String> = BTreeMap::new();
        for entry in results.as_array().into_iter().flatten() {
            let Some(error) = entry.get("error").and_then(Value::as_str) else {
                continue;
            };
            let id = entry.get("id").and_then(Value::as_str).unwrap_or_default();
            let rev = entry.get("rev").and_then(Value::as_str).map(str::to_string);
            let reason = entry
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or(error)
                .to_string();
            errors.insert((id.to_string(), rev), reason);
        }

        for rev in sent {
            let reason = errors
                .get(&(rev.doc_id.clone(), Some(rev.rev_id.to_string())))
                .or_else(|| errors.get(&(rev.doc_id.clone(), None)));
            match reason {
                Some(reason) => {
                    let error = SyncError::Rejected {
                        doc_id: rev.doc_id.clone(),
                        reason: reason.clone(),
                    };
                    outcome.fail(&rev, error);
                }
                None => {
                    tracing::debug!(
                        doc_id = %rev.doc_id,
                        rev_id = %rev.rev_id,
                        tracking_id = tracking_id(&rev),
                        "pushed revision"
                    );
                    outcome.succeed(&rev);
                }
            }
        }
        Ok(outcome)
    }
}

/// The wire form of `rev` with `_revisions`, or `None` if its content is
/// gone. Attachments the remote cannot have yet (changed after the newest
/// possible ancestor) go inline; the rest are stubs.
fn load_for_push(
    txn: &Txn<'_>,
    rev: &Revision,
    possible_ancestors: &[RevId],
) -> std::result::Result<Option<Properties>, StoreError> {
    let Some(mut doc) = txn.get_document(&rev.doc_id, Some(&rev.rev_id), ContentOptions::default())? else {
        return Ok(None);
    };
    let known_gen = possible_ancestors
        .iter()
        .map(RevId::generation)
        .max()
        .unwrap_or(0);
    for att in doc.attachments.values_mut() {
        if att.revpos <= known_gen {
            continue;
        }
        let key = att.digest.ok_or_else(|| StoreError::AttachmentNotResolved {
            name: att.name.clone(),
        })?;
        let bytes = txn
            .blobs()
            .read_blob(&key)?
            .ok_or(StoreError::BlobNotFound(key))?;
        att.data = AttachmentData::Inline(bytes);
    }
    let history = txn.get_revision_history(&doc.doc_id, &doc.rev_id)?;
    Ok(Some(doc.to_properties(Some(&history))))
}
