//! Pull: remote changes into the local database.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinSet;

use revdb_core::{BlobKey, RevId, Revision, RevisionList};
use revdb_store::{AttachmentWriter, Database, ForceInsert};

use super::{sequence_param, BatchOutcome, ChangesPage, DirectionStrategy, ReplicationContext};
use crate::config::{Direction, ReplicationFilter};
use crate::error::{Result, SyncError};
use crate::transport::RemoteRequest;

/// Replicates remote revisions into the local database from the remote
/// `_changes` feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PullStrategy;

#[async_trait]
impl DirectionStrategy for PullStrategy {
    fn direction(&self) -> Direction {
        Direction::Pull
    }

    /// The source must exist; there is nothing to create.
    async fn prepare(&self, ctx: &ReplicationContext) -> Result<()> {
        ctx.remote
            .send_async_request(RemoteRequest::get(Vec::<String>::new()))
            .await?;
        Ok(())
    }

    async fn fetch_changes(
        &self,
        ctx: &ReplicationContext,
        since: Option<Value>,
        limit: usize,
    ) -> Result<ChangesPage> {
        let mut request = RemoteRequest::get(["_changes"])
            .with_query("style", "all_docs")
            .with_query("limit", limit.to_string());
        if let Some(since) = &since {
            request = request.with_query("since", sequence_param(since));
        }
        match &ctx.config.filter {
            None => {}
            Some(ReplicationFilter::DocIds(ids)) => {
                request = request
                    .with_query("filter", "_doc_ids")
                    .with_query("doc_ids", serde_json::to_string(ids)?);
            }
            Some(ReplicationFilter::Named { name, params }) => {
                request = request.with_query("filter", name.clone());
                for (key, value) in params {
                    request = request.with_query(key.clone(), sequence_param(value));
                }
            }
        }

        let body = ctx.remote.send_async_request(request).await?.into_json()?;
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| SyncError::InvalidResponse("_changes without results".into()))?;

        let mut revisions = Vec::new();
        for entry in results {
            let (Some(doc_id), Some(seq)) = (entry.get("id").and_then(Value::as_str), entry.get("seq")) else {
                return Err(SyncError::InvalidResponse(format!("bad _changes entry {entry}")));
            };
            let deleted = entry.get("deleted").and_then(Value::as_bool).unwrap_or(false);
            for change in entry.get("changes").and_then(Value::as_array).into_iter().flatten() {
                let Some(rev) = change.get("rev").and_then(Value::as_str) else {
                    continue;
                };
                let rev = Revision::new(doc_id, RevId::parse(rev)?, deleted);
                revisions.push((rev, seq.clone()));
            }
        }

        let last_seq = body
            .get("last_seq")
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| revisions.last().map(|(_, seq)| seq.clone()));
        Ok(ChangesPage {
            caught_up: results.len() < limit,
            revisions,
            last_seq,
        })
    }

    async fn process_inbox(&self, ctx: &ReplicationContext, batch: RevisionList) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        // 1. Which revisions are new here.
        let mut query: BTreeMap<String, Vec<RevId>> = BTreeMap::new();
        for rev in &batch {
            query.entry(rev.doc_id.clone()).or_default().push(rev.rev_id.clone());
        }
        let diff = ctx.db.transact(move |txn| txn.revs_diff(&query)).await?;

        // 2. Fetch and insert the missing ones. Documents run concurrently;
        //    one document's revisions go in generation order.
        let mut by_doc: BTreeMap<String, Vec<Revision>> = BTreeMap::new();
        for rev in batch {
            let missing = diff
                .get(&rev.doc_id)
                .is_some_and(|entry| entry.missing.contains(&rev.rev_id));
            if missing {
                by_doc.entry(rev.doc_id.clone()).or_default().push(rev);
            } else {
                outcome.succeed(&rev);
            }
        }

        // Declared before `tasks` so aborted downloads are forgotten too.
        let downloads = Downloads::new(Arc::clone(&ctx.db));
        let mut tasks = JoinSet::new();
        for (doc_id, revs) in &mut by_doc {
            revs.sort_by(|a, b| a.rev_id.cmp(&b.rev_id));
            let doc_id = doc_id.clone();
            let revs = revs.clone();
            let ctx = ctx.clone();
            let downloads = downloads.clone();
            tasks.spawn(async move {
                let mut results = Vec::with_capacity(revs.len());
                for rev in revs {
                    let result = pull_revision(&ctx, &rev, &downloads).await;
                    results.push((rev, result));
                }
                (doc_id, results)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((doc_id, results)) => {
                    by_doc.remove(&doc_id);
                    for (rev, result) in results {
                        match result {
                            Ok(()) => outcome.succeed(&rev),
                            Err(e) => outcome.fail(&rev, e),
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "pull task ended abnormally"),
            }
        }
        // Whatever is left belonged to a task that never reported.
        for rev in by_doc.into_values().flatten() {
            outcome.fail(&rev, SyncError::TaskFailed("pull task ended without result".into()));
        }
        Ok(outcome)
    }
}

/// Digests of the attachments a batch started downloading. The database's
/// writer registry forgets them when the last clone drops.
#[derive(Clone)]
struct Downloads {
    inner: Arc<DownloadsInner>,
}

struct DownloadsInner {
    db: Arc<Database>,
    digests: Mutex<Vec<BlobKey>>,
}

impl Downloads {
    fn new(db: Arc<Database>) -> Self {
        Self {
            inner: Arc::new(DownloadsInner {
                db,
                digests: Mutex::new(Vec::new()),
            }),
        }
    }

    fn record(&self, digest: BlobKey) {
        self.inner
            .digests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(digest);
    }
}

impl Drop for DownloadsInner {
    fn drop(&mut self) {
        let digests = self.digests.get_mut().unwrap_or_else(PoisonError::into_inner);
        self.db.forget_attachment_writers(digests.iter());
    }
}

/// Fetch one revision with history and attachments, then insert it.
async fn pull_revision(ctx: &ReplicationContext, change: &Revision, downloads: &Downloads) -> Result<()> {
    let request = RemoteRequest::get([change.doc_id.as_str()])
        .with_query("rev", change.rev_id.to_string())
        .with_query("revs", "true")
        .with_query("attachments", "true");
    let body = ctx.remote.send_async_request(request).await?.into_json()?;
    let props = body
        .as_object()
        .ok_or_else(|| SyncError::InvalidResponse(format!("{} is not an object", change.doc_id)))?;
    let (mut rev, mut history) = Revision::from_properties(props)?;
    if rev.doc_id != change.doc_id || rev.rev_id != change.rev_id {
        return Err(SyncError::InvalidResponse(format!(
            "asked for {} {}, got {} {}",
            change.doc_id, change.rev_id, rev.doc_id, rev.rev_id
        )));
    }
    if history.is_empty() {
        history.push(rev.rev_id.clone());
    }

    for att in rev.attachments.values().filter(|a| a.follows()) {
        let Some(digest) = att.digest else { continue };
        let writer = ctx
            .db
            .remember_attachment_writer(AttachmentWriter::new(digest, att.length));
        downloads.record(digest);
        let request = RemoteRequest::get([rev.doc_id.as_str(), att.name.as_str()])
            .with_query("rev", rev.rev_id.to_string());
        let remote = ctx.remote.clone();
        writer
            .get_or_fetch::<_, _, SyncError>(ctx.db.blob_store(), move || async move {
                remote.send_async_request(request).await?.into_bytes()
            })
            .await?;
        tracing::debug!(doc_id = %rev.doc_id, attachment = %att.name, "downloaded attachment");
    }

    let db = Arc::clone(&ctx.db);
    let inserted = ctx
        .db
        .transact(move |txn| {
            db.inline_following_attachments(&mut rev)?;
            txn.force_insert(&rev, &history)
        })
        .await?;
    match inserted {
        ForceInsert::Inserted(seq) => {
            tracing::debug!(doc_id = %change.doc_id, rev_id = %change.rev_id, seq, "pulled revision");
        }
        ForceInsert::AlreadyPresent(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db() -> (TempDir, Arc<Database>) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path()).unwrap());
        (dir, db)
    }

    #[test]
    fn test_downloads_keep_writers_until_last_clone_drops() {
        let (_dir, db) = open_db();
        let digest = BlobKey::for_bytes(b"photo");
        let downloads = Downloads::new(Arc::clone(&db));
        db.remember_attachment_writer(AttachmentWriter::new(digest, 5));
        downloads.record(digest);

        let other = downloads.clone();
        drop(downloads);
        assert!(db.attachment_writer_for(&digest).is_some());
        drop(other);
        assert!(db.attachment_writer_for(&digest).is_none());
    }

    #[tokio::test]
    async fn test_downloads_forget_writers_when_task_panics() {
        let (_dir, db) = open_db();
        let digest = BlobKey::for_bytes(b"photo");
        let downloads = Downloads::new(Arc::clone(&db));

        let mut tasks = JoinSet::new();
        let task_downloads = downloads.clone();
        let task_db = Arc::clone(&db);
        tasks.spawn(async move {
            task_db.remember_attachment_writer(AttachmentWriter::new(digest, 5));
            task_downloads.record(digest);
            panic!("download task died");
        });
        drop(downloads);

        let joined = tasks.join_next().await.unwrap();
        assert!(joined.unwrap_err().is_panic());
        assert!(db.attachment_writer_for(&digest).is_none());
    }
}
