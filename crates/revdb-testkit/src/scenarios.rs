//! Canned revision trees used across the integration tests.

use revdb_core::{Attachment, NewRevision, Revision};

use crate::fixtures::{props, rev, TestDb};
use serde_json::json;

/// Force-insert each branch, given as a history newest first, as if it had
/// been replicated in. Each body records its revision ID under `"from"`.
pub fn insert_branches(db: &TestDb, doc_id: &str, branches: &[&[&str]]) {
    db.in_transaction(|txn| {
        for branch in branches {
            let history: Vec<_> = branch.iter().copied().map(rev).collect();
            let head = history[0].clone();
            let r = Revision::new(doc_id, head.clone(), false)
                .with_parent(history.get(1).cloned())
                .with_body(props(json!({ "from": head.to_string() })));
            txn.force_insert(&r, &history)?;
        }
        Ok(())
    })
    .unwrap_or_else(|e| panic!("branch scenario: {e}"));
}

/// Insert `1-aaa`, then `2-bbb` and the conflicting `2-ccc`.
pub fn insert_conflict(db: &TestDb, doc_id: &str) {
    insert_branches(db, doc_id, &[&["1-aaa"], &["2-bbb", "1-aaa"], &["2-ccc", "1-aaa"]]);
}

/// `doc_id` created with an attachment `photo`, then edited keeping the
/// attachment as a stub. Returns both revisions.
pub fn photo_then_unchanged_edit(db: &TestDb, doc_id: &str, bytes: &[u8]) -> (Revision, Revision) {
    let first = db.put_new(
        NewRevision::new(doc_id, props(json!({ "caption": "original" })))
            .with_attachment(Attachment::inline("photo", "image/jpeg", bytes.to_vec())),
        None,
    );
    let second = db.put_new(
        NewRevision::new(doc_id, props(json!({ "caption": "edited" }))).with_attachment(Attachment::stub("photo")),
        Some(&first.rev_id),
    );
    (first, second)
}

/// Create `count` documents `doc-00`, `doc-01`, ... with `{"n": i}`.
pub fn numbered_docs(db: &TestDb, count: usize) -> Vec<Revision> {
    (0..count)
        .map(|i| db.put(&format!("doc-{i:02}"), props(json!({ "n": i }))))
        .collect()
}
