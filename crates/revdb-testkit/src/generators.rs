//! Proptest generators for property-based testing.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::Value;

use revdb_core::{Properties, RevId, Revision};

use crate::fixtures::TestDb;

/// Valid, non-reserved document IDs.
pub fn arb_doc_id() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}"
}

/// Revision IDs with small generations and hex suffixes.
pub fn arb_rev_id() -> impl Strategy<Value = RevId> {
    (1u64..8, "[0-9a-f]{3,8}").prop_map(|(gen, suffix)| {
        RevId::new(gen, suffix).unwrap_or_else(|e| panic!("generated bad revision id: {e}"))
    })
}

/// Leaf sets as `(rev_id, deleted)` pairs, without duplicate IDs.
pub fn arb_leaves() -> impl Strategy<Value = Vec<(RevId, bool)>> {
    prop::collection::vec((arb_rev_id(), any::<bool>()), 1..6).prop_map(|leaves| {
        let mut unique: BTreeMap<RevId, bool> = BTreeMap::new();
        for (rev_id, deleted) in leaves {
            unique.insert(rev_id, deleted);
        }
        unique.into_iter().collect()
    })
}

fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
    ]
}

/// Small document bodies without reserved (`_`-prefixed) keys.
pub fn arb_body() -> impl Strategy<Value = Properties> {
    prop::collection::btree_map("[a-z]{1,6}", arb_scalar(), 0..5)
        .prop_map(|map| map.into_iter().collect())
}

/// One step of an edit script over a handful of documents.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Create the document, or update its current revision.
    Put { doc: usize, body: Properties },
    /// Delete the document if it exists.
    Delete { doc: usize },
}

/// Edit scripts over up to four documents.
pub fn arb_edit_script(max_len: usize) -> impl Strategy<Value = Vec<Edit>> {
    let edit = prop_oneof![
        3 => (0usize..4, arb_body()).prop_map(|(doc, body)| Edit::Put { doc, body }),
        1 => (0usize..4).prop_map(|doc| Edit::Delete { doc }),
    ];
    prop::collection::vec(edit, 1..max_len.max(2))
}

pub fn script_doc_id(doc: usize) -> String {
    format!("doc{doc}")
}

/// Apply `script` through local edits; returns the revisions written.
pub fn apply_edits(db: &TestDb, script: &[Edit]) -> Vec<Revision> {
    let mut written = Vec::new();
    for edit in script {
        match edit {
            Edit::Put { doc, body } => {
                let doc_id = script_doc_id(*doc);
                let rev = match db.get(&doc_id) {
                    Some(current) if !current.deleted => db.update(&doc_id, &current.rev_id, body.clone()),
                    _ => db.put(&doc_id, body.clone()),
                };
                written.push(rev);
            }
            Edit::Delete { doc } => {
                let doc_id = script_doc_id(*doc);
                if let Some(current) = db.get(&doc_id).filter(|r| !r.deleted) {
                    written.push(db.delete(&doc_id, &current.rev_id));
                }
            }
        }
    }
    written
}
