//! Revisions: immutable nodes of a document's revision tree.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::attachment::Attachment;
use crate::body::{strip_special_keys, Properties};
use crate::error::CoreError;
use crate::types::{RevId, Sequence};

/// One revision of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub doc_id: String,
    pub rev_id: RevId,
    pub parent_rev_id: Option<RevId>,
    pub deleted: bool,
    /// Assigned by the store when the revision is written. Inside the
    /// replicator this slot holds the inbox tracking ID instead.
    pub sequence: Option<Sequence>,
    pub body: Option<Properties>,
    pub attachments: BTreeMap<String, Attachment>,
}

impl Revision {
    /// A revision without body, sequence or attachments.
    pub fn new(doc_id: impl Into<String>, rev_id: RevId, deleted: bool) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id,
            parent_rev_id: None,
            deleted,
            sequence: None,
            body: None,
            attachments: BTreeMap::new(),
        }
    }

    pub fn with_parent(mut self, parent: Option<RevId>) -> Self {
        self.parent_rev_id = parent;
        self
    }

    pub fn with_body(mut self, body: Properties) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.insert(attachment.name.clone(), attachment);
        self
    }

    pub fn generation(&self) -> u64 {
        self.rev_id.generation()
    }

    /// Digests of all attachments with known content, ordered by name.
    pub fn attachment_digests(&self) -> Vec<String> {
        self.attachments
            .values()
            .filter_map(Attachment::digest_string)
            .collect()
    }

    /// The JSON form used on the wire: user properties plus `_id`, `_rev`,
    /// `_deleted`, `_attachments` and, when `history` is given, `_revisions`.
    pub fn to_properties(&self, history: Option<&[RevId]>) -> Properties {
        let mut props = self
            .body
            .as_ref()
            .map(strip_special_keys)
            .unwrap_or_default();
        props.insert("_id".into(), Value::String(self.doc_id.clone()));
        props.insert("_rev".into(), Value::String(self.rev_id.to_string()));
        if self.deleted {
            props.insert("_deleted".into(), Value::Bool(true));
        }
        if !self.attachments.is_empty() {
            let atts: Properties = self
                .attachments
                .iter()
                .map(|(name, att)| (name.clone(), att.to_json()))
                .collect();
            props.insert("_attachments".into(), Value::Object(atts));
        }
        if let Some(history) = history {
            props.insert("_revisions".into(), encode_history(history));
        }
        props
    }

    /// Parse the wire JSON form. Returns the revision and its `_revisions`
    /// history (newest first, empty when absent).
    pub fn from_properties(props: &Properties) -> Result<(Self, Vec<RevId>), CoreError> {
        let doc_id = props
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedDocument("missing _id".into()))?;
        let rev_id: RevId = props
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::MalformedDocument("missing _rev".into()))?
            .parse()?;
        let deleted = props
            .get("_deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut attachments = BTreeMap::new();
        if let Some(atts) = props.get("_attachments") {
            let atts = atts
                .as_object()
                .ok_or_else(|| CoreError::MalformedDocument("_attachments not an object".into()))?;
            for (name, value) in atts {
                attachments.insert(name.clone(), Attachment::from_json(name, value)?);
            }
        }

        let history = match props.get("_revisions") {
            Some(value) => decode_history(value)?,
            None => Vec::new(),
        };
        if !history.is_empty() && history[0] != rev_id {
            return Err(CoreError::MalformedDocument(
                "_revisions does not start with _rev".into(),
            ));
        }

        let rev = Self {
            doc_id: doc_id.to_string(),
            parent_rev_id: history.get(1).cloned(),
            rev_id,
            deleted,
            sequence: None,
            body: Some(strip_special_keys(props)),
            attachments,
        };
        Ok((rev, history))
    }
}

/// A revision that has not been written yet and has no revision ID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRevision {
    pub doc_id: String,
    pub deleted: bool,
    pub body: Option<Properties>,
    pub attachments: BTreeMap<String, Attachment>,
}

impl NewRevision {
    pub fn new(doc_id: impl Into<String>, body: Properties) -> Self {
        Self {
            doc_id: doc_id.into(),
            deleted: false,
            body: Some(body),
            attachments: BTreeMap::new(),
        }
    }

    /// A deletion (tombstone) of `doc_id`.
    pub fn deletion(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            deleted: true,
            body: None,
            attachments: BTreeMap::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.insert(attachment.name.clone(), attachment);
        self
    }
}

/// Encode a newest-first history as `{"start": gen, "ids": [suffix, ...]}`.
pub fn encode_history(history: &[RevId]) -> Value {
    let start = history.first().map_or(0, RevId::generation);
    let ids: Vec<&str> = history.iter().map(RevId::suffix).collect();
    json!({ "start": start, "ids": ids })
}

/// Decode `_revisions` into revision IDs, newest first.
pub fn decode_history(value: &Value) -> Result<Vec<RevId>, CoreError> {
    let bad = |m: &str| CoreError::MalformedDocument(format!("_revisions: {m}"));
    let start = value
        .get("start")
        .and_then(Value::as_u64)
        .ok_or_else(|| bad("missing start"))?;
    let ids = value
        .get("ids")
        .and_then(Value::as_array)
        .ok_or_else(|| bad("missing ids"))?;
    if ids.len() as u64 > start {
        return Err(bad("more ids than generations"));
    }
    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let suffix = id.as_str().ok_or_else(|| bad("id not a string"))?;
            RevId::new(start - i as u64, suffix)
        })
        .collect()
}

/// An ordered collection of revisions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevisionList(Vec<Revision>);

impl RevisionList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, rev: Revision) {
        self.0.push(rev);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Revision> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Revision] {
        &self.0
    }

    /// Distinct document IDs in first-seen order.
    pub fn all_doc_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.0
            .iter()
            .filter(|r| seen.insert(r.doc_id.as_str()))
            .map(|r| r.doc_id.clone())
            .collect()
    }

    /// Look up a revision by document and revision ID.
    pub fn find(&self, doc_id: &str, rev_id: &RevId) -> Option<&Revision> {
        self.0
            .iter()
            .find(|r| r.doc_id == doc_id && &r.rev_id == rev_id)
    }

    /// Remove and return a revision.
    pub fn remove(&mut self, doc_id: &str, rev_id: &RevId) -> Option<Revision> {
        let pos = self
            .0
            .iter()
            .position(|r| r.doc_id == doc_id && &r.rev_id == rev_id)?;
        Some(self.0.remove(pos))
    }

    /// Stable sort by sequence, revisions without one last.
    pub fn sort_by_sequence(&mut self) {
        self.0
            .sort_by_key(|r| r.sequence.unwrap_or(Sequence::MAX));
    }

    /// Keep at most `n` revisions.
    pub fn limit(&mut self, n: usize) {
        self.0.truncate(n);
    }

    /// Split off the first `n` revisions, preserving order.
    pub fn take_front(&mut self, n: usize) -> RevisionList {
        let n = n.min(self.0.len());
        let rest = self.0.split_off(n);
        RevisionList(std::mem::replace(&mut self.0, rest))
    }

    /// Highest assigned sequence, if any.
    pub fn max_sequence(&self) -> Option<Sequence> {
        self.0.iter().filter_map(|r| r.sequence).max()
    }

    /// All revision IDs in list order.
    pub fn rev_ids(&self) -> Vec<RevId> {
        self.0.iter().map(|r| r.rev_id.clone()).collect()
    }
}

impl From<Vec<Revision>> for RevisionList {
    fn from(revs: Vec<Revision>) -> Self {
        Self(revs)
    }
}

impl FromIterator<Revision> for RevisionList {
    fn from_iter<I: IntoIterator<Item = Revision>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<Revision> for RevisionList {
    fn extend<I: IntoIterator<Item = Revision>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for RevisionList {
    type Item = Revision;
    type IntoIter = std::vec::IntoIter<Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a RevisionList {
    type Item = &'a Revision;
    type IntoIter = std::slice::Iter<'a, Revision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(doc: &str, id: &str, seq: u64) -> Revision {
        Revision::new(doc, RevId::parse(id).unwrap(), false).with_sequence(seq)
    }

    #[test]
    fn test_properties_roundtrip_with_history() {
        let history = vec![
            RevId::parse("3-c").unwrap(),
            RevId::parse("2-b").unwrap(),
            RevId::parse("1-a").unwrap(),
        ];
        let mut body = Properties::new();
        body.insert("title".into(), json!("hello"));
        let original = Revision::new("doc", history[0].clone(), false).with_body(body);

        let props = original.to_properties(Some(&history));
        assert_eq!(props["_revisions"], json!({"start": 3, "ids": ["c", "b", "a"]}));

        let (parsed, parsed_history) = Revision::from_properties(&props).unwrap();
        assert_eq!(parsed_history, history);
        assert_eq!(parsed.parent_rev_id, Some(history[1].clone()));
        assert_eq!(parsed.body.unwrap()["title"], "hello");
    }

    #[test]
    fn test_history_must_start_at_rev() {
        let mut props = Properties::new();
        props.insert("_id".into(), json!("doc"));
        props.insert("_rev".into(), json!("2-b"));
        props.insert("_revisions".into(), json!({"start": 2, "ids": ["x", "a"]}));
        assert!(Revision::from_properties(&props).is_err());
    }

    #[test]
    fn test_list_take_front_preserves_order() {
        let mut list: RevisionList = (1..=5).map(|i| rev("d", &format!("{i}-a"), i)).collect();
        let front = list.take_front(2);
        assert_eq!(front.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter().next().unwrap().sequence, Some(3));
    }

    #[test]
    fn test_list_doc_ids_and_remove() {
        let mut list: RevisionList = vec![rev("a", "1-x", 1), rev("b", "1-y", 2), rev("a", "2-z", 3)].into();
        assert_eq!(list.all_doc_ids(), vec!["a".to_string(), "b".to_string()]);
        let removed = list.remove("a", &RevId::parse("2-z").unwrap()).unwrap();
        assert_eq!(removed.sequence, Some(3));
        assert!(list.find("a", &RevId::parse("2-z").unwrap()).is_none());
        assert_eq!(list.max_sequence(), Some(2));
    }
}
