//! The inbox: revisions waiting to be processed, flushed in FIFO batches.

use std::time::Duration;

use tokio::time::Instant;

use revdb_core::{Revision, RevisionList};

/// Queue of revisions awaiting `process_inbox`.
///
/// A batch is ready once `batch_size` revisions are queued, or when the
/// oldest queued revision has waited `batch_delay`.
#[derive(Debug)]
pub struct Inbox {
    pending: RevisionList,
    batch_size: usize,
    batch_delay: Duration,
    deadline: Option<Instant>,
}

impl Inbox {
    pub fn new(batch_size: usize, batch_delay: Duration) -> Self {
        Self {
            pending: RevisionList::new(),
            batch_size: batch_size.max(1),
            batch_delay,
            deadline: None,
        }
    }

    pub fn add(&mut self, rev: Revision) {
        if self.pending.is_empty() {
            self.deadline = Some(Instant::now() + self.batch_delay);
        }
        self.pending.push(rev);
    }

    pub fn extend(&mut self, revs: RevisionList) {
        for rev in revs {
            self.add(rev);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the current partial batch must be flushed, if anything is queued.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The next full batch, if one is ready.
    pub fn take_full_batch(&mut self) -> Option<RevisionList> {
        if self.pending.len() >= self.batch_size {
            Some(self.take(self.batch_size))
        } else {
            None
        }
    }

    /// The next batch regardless of size; `None` if empty.
    pub fn flush(&mut self) -> Option<RevisionList> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take(self.batch_size))
        }
    }

    pub fn clear(&mut self) {
        self.pending = RevisionList::new();
        self.deadline = None;
    }

    fn take(&mut self, n: usize) -> RevisionList {
        let batch = self.pending.take_front(n);
        self.deadline = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now() + self.batch_delay)
        };
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revdb_core::RevId;

    fn rev(i: u64) -> Revision {
        Revision::new(format!("doc{i}"), RevId::new(1, "a").unwrap(), false).with_sequence(i)
    }

    #[test]
    fn test_full_batches_keep_order() {
        let mut inbox = Inbox::new(2, Duration::from_secs(60));
        assert!(inbox.deadline().is_none());
        for i in 1..=5 {
            inbox.add(rev(i));
        }
        assert!(inbox.deadline().is_some());

        let first = inbox.take_full_batch().unwrap();
        assert_eq!(first.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
        let second = inbox.take_full_batch().unwrap();
        assert_eq!(second.iter().next().unwrap().sequence, Some(3));
        assert!(inbox.take_full_batch().is_none());

        let rest = inbox.flush().unwrap();
        assert_eq!(rest.len(), 1);
        assert!(inbox.is_empty());
        assert!(inbox.deadline().is_none());
        assert!(inbox.flush().is_none());
    }

    #[test]
    fn test_clear() {
        let mut inbox = Inbox::new(10, Duration::from_millis(5));
        inbox.extend(vec![rev(1), rev(2)].into());
        assert_eq!(inbox.len(), 2);
        inbox.clear();
        assert!(inbox.is_empty());
        assert!(inbox.deadline().is_none());
    }
}
