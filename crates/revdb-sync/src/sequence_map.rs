//! Maps tracking IDs to source sequences and finds the checkpointable one.

use std::collections::BTreeMap;

/// Pending entries, keyed by tracking ID.
///
/// Tracking IDs are assigned in increasing order. The checkpointed value is
/// the value of the highest ID such that it and every lower ID have been
/// removed; a pending entry holds back everything after it.
#[derive(Debug, Clone)]
pub struct SequenceMap<T> {
    next_id: u64,
    entries: BTreeMap<u64, Entry<T>>,
    checkpointed: Option<T>,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    done: bool,
}

impl<T: Clone> SequenceMap<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: BTreeMap::new(),
            checkpointed: None,
        }
    }

    /// A map whose checkpoint starts at `checkpointed`.
    pub fn starting_at(checkpointed: Option<T>) -> Self {
        Self {
            checkpointed,
            ..Self::new()
        }
    }

    /// Track `value`; returns its tracking ID.
    pub fn add(&mut self, value: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, Entry { value, done: false });
        id
    }

    /// Mark `id` complete. Returns `true` if the checkpoint advanced.
    pub fn remove(&mut self, id: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => entry.done = true,
            None => return false,
        }
        let mut advanced = false;
        while let Some(entry) = self.entries.first_entry() {
            if !entry.get().done {
                break;
            }
            self.checkpointed = Some(entry.remove().value);
            advanced = true;
        }
        advanced
    }

    /// Value of the highest contiguous completed ID.
    pub fn checkpointed_value(&self) -> Option<&T> {
        self.checkpointed.as_ref()
    }

    /// Value tracked under `id`, while it is still held.
    pub fn value(&self, id: u64) -> Option<&T> {
        self.entries.get(&id).map(|e| &e.value)
    }

    /// Entries not yet covered by the checkpoint, done or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of tracked entries still waiting to complete.
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.done).count()
    }
}

impl<T: Clone> Default for SequenceMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
