//! The transaction capability token.
//!
//! Every store operation is a method on [`Txn`], so it can only run inside
//! a transaction opened by [`Database::in_transaction`] or
//! [`Database::transact`]. Dropping a `Txn` without committing (an `Err`
//! from the closure, or a panic) rolls the transaction back.

use std::cell::Cell;

use rusqlite::{Connection, Transaction};

use revdb_core::Sequence;

use crate::blob_store::BlobStore;
use crate::database::Database;
use crate::error::Result;

/// An open SQLite transaction plus access to the database's collaborators.
pub struct Txn<'a> {
    tx: Transaction<'a>,
    db: &'a Database,
    last_written: Cell<Option<Sequence>>,
}

impl<'a> Txn<'a> {
    pub(crate) fn new(tx: Transaction<'a>, db: &'a Database) -> Self {
        Self {
            tx,
            db,
            last_written: Cell::new(None),
        }
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.tx
    }

    pub(crate) fn database(&self) -> &'a Database {
        self.db
    }

    /// The database's blob store.
    pub fn blobs(&self) -> &'a BlobStore {
        self.db.blob_store()
    }

    /// Record that a revision was written at `sequence`.
    pub(crate) fn note_written(&self, sequence: Sequence) {
        let highest = self.last_written.get().map_or(sequence, |s| s.max(sequence));
        self.last_written.set(Some(highest));
    }

    /// Commit and return the highest sequence written, if any.
    pub(crate) fn commit(self) -> Result<Option<Sequence>> {
        let written = self.last_written.get();
        self.tx.commit()?;
        Ok(written)
    }
}

impl std::fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("database", &self.db.name())
            .field("last_written", &self.last_written.get())
            .finish()
    }
}
