//! The view catalog. Index contents belong to a [`ViewIndex`] collaborator;
//! the store only keeps the list of views and their progress.

use rusqlite::{params, OptionalExtension};

use revdb_core::Sequence;

use crate::error::{Result, StoreError};
use crate::txn::Txn;

/// Owner of view index data.
pub trait ViewIndex: Send + Sync {
    /// Drop all index data of `view_name`.
    fn drop_index(&self, view_name: &str) -> std::result::Result<(), String>;
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewInfo {
    pub view_id: i64,
    pub name: String,
    pub version: String,
    pub last_sequence: Sequence,
}

impl Txn<'_> {
    /// Register a view, or update its version. A changed version resets the
    /// view's progress.
    pub fn create_view(&self, name: &str, version: &str) -> Result<ViewInfo> {
        let existing = self.view_named(name)?;
        match existing {
            Some(view) if view.version == version => Ok(view),
            Some(view) => {
                self.conn().execute(
                    "UPDATE views SET version = ?1, lastsequence = 0 WHERE view_id = ?2",
                    params![version, view.view_id],
                )?;
                Ok(ViewInfo {
                    version: version.to_string(),
                    last_sequence: 0,
                    ..view
                })
            }
            None => {
                self.conn().execute(
                    "INSERT INTO views (name, version) VALUES (?1, ?2)",
                    params![name, version],
                )?;
                Ok(ViewInfo {
                    view_id: self.conn().last_insert_rowid(),
                    name: name.to_string(),
                    version: version.to_string(),
                    last_sequence: 0,
                })
            }
        }
    }

    pub fn view_named(&self, name: &str) -> Result<Option<ViewInfo>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT view_id, name, version, lastsequence FROM views WHERE name = ?1",
                params![name],
                |row| {
                    Ok(ViewInfo {
                        view_id: row.get(0)?,
                        name: row.get(1)?,
                        version: row.get(2)?,
                        last_sequence: row.get::<_, i64>(3)? as Sequence,
                    })
                },
            )
            .optional()?)
    }

    /// Record how far the index of `name` has caught up.
    pub fn set_view_last_sequence(&self, name: &str, sequence: Sequence) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE views SET lastsequence = ?1 WHERE name = ?2",
            params![sequence as i64, name],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("view {name}")));
        }
        Ok(())
    }

    /// Remove a view from the catalog and drop its index data.
    ///
    /// If the index collaborator fails, the error rolls the catalog change
    /// back with the rest of the transaction.
    pub fn delete_view(&self, name: &str) -> Result<()> {
        let deleted = self
            .conn()
            .execute("DELETE FROM views WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("view {name}")));
        }
        if let Some(index) = self.database().view_index() {
            index.drop_index(name).map_err(StoreError::ViewIndex)?;
        }
        tracing::debug!(view = name, "deleted view");
        Ok(())
    }
}
