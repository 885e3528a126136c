//! Database schema migrations for SQLite.
//!
//! Versioned migrations: each step transforms the schema from version N to
//! N+1 and is recorded in `schema_migrations`.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// Idempotent: calling it on an up-to-date database does nothing.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {current} is newer than supported version {CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Database identity (UUIDs) and other singletons
        CREATE TABLE info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One row per document; doc_id is the numeric ID
        CREATE TABLE docs (
            doc_id INTEGER PRIMARY KEY,
            docid TEXT UNIQUE NOT NULL
        );

        -- Revision tree nodes. AUTOINCREMENT keeps sequences unique for the
        -- lifetime of the database file.
        CREATE TABLE revs (
            sequence INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id INTEGER NOT NULL REFERENCES docs(doc_id) ON DELETE CASCADE,
            revid TEXT NOT NULL,
            generation INTEGER NOT NULL,
            parent INTEGER REFERENCES revs(sequence) ON DELETE SET NULL,
            current INTEGER NOT NULL DEFAULT 1,   -- 1 = leaf
            deleted INTEGER NOT NULL DEFAULT 0,
            json BLOB,                            -- NULL for placeholders and pruned bodies
            UNIQUE (doc_id, revid)
        );

        -- Attachment metadata; bytes live in the blob store under key
        CREATE TABLE attachments (
            sequence INTEGER NOT NULL REFERENCES revs(sequence) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            key BLOB NOT NULL,                    -- 32 bytes, blake3 of the content
            type TEXT NOT NULL DEFAULT '',
            length INTEGER NOT NULL,
            revpos INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (sequence, filename)
        );

        -- Local (non-replicated) documents, including checkpoints
        CREATE TABLE localdocs (
            docid TEXT PRIMARY KEY,
            revid TEXT NOT NULL,
            json BLOB NOT NULL
        );

        -- View catalog; index contents belong to the view index collaborator
        CREATE TABLE views (
            view_id INTEGER PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            version TEXT NOT NULL DEFAULT '',
            lastsequence INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_revs_doc_current ON revs(doc_id, current);
        CREATE INDEX idx_revs_parent ON revs(parent);
        CREATE INDEX idx_revs_current_sequence ON revs(current, sequence);
        CREATE INDEX idx_attachments_key ON attachments(key);
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
