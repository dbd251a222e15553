//! SQLite persistence for the local control plane
//!
//! Documents are stored whole, keyed by their resource id. Every write bumps
//! the generation and mints a fresh etag. Asynchronous operations live in
//! their own table so they can be polled until they settle.

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for control plane state
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Remote documents (firewalls, policies, rule collection groups)
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                body TEXT NOT NULL,
                etag TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_documents_kind ON documents(kind);

            -- Long-running operations
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                kind TEXT NOT NULL,
                document_kind TEXT,
                body TEXT,
                existed_at_submit INTEGER NOT NULL,
                state TEXT NOT NULL,
                polls_remaining INTEGER NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_operations_target ON operations(target);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Insert or replace a document, returning the stored row
    pub fn put_document(&self, id: &str, kind: &str, body: &serde_json::Value) -> Result<DocumentRow> {
        {
            let conn = self.conn.lock();
            let now = chrono::Utc::now().timestamp();
            let etag = uuid::Uuid::new_v4().to_string();

            conn.execute(
                "INSERT INTO documents (id, kind, body, etag, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    body = excluded.body,
                    etag = excluded.etag,
                    updated_at = excluded.updated_at,
                    generation = generation + 1",
                params![id, kind, serde_json::to_string(body)?, etag, now],
            )?;
        }

        debug!("Stored document {}", id);
        self.get_document(id)?
            .ok_or_else(|| Error::Internal(format!("document {} vanished after write", id)))
    }

    /// Get a document by id
    pub fn get_document(&self, id: &str) -> Result<Option<DocumentRow>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, kind, body, etag, created_at, updated_at, generation
                 FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(RawDocument {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        body: row.get(2)?,
                        etag: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                        generation: row.get(6)?,
                    })
                },
            )
            .optional()?;

        match row {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// List documents, optionally restricted to one kind
    pub fn list_documents(&self, kind: Option<&str>) -> Result<Vec<DocumentRow>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, kind, body, etag, created_at, updated_at, generation
             FROM documents WHERE ?1 IS NULL OR kind = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![kind], |row| {
            Ok(RawDocument {
                id: row.get(0)?,
                kind: row.get(1)?,
                body: row.get(2)?,
                etag: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
                generation: row.get(6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }

        Ok(results)
    }

    /// Delete a document
    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;

        if rows > 0 {
            debug!("Deleted document {}", id);
        }

        Ok(rows > 0)
    }

    /// Delete every document nested below `id`
    pub fn delete_nested_documents(&self, id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let prefix = format!("{}/", id);
        let rows = conn.execute(
            "DELETE FROM documents WHERE substr(id, 1, length(?1)) = ?1",
            params![prefix],
        )?;

        if rows > 0 {
            debug!("Deleted {} documents nested under {}", rows, id);
        }

        Ok(rows)
    }

    /// Check if a document exists
    pub fn document_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Record a newly submitted operation
    pub fn insert_operation(&self, op: &OperationRow) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();
        let body = op.body.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            "INSERT INTO operations
                (id, target, kind, document_kind, body, existed_at_submit, state, polls_remaining, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                op.id,
                op.target,
                op.kind,
                op.document_kind,
                body,
                op.existed_at_submit,
                op.state,
                op.polls_remaining,
                op.error,
                now,
            ],
        )?;

        debug!("Inserted operation {} ({} {})", op.id, op.kind, op.target);
        Ok(())
    }

    /// Get an operation by id
    pub fn get_operation(&self, id: &str) -> Result<Option<OperationRow>> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT id, target, kind, document_kind, body, existed_at_submit, state, polls_remaining, error
                 FROM operations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((id, target, kind, document_kind, body, existed_at_submit, state, polls_remaining, error)) => {
                Ok(Some(OperationRow {
                    id,
                    target,
                    kind,
                    document_kind,
                    body: body.map(|b| serde_json::from_str(&b)).transpose()?,
                    existed_at_submit,
                    state,
                    polls_remaining,
                    error,
                }))
            }
            None => Ok(None),
        }
    }

    /// Record progress of an operation
    pub fn update_operation(
        &self,
        id: &str,
        state: &str,
        polls_remaining: i64,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        let rows = conn.execute(
            "UPDATE operations SET state = ?1, polls_remaining = ?2, error = ?3, updated_at = ?4 WHERE id = ?5",
            params![state, polls_remaining, error, now, id],
        )?;

        if rows == 0 {
            return Err(Error::not_found("operation", id));
        }

        Ok(())
    }
}

/// Raw database row before parsing
struct RawDocument {
    id: String,
    kind: String,
    body: String,
    etag: String,
    created_at: i64,
    updated_at: i64,
    generation: i64,
}

impl RawDocument {
    fn parse(self) -> Result<DocumentRow> {
        Ok(DocumentRow {
            id: self.id,
            kind: self.kind,
            body: serde_json::from_str(&self.body)?,
            etag: self.etag,
            created_at: self.created_at,
            updated_at: self.updated_at,
            generation: self.generation,
        })
    }
}

/// Parsed document row
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub id: String,
    pub kind: String,
    pub body: serde_json::Value,
    pub etag: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub generation: i64,
}

/// Operation row
#[derive(Debug, Clone)]
pub struct OperationRow {
    pub id: String,
    pub target: String,
    /// "put" or "delete"
    pub kind: String,
    pub document_kind: Option<String>,
    pub body: Option<serde_json::Value>,
    pub existed_at_submit: bool,
    pub state: String,
    pub polls_remaining: i64,
    pub error: Option<String>,
}
