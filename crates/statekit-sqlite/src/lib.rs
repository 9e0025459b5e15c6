//! SQLite backend adapter for statekit.
//!
//! Persists the state tree as one row per top-level key in a `state_entries`
//! table, values serialized as JSON text. The connection runs in WAL mode
//! with performance pragmas applied, and every operation dispatches onto the
//! blocking thread pool via `tokio::task::spawn_blocking` so the async
//! runtime is never stalled by file I/O.
//!
//! The adapter classifies itself as a shared medium: a database file on
//! common disk already reflects a peer process's writes, so broadcast sync
//! only refreshes and re-notifies instead of re-applying payloads.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info};

use statekit::path::{self, StatePath};
use statekit::{Backend, BackendKind, StoreError, StoreResult, UpdateEntry};

/// SQLite-backed [`Backend`].
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) a database at `path` and apply performance pragmas.
    ///
    /// This call blocks briefly (file I/O); open during startup or wrap in
    /// `spawn_blocking`. The schema is created by `initialize()`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening state database");
        let conn = Connection::open(path).map_err(sqlite_err)?;
        Self::apply_pragmas(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory state database");
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::apply_pragmas(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sqlite_err)?;
        // NORMAL sync is safe with WAL; a power failure loses at most the
        // last transaction, never corrupts.
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sqlite_err)?;
        conn.pragma_update(None, "temp_store", "MEMORY")
            .map_err(sqlite_err)?;
        // Concurrent writers wait instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)
            .map_err(sqlite_err)?;
        Ok(())
    }

    /// Run a closure against the connection on the blocking pool.
    async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    fn read_row(conn: &Connection, key: &str) -> StoreResult<Option<Value>> {
        let mut stmt = conn
            .prepare("SELECT value FROM state_entries WHERE key = ?1")
            .map_err(sqlite_err)?;
        let mut rows = stmt.query([key]).map_err(sqlite_err)?;
        match rows.next().map_err(sqlite_err)? {
            Some(row) => {
                let text: String = row.get(0).map_err(sqlite_err)?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    fn write_row(conn: &Connection, key: &str, value: &Value) -> StoreResult<()> {
        let text = serde_json::to_string(value)?;
        conn.execute(
            "INSERT INTO state_entries (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, text],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    fn read_tree(conn: &Connection) -> StoreResult<Value> {
        let mut stmt = conn
            .prepare("SELECT key, value FROM state_entries ORDER BY rowid")
            .map_err(sqlite_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(sqlite_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sqlite_err)?;
        let mut tree = Map::new();
        for (key, text) in rows {
            tree.insert(key, serde_json::from_str(&text)?);
        }
        Ok(Value::Object(tree))
    }

    /// Resolve a key against the stored rows: a verbatim row hit is a raw
    /// key, anything else is parsed as a dotted path.
    fn resolve(conn: &Connection, key: &str) -> StoreResult<StatePath> {
        let exact: bool = conn
            .query_row(
                "SELECT count(*) FROM state_entries WHERE key = ?1",
                [key],
                |row| row.get::<_, i64>(0),
            )
            .map_err(sqlite_err)?
            > 0;
        Ok(if exact {
            StatePath::raw(key)
        } else {
            StatePath::parse(key)
        })
    }
}

fn sqlite_err(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(format!("sqlite: {err}"))
}

#[async_trait]
impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        // The database file is visible to every context on this host.
        BackendKind::SharedMedium
    }

    async fn initialize(&self) -> StoreResult<()> {
        self.execute(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS state_entries (\
                     key   TEXT PRIMARY KEY,\
                     value TEXT NOT NULL\
                 )",
                [],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Value>> {
        let path = path.to_string();
        self.execute(move |conn| {
            if path.is_empty() {
                return Ok(Some(Self::read_tree(conn)?));
            }
            let resolved = Self::resolve(conn, &path)?;
            match resolved.segments() {
                [single] => Self::read_row(conn, single),
                [top, ..] => {
                    let Some(root) = Self::read_row(conn, top)? else {
                        return Ok(None);
                    };
                    let nested = StatePath::parse(&resolved.segments()[1..].join("."));
                    Ok(path::value_at(&root, &nested).cloned())
                }
                [] => Ok(Some(Self::read_tree(conn)?)),
            }
        })
        .await
    }

    async fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let path = path.to_string();
        self.execute(move |conn| {
            if path.is_empty() {
                let Value::Object(map) = value else {
                    return Err(StoreError::InvalidPath(
                        "whole-tree set requires an object value".into(),
                    ));
                };
                conn.execute("DELETE FROM state_entries", [])
                    .map_err(sqlite_err)?;
                for (key, entry) in &map {
                    Self::write_row(conn, key, entry)?;
                }
                return Ok(());
            }
            let resolved = Self::resolve(conn, &path)?;
            match resolved.segments() {
                [single] => Self::write_row(conn, single, &value),
                [top, ..] => {
                    let mut root = Self::read_row(conn, top)?.unwrap_or(Value::Null);
                    let nested = StatePath::parse(&resolved.segments()[1..].join("."));
                    path::set_value_at(&mut root, &nested, value);
                    Self::write_row(conn, top, &root)
                }
                [] => Err(StoreError::InvalidPath(path.clone())),
            }
        })
        .await
    }

    async fn update(&self, entries: Vec<UpdateEntry>) -> StoreResult<()> {
        self.execute(move |conn| {
            // One implicit transaction over the whole batch.
            conn.execute_batch("BEGIN").map_err(sqlite_err)?;
            let result = (|| {
                for entry in &entries {
                    match &entry.value {
                        Some(value) => Self::write_row(conn, &entry.key, value)?,
                        None => {
                            conn.execute(
                                "DELETE FROM state_entries WHERE key = ?1",
                                [&entry.key],
                            )
                            .map_err(sqlite_err)?;
                        }
                    }
                }
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT").map_err(sqlite_err),
                Err(err) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(err)
                }
            }
        })
        .await
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        let path = path.to_string();
        self.execute(move |conn| {
            let removed = conn
                .execute("DELETE FROM state_entries WHERE key = ?1", [&path])
                .map_err(sqlite_err)?;
            if removed > 0 {
                return Ok(true);
            }
            let resolved = StatePath::parse(&path);
            if resolved.segments().len() < 2 {
                return Ok(false);
            }
            let top = resolved.segments()[0].clone();
            let Some(mut root) = Self::read_row(conn, &top)? else {
                return Ok(false);
            };
            let nested = StatePath::parse(&resolved.segments()[1..].join("."));
            if !path::remove_value_at(&mut root, &nested) {
                return Ok(false);
            }
            Self::write_row(conn, &top, &root)?;
            Ok(true)
        })
        .await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.execute(|conn| {
            conn.execute("DELETE FROM state_entries", [])
                .map_err(sqlite_err)?;
            Ok(())
        })
        .await
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        self.execute(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM state_entries ORDER BY rowid")
                .map_err(sqlite_err)?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(sqlite_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sqlite_err)?;
            Ok(keys)
        })
        .await
    }

    async fn has(&self, path: &str) -> StoreResult<bool> {
        Ok(self.get(path).await?.is_some())
    }

    async fn destroy(&self) -> StoreResult<()> {
        // The connection closes when the last clone drops; rows stay on
        // disk, the medium is durable.
        debug!("sqlite backend released");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────
