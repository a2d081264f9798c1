use crate::error::Result;
use pei_proto::EntityType;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::time::Duration;

/// Pooled handle on the local replica database.
///
/// Cloning is cheap; every clone shares the same pool. A connection must not
/// be requested while another one from the same thread is still held, since
/// the in-memory database is backed by a single connection.
#[derive(Clone)]
pub struct LocalDb {
    pool: Pool<SqliteConnectionManager>,
}

impl LocalDb {
    /// Open the database at the given path and initialize tables if needed
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        let db = Self { pool };
        db.init()?;
        Ok(db)
    }

    /// Private database living as long as the returned handle.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;
        let db = Self { pool };
        db.init()?;
        Ok(db)
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        create_schema(&conn)
    }
}

fn create_schema(conn: &Connection) -> Result<()> {
    for entity_type in EntityType::ALL {
        let table = entity_type.table();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                is_synced INTEGER NOT NULL DEFAULT 0,
                last_modified INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                sync_conflict INTEGER NOT NULL DEFAULT 0,
                conflict_note TEXT,
                remote_updated_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_is_synced ON {table} (is_synced);"
        ))?;
    }
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sync_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            last_modified INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            next_attempt_at INTEGER,
            dead_lettered INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_sync_queue_created_at ON sync_queue (created_at);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue (entity_type, entity_id);
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );",
    )?;
    Ok(())
}
