//! Single-writer SQLite handle.
//!
//! §5 mandates "SQLite store is opened single-writer (max 1 open
//! connection, WAL, busy_timeout 5s)". Unlike the teacher's `r2d2`-pooled
//! (max 4, `DELETE` journal mode) handle, this wraps exactly one
//! `rusqlite::Connection` behind a `tokio::sync::Mutex` — readers go
//! through the same connection as the writer, by design.

use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type Db = Arc<Mutex<Connection>>;

pub fn open(db_path: &str) -> anyhow::Result<Db> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub async fn checkpoint(db: &Db) {
    let conn = db.lock().await;
    let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
}
