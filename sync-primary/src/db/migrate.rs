use crate::db::connection::Db;
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  address TEXT NOT NULL DEFAULT '',
  type TEXT NOT NULL DEFAULT 'agent' CHECK(type IN ('agent','ssh','custom')),
  token TEXT NOT NULL,
  agent_cert_fingerprint TEXT NOT NULL DEFAULT '',
  last_seen TEXT,
  install_status TEXT NOT NULL DEFAULT 'pending',
  agent_version TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS projects (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  root_path TEXT NOT NULL,
  sync_enabled INTEGER NOT NULL DEFAULT 1,
  node_ids TEXT NOT NULL DEFAULT '[]',
  payload_defaults TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  project_name TEXT NOT NULL,
  node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
  driver TEXT NOT NULL DEFAULT 'agent',
  status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','success','failed','retrying')),
  attempt INTEGER NOT NULL DEFAULT 0,
  payload TEXT NOT NULL,
  logs TEXT NOT NULL DEFAULT '',
  last_error TEXT,
  error_code TEXT,
  files_total INTEGER NOT NULL DEFAULT 0,
  blocks_total INTEGER NOT NULL DEFAULT 0,
  bytes_total INTEGER NOT NULL DEFAULT 0,
  duration_ms INTEGER,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_tasks_node_status ON tasks(node_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_project_status ON tasks(project_name, status);

CREATE TABLE IF NOT EXISTS file_changes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  path TEXT NOT NULL,
  type TEXT NOT NULL CHECK(type IN ('created','modified','deleted','renamed')),
  project_name TEXT NOT NULL,
  mod_time TEXT NOT NULL DEFAULT (datetime('now')),
  processed INTEGER NOT NULL DEFAULT 0
);

-- At most one unprocessed row per (path, project): enforced in application
-- code via upsert-by-lookup (SQLite partial unique indexes on non-constant
-- expressions are awkward for an upsert target here).
CREATE INDEX IF NOT EXISTS idx_file_changes_lookup
  ON file_changes(project_name, path, processed);
"#;

pub async fn migrate(db: &Db, data_dir: &Path) -> anyhow::Result<()> {
    tracing::info!("starting database migration");
    std::fs::create_dir_all(data_dir)?;

    let conn = db.lock().await;
    conn.execute_batch(SCHEMA)?;
    tracing::info!("migration completed");
    Ok(())
}
