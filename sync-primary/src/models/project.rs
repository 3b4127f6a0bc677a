//! Minimal project record: just enough for the watcher/controller to know
//! which trees to watch, which nodes to fan out to, and what default
//! payload tuning to enqueue with. Git checkout management and webhook
//! ingestion that would populate this table are out of scope here.

use rusqlite::{params, Row};
use sync_protocol::model::TaskPayload;

#[derive(Debug, Clone)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub root_path: String,
    pub sync_enabled: bool,
    pub node_ids: Vec<i64>,
    pub payload_defaults: TaskPayload,
}

fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    let node_ids_json: String = row.get("node_ids")?;
    let payload_json: String = row.get("payload_defaults")?;
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        root_path: row.get("root_path")?,
        sync_enabled: row.get::<_, i64>("sync_enabled")? != 0,
        node_ids: serde_json::from_str(&node_ids_json).unwrap_or_default(),
        payload_defaults: serde_json::from_str(&payload_json).unwrap_or_else(|_| default_payload_for("")),
    })
}

fn default_payload_for(name: &str) -> TaskPayload {
    TaskPayload {
        project_name: name.to_string(),
        target_path: String::new(),
        strategy: sync_protocol::model::SyncStrategy::Mirror,
        ignore_defaults: true,
        ignore_patterns: vec![],
        ignore_files: vec![],
        ignore_permissions: false,
        preserve_mode: Some(true),
        preserve_mtime: Some(true),
        symlink_policy: Default::default(),
        fast_delete: false,
        fullscan_every: None,
        clean_empty_dirs: false,
        sync_empty_dirs: false,
        overlay_paths: None,
    }
}

pub fn list_enabled(conn: &rusqlite::Connection) -> rusqlite::Result<Vec<Project>> {
    let mut stmt = conn.prepare("SELECT * FROM projects WHERE sync_enabled = 1")?;
    let rows = stmt.query_map([], row_to_project)?;
    rows.collect()
}

pub fn find_by_name(conn: &rusqlite::Connection, name: &str) -> rusqlite::Result<Option<Project>> {
    conn.query_row(
        "SELECT * FROM projects WHERE name = ?1",
        params![name],
        row_to_project,
    )
    .map(Some)
    .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
}
