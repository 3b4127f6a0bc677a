//! Pending file-change queue fed by the watcher (C9) and drained by the
//! auto-sync controller (C10). One unprocessed row per (project, path);
//! a new event for a path already queued merges into the existing row
//! instead of appending a second one.

use rusqlite::{params, Row};
use sync_protocol::model::{FileChange, FileChangeType};

fn row_to_change(row: &Row) -> rusqlite::Result<FileChange> {
    let type_str: String = row.get("type")?;
    let mod_time: String = row.get("mod_time")?;
    Ok(FileChange {
        path: row.get("path")?,
        change_type: parse_type(&type_str),
        project_name: row.get("project_name")?,
        mod_time: chrono::DateTime::parse_from_rfc3339(&mod_time)
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        processed: row.get::<_, i64>("processed")? != 0,
    })
}

fn parse_type(s: &str) -> FileChangeType {
    match s {
        "created" => FileChangeType::Created,
        "modified" => FileChangeType::Modified,
        "deleted" => FileChangeType::Deleted,
        "renamed" => FileChangeType::Renamed,
        _ => FileChangeType::Modified,
    }
}

fn type_str(t: FileChangeType) -> &'static str {
    match t {
        FileChangeType::Created => "created",
        FileChangeType::Modified => "modified",
        FileChangeType::Deleted => "deleted",
        FileChangeType::Renamed => "renamed",
    }
}

/// Merge `incoming` into whatever unprocessed row exists for
/// `(project_name, path)`, or insert a fresh one.
pub fn upsert(
    conn: &rusqlite::Connection,
    project_name: &str,
    path: &str,
    incoming: FileChangeType,
) -> rusqlite::Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT type FROM file_changes WHERE project_name = ?1 AND path = ?2 AND processed = 0",
            params![project_name, path],
            |r| r.get(0),
        )
        .ok();

    match existing {
        Some(current_str) => {
            let merged = FileChangeType::merge(parse_type(&current_str), incoming);
            conn.execute(
                "UPDATE file_changes SET type = ?1, mod_time = datetime('now')
                 WHERE project_name = ?2 AND path = ?3 AND processed = 0",
                params![type_str(merged), project_name, path],
            )?;
        }
        None => {
            conn.execute(
                "INSERT INTO file_changes (path, type, project_name, mod_time, processed)
                 VALUES (?1, ?2, ?3, datetime('now'), 0)",
                params![path, type_str(incoming), project_name],
            )?;
        }
    }
    Ok(())
}

pub fn count_unprocessed(conn: &rusqlite::Connection, project_name: &str) -> rusqlite::Result<u64> {
    conn.query_row(
        "SELECT COUNT(*) FROM file_changes WHERE project_name = ?1 AND processed = 0",
        params![project_name],
        |r| r.get::<_, i64>(0),
    )
    .map(|n| n as u64)
}

pub fn list_unprocessed(conn: &rusqlite::Connection, project_name: &str) -> rusqlite::Result<Vec<FileChange>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM file_changes WHERE project_name = ?1 AND processed = 0 ORDER BY mod_time ASC",
    )?;
    let rows = stmt.query_map(params![project_name], row_to_change)?;
    rows.collect()
}

/// Marks every currently-unprocessed row for the project as processed.
/// Called once a task has actually been enqueued for those changes, so a
/// partial failure in between leaves the rows pending for the next pass.
pub fn mark_all_processed(conn: &rusqlite::Connection, project_name: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE file_changes SET processed = 1 WHERE project_name = ?1 AND processed = 0",
        params![project_name],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE file_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                type TEXT NOT NULL,
                project_name TEXT NOT NULL,
                mod_time TEXT NOT NULL DEFAULT (datetime('now')),
                processed INTEGER NOT NULL DEFAULT 0
            );",
        )
        .unwrap();
        conn
    }

    #[test]
    fn created_then_deleted_merges_to_deleted() {
        let conn = setup();
        upsert(&conn, "proj", "a.txt", FileChangeType::Created).unwrap();
        upsert(&conn, "proj", "a.txt", FileChangeType::Deleted).unwrap();
        let rows = list_unprocessed(&conn, "proj").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].change_type, FileChangeType::Deleted);
    }

    #[test]
    fn created_then_modified_stays_created() {
        let conn = setup();
        upsert(&conn, "proj", "a.txt", FileChangeType::Created).unwrap();
        upsert(&conn, "proj", "a.txt", FileChangeType::Modified).unwrap();
        let rows = list_unprocessed(&conn, "proj").unwrap();
        assert_eq!(rows[0].change_type, FileChangeType::Created);
    }

    #[test]
    fn mark_all_processed_clears_the_queue() {
        let conn = setup();
        upsert(&conn, "proj", "a.txt", FileChangeType::Modified).unwrap();
        upsert(&conn, "proj", "b.txt", FileChangeType::Modified).unwrap();
        let n = mark_all_processed(&conn, "proj").unwrap();
        assert_eq!(n, 2);
        assert_eq!(count_unprocessed(&conn, "proj").unwrap(), 0);
    }
}
