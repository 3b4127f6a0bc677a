use rusqlite::{params, Row};
use sync_protocol::model::{ErrorCode, Task, TaskPayload, TaskStatus};

pub fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let payload_json: String = row.get("payload")?;
    let payload: TaskPayload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let status_str: String = row.get("status")?;
    let error_code_str: Option<String> = row.get("error_code")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Task {
        id: row.get("id")?,
        project_name: row.get("project_name")?,
        node_id: row.get("node_id")?,
        driver: row.get("driver")?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        attempt: row.get::<_, i64>("attempt")? as u32,
        payload,
        logs: row.get("logs")?,
        last_error: row.get("last_error")?,
        error_code: error_code_str.and_then(|s| parse_error_code(&s)),
        files_total: row.get::<_, i64>("files_total")? as u64,
        blocks_total: row.get::<_, i64>("blocks_total")? as u64,
        bytes_total: row.get::<_, i64>("bytes_total")? as u64,
        duration_ms: row.get::<_, Option<i64>>("duration_ms")?.map(|v| v as u64),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn parse_ts(s: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|n| n.and_utc())
                .unwrap_or_else(|_| chrono::Utc::now())
        })
}

fn parse_error_code(s: &str) -> Option<ErrorCode> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
}

fn error_code_as_str(c: ErrorCode) -> String {
    serde_json::to_value(c)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

pub fn insert_pending(
    conn: &rusqlite::Connection,
    id: &str,
    project_name: &str,
    node_id: i64,
    payload: &TaskPayload,
) -> rusqlite::Result<()> {
    let payload_json = serde_json::to_string(payload).expect("TaskPayload always serializes");
    conn.execute(
        "INSERT INTO tasks (id, project_name, node_id, driver, status, attempt, payload)
         VALUES (?1, ?2, ?3, 'agent', 'pending', 0, ?4)",
        params![id, project_name, node_id, payload_json],
    )?;
    Ok(())
}

pub fn has_in_flight_for_project(conn: &rusqlite::Connection, project_name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE project_name = ?1 AND status IN ('pending','running','retrying')",
        params![project_name],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Atomic select-and-mark: returns the oldest `pending` row for `node_id`,
/// flips it to `running`, and bumps `attempt` in the same transaction.
pub fn pull_next(conn: &mut rusqlite::Connection, node_id: i64) -> rusqlite::Result<Option<Task>> {
    let tx = conn.transaction()?;
    let found: Option<String> = tx
        .query_row(
            "SELECT id FROM tasks WHERE node_id = ?1 AND status = 'pending'
             ORDER BY created_at ASC LIMIT 1",
            params![node_id],
            |r| r.get(0),
        )
        .ok();

    let Some(task_id) = found else {
        tx.commit()?;
        return Ok(None);
    };

    tx.execute(
        "UPDATE tasks SET status = 'running', attempt = attempt + 1, updated_at = datetime('now')
         WHERE id = ?1",
        params![task_id],
    )?;

    let task = tx.query_row("SELECT * FROM tasks WHERE id = ?1", params![task_id], row_to_task)?;
    tx.commit()?;
    Ok(Some(task))
}

pub struct TaskReport {
    pub status: TaskStatus,
    pub logs: Option<String>,
    pub last_error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub files: Option<u64>,
    pub blocks: Option<u64>,
    pub bytes: Option<u64>,
    pub duration_ms: Option<u64>,
}

pub fn report(
    conn: &rusqlite::Connection,
    node_id: i64,
    task_id: &str,
    report: &TaskReport,
) -> rusqlite::Result<bool> {
    if !matches!(report.status, TaskStatus::Success | TaskStatus::Failed) {
        return Ok(false);
    }
    let owner: Option<i64> = conn
        .query_row(
            "SELECT node_id FROM tasks WHERE id = ?1",
            params![task_id],
            |r| r.get(0),
        )
        .ok();
    if owner != Some(node_id) {
        return Ok(false);
    }

    let error_code_str = report.error_code.map(error_code_as_str);
    let logs_append = report.logs.clone().unwrap_or_default();
    conn.execute(
        "UPDATE tasks SET status = ?1, last_error = ?2, error_code = ?3,
                files_total = COALESCE(?4, files_total), blocks_total = COALESCE(?5, blocks_total),
                bytes_total = COALESCE(?6, bytes_total), duration_ms = ?7,
                logs = logs || ?8, updated_at = datetime('now')
         WHERE id = ?9",
        params![
            report.status.as_str(),
            report.last_error,
            error_code_str,
            report.files.map(|v| v as i64),
            report.blocks.map(|v| v as i64),
            report.bytes.map(|v| v as i64),
            report.duration_ms.map(|v| v as i64),
            logs_append,
            task_id,
        ],
    )?;
    Ok(true)
}

/// Bulk-fails `running` rows older than `max_age`; returns the number of
/// rows reaped. The only place `running -> failed` happens without an
/// explicit agent report.
pub fn fail_stale_running(conn: &rusqlite::Connection, max_age: std::time::Duration) -> rusqlite::Result<usize> {
    let cutoff = chrono::Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
    conn.execute(
        "UPDATE tasks SET status = 'failed', error_code = 'TIMEOUT',
                last_error = 'task exceeded max running age', updated_at = datetime('now')
         WHERE status = 'running' AND updated_at < ?1",
        params![cutoff.to_rfc3339()],
    )
}
