//! Task Store & State Machine (C5): create, pull, report, reap sync
//! tasks; dedup in-flight runs per project.

use crate::db::connection::Db;
use crate::error::{AppError, Result};
use crate::models::{file_change, project, task};
use sync_protocol::model::{FileChangeType, SyncStrategy, Task, TaskPayload, TaskStatus};

pub struct TaskStore {
    db: Db,
}

impl TaskStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// For each node configured on the project, inserts a `pending` task.
    /// Fails with `Conflict` if the project is not sync-enabled. The
    /// controller is responsible for the idempotence invariant: it must
    /// not call this while any task for the project is already in flight.
    ///
    /// For `overlay` strategy projects, snapshots the current unprocessed
    /// change queue into the payload's `overlay_paths` before the caller
    /// marks those rows processed, so the primary still knows which paths
    /// changed once the agent later pulls the task.
    pub async fn create_project_tasks(&self, project_name: &str) -> Result<Vec<String>> {
        let conn = self.db.lock().await;
        let proj = project::find_by_name(&conn, project_name)?
            .ok_or_else(|| AppError::NotFound(format!("project {project_name}")))?;
        if !proj.sync_enabled {
            return Err(AppError::Conflict(format!(
                "project {project_name} is not sync-enabled"
            )));
        }

        let overlay_paths = if proj.payload_defaults.strategy == SyncStrategy::Overlay {
            let changes = file_change::list_unprocessed(&conn, project_name)?;
            overlay_paths_for(&changes)
        } else {
            None
        };

        let mut ids = Vec::with_capacity(proj.node_ids.len());
        for node_id in &proj.node_ids {
            let task_id = uuid::Uuid::new_v4().to_string();
            let mut payload = proj.payload_defaults.clone();
            payload.project_name = proj.name.clone();
            payload.overlay_paths = overlay_paths.clone();
            task::insert_pending(&conn, &task_id, &proj.name, *node_id, &payload)?;
            ids.push(task_id);
        }
        Ok(ids)
    }

    pub async fn has_in_flight(&self, project_name: &str) -> Result<bool> {
        let conn = self.db.lock().await;
        Ok(task::has_in_flight_for_project(&conn, project_name)?)
    }

    /// Atomic select-and-mark; `None` means "idle, back off" to the
    /// transport dispatch loop.
    pub async fn pull_next_task(&self, node_id: i64) -> Result<Option<Task>> {
        let mut conn = self.db.lock().await;
        Ok(task::pull_next(&mut conn, node_id)?)
    }

    pub async fn report_task(
        &self,
        node_id: i64,
        task_id: &str,
        status: TaskStatus,
        logs: Option<String>,
        last_error: Option<String>,
        error_code: Option<sync_protocol::model::ErrorCode>,
        files: Option<u64>,
        blocks: Option<u64>,
        bytes: Option<u64>,
        duration_ms: Option<u64>,
    ) -> Result<bool> {
        let conn = self.db.lock().await;
        let report = task::TaskReport {
            status,
            logs,
            last_error,
            error_code,
            files,
            blocks,
            bytes,
            duration_ms,
        };
        Ok(task::report(&conn, node_id, task_id, &report)?)
    }

    /// Bulk-fails `running` rows older than `max_age`. The only component
    /// that transitions `running -> failed` without an explicit report.
    pub async fn fail_stale_running_tasks(&self, max_age: std::time::Duration) -> Result<usize> {
        let conn = self.db.lock().await;
        Ok(task::fail_stale_running(&conn, max_age)?)
    }
}

/// `None` (full-walk fallback) if any queued row is `renamed`/`deleted`,
/// otherwise the set of `created`/`modified` paths to index directly.
fn overlay_paths_for(changes: &[sync_protocol::model::FileChange]) -> Option<Vec<String>> {
    if changes
        .iter()
        .any(|c| matches!(c.change_type, FileChangeType::Renamed | FileChangeType::Deleted))
    {
        return None;
    }
    Some(changes.iter().map(|c| c.path.clone()).collect())
}

pub fn default_task_payload(project_name: &str, target_path: &str) -> TaskPayload {
    TaskPayload {
        project_name: project_name.to_string(),
        target_path: target_path.to_string(),
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
