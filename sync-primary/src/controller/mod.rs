//! Auto-Sync Controller (C10): debounces the change-queue nudges coming
//! from the watcher and turns a settled project into a batch of tasks.

use crate::db::connection::Db;
use crate::models::file_change;
use crate::tasks::TaskStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct AutoSyncController {
    db: Db,
    tasks: Arc<TaskStore>,
    debounce: Duration,
    /// Serializes `maybe_enqueue` per project so overlapping debounce
    /// fires for the same project never race each other's in-flight check.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AutoSyncController {
    pub fn new(db: Db, tasks: Arc<TaskStore>, debounce: Duration) -> Self {
        Self {
            db,
            tasks,
            debounce,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes project-name nudges from the watcher, resetting a
    /// per-project debounce timer on each one and firing
    /// `maybe_enqueue_auto_sync` once the timer elapses without a new nudge.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<String>, shutdown: CancellationToken) {
        let mut timers: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                Some(project_name) = rx.recv() => {
                    if let Some(handle) = timers.remove(&project_name) {
                        handle.abort();
                    }
                    let this = self.clone();
                    let debounce = self.debounce;
                    let name = project_name.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(debounce).await;
                        this.maybe_enqueue_auto_sync(&name).await;
                    });
                    timers.insert(project_name, handle);
                }
                _ = shutdown.cancelled() => {
                    for (_, handle) in timers.drain() {
                        handle.abort();
                    }
                    return;
                }
                else => return,
            }
        }
    }

    /// Enqueues one task per node for `project_name` if, and only if: the
    /// project is sync-enabled and has nodes, nothing is already in flight
    /// for it, and the change queue isn't empty (a debounce fire can race
    /// a queue that another fire already drained).
    async fn maybe_enqueue_auto_sync(&self, project_name: &str) {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(project_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        match self.tasks.has_in_flight(project_name).await {
            Ok(true) => {
                tracing::debug!(project = project_name, "skip auto-sync: already in flight");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(project = project_name, "in-flight check failed: {}", e);
                return;
            }
        }

        let pending = {
            let conn = self.db.lock().await;
            file_change::count_unprocessed(&conn, project_name)
        };
        match pending {
            Ok(0) => {
                tracing::debug!(project = project_name, "skip auto-sync: no pending changes");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(project = project_name, "pending-change lookup failed: {}", e);
                return;
            }
        }

        match self.tasks.create_project_tasks(project_name).await {
            Ok(ids) => {
                tracing::info!(project = project_name, tasks = ids.len(), "auto-sync enqueued");
                let conn = self.db.lock().await;
                if let Err(e) = file_change::mark_all_processed(&conn, project_name) {
                    tracing::warn!(project = project_name, "failed to clear change queue: {}", e);
                }
            }
            Err(e) => {
                tracing::debug!(project = project_name, "auto-sync not enqueued: {}", e);
            }
        }
    }
}
