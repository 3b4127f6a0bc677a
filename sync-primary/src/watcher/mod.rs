//! Change Watcher (C9): one recursive `notify` watch per enabled-sync
//! project, filtered through the shared ignore matcher and folded into
//! the `file_changes` queue that the auto-sync controller (C10) drains.

use crate::db::connection::Db;
use crate::models::{file_change, project};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sync_protocol::ignore::IgnoreSet;
use sync_protocol::model::FileChangeType;
use tokio::sync::mpsc;

struct RawChange {
    project_name: String,
    path: PathBuf,
    change_type: FileChangeType,
}

pub struct ChangeWatcher {
    db: Db,
    watchers: Mutex<HashMap<String, RecommendedWatcher>>,
}

impl ChangeWatcher {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a watch for every currently sync-enabled project and spawns
    /// the task that folds raw filesystem events into the change queue,
    /// nudging `controller_tx` once per batch so the auto-sync controller
    /// can start (or restart) that project's debounce timer.
    pub async fn run(&self, controller_tx: mpsc::Sender<String>) -> anyhow::Result<()> {
        let projects = {
            let conn = self.db.lock().await;
            project::list_enabled(&conn)?
        };

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<RawChange>();

        for proj in projects {
            if let Err(e) = self.watch_project(&proj, raw_tx.clone()) {
                tracing::warn!(project = %proj.name, "failed to start watch: {}", e);
            }
        }

        let db = self.db.clone();
        tokio::spawn(async move {
            while let Some(change) = raw_rx.recv().await {
                let rel = normalize_path(&change.path);
                let conn = db.lock().await;
                if let Err(e) = file_change::upsert(&conn, &change.project_name, &rel, change.change_type) {
                    tracing::warn!(project = %change.project_name, "failed to queue change: {}", e);
                    continue;
                }
                drop(conn);
                let _ = controller_tx.try_send(change.project_name);
            }
        });

        Ok(())
    }

    fn watch_project(
        &self,
        proj: &project::Project,
        raw_tx: mpsc::UnboundedSender<RawChange>,
    ) -> anyhow::Result<()> {
        let root = PathBuf::from(&proj.root_path);
        let ignore = IgnoreSet::build(
            &root,
            &proj.payload_defaults.ignore_patterns,
            &proj.payload_defaults.ignore_files,
        )?;
        let project_name = proj.name.clone();
        let watch_root = root.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(project = %project_name, "watch error: {}", e);
                    return;
                }
            };
            for change in classify(&event, &watch_root, &ignore) {
                let _ = raw_tx.send(RawChange {
                    project_name: project_name.clone(),
                    path: change.0,
                    change_type: change.1,
                });
            }
        })?;

        watcher.watch(&root, RecursiveMode::Recursive)?;
        self.watchers.lock().unwrap().insert(proj.name.clone(), watcher);
        tracing::info!(project = %proj.name, root = %root.display(), "watching for changes");
        Ok(())
    }
}

fn normalize_path(p: &Path) -> String {
    p.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn classify(event: &Event, root: &Path, ignore: &IgnoreSet) -> Vec<(PathBuf, FileChangeType)> {
    let change_type = match event.kind {
        EventKind::Create(_) => FileChangeType::Created,
        EventKind::Modify(_) => FileChangeType::Modified,
        EventKind::Remove(_) => FileChangeType::Deleted,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter_map(|p| {
            let rel = p.strip_prefix(root).ok()?.to_path_buf();
            if rel.as_os_str().is_empty() {
                return None;
            }
            let is_dir = p.is_dir();
            if ignore.is_ignored(&rel, is_dir) {
                return None;
            }
            Some((rel, change_type))
        })
        .collect()
}
