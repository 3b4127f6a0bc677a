//! Task Reaper (C12): the only place a `running` task is moved to
//! `failed` without an explicit agent report — a connection can drop
//! mid-sync and leave a row stuck otherwise.

use crate::tasks::TaskStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn run(tasks: Arc<TaskStore>, max_age_secs: u64, interval_secs: u64, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let max_age = Duration::from_secs(max_age_secs);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match tasks.fail_stale_running_tasks(max_age).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("reaper failed {} stale running task(s)", n),
                    Err(e) => tracing::warn!("reaper sweep failed: {}", e),
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}
