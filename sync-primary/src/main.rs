use std::sync::Arc;
use sync_primary::config::AppConfig;
use sync_primary::controller::AutoSyncController;
use sync_primary::state::AppState;
use sync_primary::{db, reaper, tls, transport, watcher};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    tracing::info!("starting gohook-sync primary on {}", config.listen_addr);

    std::fs::create_dir_all(&config.data_dir)?;

    let db = db::connection::open(&config.db_path.to_string_lossy())?;
    db::migrate::migrate(&db, &config.data_dir).await?;

    let (cert_pem, key_pem) = tls::ensure_self_signed_cert(&config.tls_dir)?;
    let tls_config = tls::build_server_config(&cert_pem, &key_pem)?;

    let state = Arc::new(AppState::new(db.clone(), config.clone()));
    let shutdown = CancellationToken::new();

    let (controller_tx, controller_rx) = tokio::sync::mpsc::channel::<String>(256);

    let change_watcher = watcher::ChangeWatcher::new(db.clone());
    change_watcher.run(controller_tx).await?;

    let controller = Arc::new(AutoSyncController::new(
        db.clone(),
        state.tasks.clone(),
        std::time::Duration::from_millis(config.debounce_default_ms),
    ));
    let controller_shutdown = shutdown.clone();
    tokio::spawn(controller.run(controller_rx, controller_shutdown));

    let reaper_tasks = state.tasks.clone();
    let reaper_shutdown = shutdown.clone();
    let reaper_max_age = config.reaper_max_running_age_secs;
    let reaper_interval = config.reaper_interval_secs;
    tokio::spawn(reaper::run(reaper_tasks, reaper_max_age, reaper_interval, reaper_shutdown));

    let transport_state = state.clone();
    let transport_shutdown = shutdown.clone();
    let listen_addr = config.listen_addr.clone();
    let transport_handle = tokio::spawn(async move {
        if let Err(e) = transport::serve(&listen_addr, tls_config, transport_state, transport_shutdown).await {
            tracing::error!("transport server exited: {}", e);
        }
    });

    shutdown_signal().await;
    tracing::info!("shutting down");
    shutdown.cancel();

    let _ = transport_handle.await;
    db::connection::checkpoint(&db).await;
    tracing::info!("stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
