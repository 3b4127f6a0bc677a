//! Sync Agent - Main entry point
//!
//! Rust-based sync agent with an mTLS session to the primary and a
//! resumable delta apply pipeline.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use sync_agent::config::AgentConfig;
use sync_agent::daemon::shutdown::ShutdownCoordinator;
use sync_agent::session::AgentSession;
use sync_agent::{tls, utils};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let args = sync_agent::cli::Args::parse();

    let mut config = AgentConfig::load(args.config.as_ref())?;
    config.apply_cli_overrides(&args);

    utils::logger::init(&config.log.level)?;

    tracing::info!(
        "starting gohook-sync agent v{} (agent_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent_id_or_hostname()
    );

    if config.primary.server.is_empty() {
        anyhow::bail!("no primary server configured (--server or SYNC_AGENT_SERVER)");
    }

    std::fs::create_dir_all(&config.agent.data_dir)?;
    let tls_dir = config.agent.data_dir.join("tls");
    let (cert_pem, key_pem) = tls::ensure_self_signed_cert(&tls_dir)?;
    let trust = Arc::new(tls::FileBackedTrust::new(
        &tls_dir,
        config.primary.server_fingerprint.clone(),
    ));
    let tls_config = tls::build_client_config(&cert_pem, &key_pem, trust)?;

    let shutdown_coordinator = ShutdownCoordinator::new();
    let session_shutdown = CancellationToken::new();

    let session = AgentSession::new(config, tls_config, session_shutdown.clone());
    let session_handle = tokio::spawn(async move { session.run().await });

    shutdown_coordinator.wait_for_signal().await;
    session_shutdown.cancel();
    shutdown_coordinator.shutdown().await;

    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), session_handle).await;

    Ok(())
}
