//! Persistent mTLS session to the primary: enrollment/hello handshake,
//! reconnect with exponential backoff (same shape as the reverse
//! WebSocket client this replaces), and the per-connection task dispatch
//! loop that hands each `task` off to the apply pipeline (C7).

use crate::apply;
use crate::config::AgentConfig;
use crate::state::AgentState;
use crate::utils::errors::{remediation_hint, AgentError};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_protocol::framing::{read_message, write_message};
use sync_protocol::model::{ErrorCode, Task};
use sync_protocol::Message;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

const RECONNECT_BACKOFF_MIN_MS: u64 = 1000;
const RECONNECT_BACKOFF_MAX_MS: u64 = 30000;

pub struct AgentSession {
    config: AgentConfig,
    tls_config: Arc<rustls::ClientConfig>,
    shutdown: CancellationToken,
}

impl AgentSession {
    pub fn new(config: AgentConfig, tls_config: Arc<rustls::ClientConfig>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            tls_config,
            shutdown,
        }
    }

    /// Runs until `shutdown` fires, reconnecting with exponential backoff
    /// on any connection-level error; backoff resets after a clean run.
    pub async fn run(&self) {
        let mut backoff_ms = RECONNECT_BACKOFF_MIN_MS;

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("session loop shutting down");
                return;
            }

            match self.connect_and_serve().await {
                Ok(()) => {
                    tracing::info!("session closed normally");
                    backoff_ms = RECONNECT_BACKOFF_MIN_MS;
                }
                Err(e) => tracing::warn!("session error: {}", e),
            }

            if self.shutdown.is_cancelled() {
                return;
            }

            tracing::info!("reconnecting in {}ms", backoff_ms);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                _ = self.shutdown.cancelled() => return,
            }
            backoff_ms = (backoff_ms * 2).min(RECONNECT_BACKOFF_MAX_MS);
        }
    }

    async fn connect_and_serve(&self) -> anyhow::Result<()> {
        tracing::info!(server = %self.config.primary.server, "connecting to primary");
        let tcp = TcpStream::connect(&self.config.primary.server).await?;

        let connector = TlsConnector::from(self.tls_config.clone());
        let server_name = ServerName::try_from("gohook-sync-primary")?.to_owned();
        let mut stream = connector.connect(server_name, tcp).await?;

        let agent_name = self.config.agent_id_or_hostname();
        let agent_version = env!("CARGO_PKG_VERSION").to_string();

        let state = AgentState::load(&self.config.agent.data_dir)?;
        let node_id = match state.as_ref().and_then(|s| s.node_id) {
            Some(id) => id,
            None => {
                write_message(
                    &mut stream,
                    &Message::Enroll {
                        token: self.config.primary.token.clone(),
                        agent_name: agent_name.clone(),
                        agent_version: agent_version.clone(),
                    },
                )
                .await?;
                match read_message(&mut stream).await? {
                    Message::EnrollAck {
                        ok: true,
                        node_id: Some(id),
                        ..
                    } => id,
                    Message::EnrollAck { error, .. } => {
                        anyhow::bail!("enrollment rejected: {}", error.unwrap_or_default())
                    }
                    other => anyhow::bail!("unexpected message during enrollment: {}", other.kind()),
                }
            }
        };

        write_message(
            &mut stream,
            &Message::Hello {
                node_id,
                token: self.config.primary.token.clone(),
                agent_name,
                agent_version,
            },
        )
        .await?;
        match read_message(&mut stream).await? {
            Message::HelloAck { ok: true, .. } => {}
            Message::HelloAck { error, .. } => {
                anyhow::bail!("hello rejected: {}", error.unwrap_or_default())
            }
            other => anyhow::bail!("unexpected message during hello: {}", other.kind()),
        }

        AgentState::new(Some(node_id), self.config.primary.token.clone(), self.config.primary.server.clone())
            .save(&self.config.agent.data_dir)?;
        tracing::info!(node_id, "session established");

        self.dispatch_loop(&mut stream).await
    }

    async fn dispatch_loop<S>(&self, stream: &mut S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                msg = read_message(stream) => {
                    match msg? {
                        Message::Task { task } => self.handle_task(stream, task).await?,
                        other => tracing::warn!("unexpected message outside task dispatch: {}", other.kind()),
                    }
                }
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn handle_task<S>(&self, stream: &mut S, task: Task) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let started = Instant::now();
        let task_id = task.id.clone();
        tracing::info!(task_id = %task_id, project = %task.project_name, "task received");

        if let Err(e) = task.payload.validate_target_path() {
            tracing::warn!(task_id = %task_id, "preflight rejected task: {}", e);
            write_message(
                stream,
                &Message::TaskReport {
                    task_id,
                    status: "failed".to_string(),
                    logs: None,
                    last_error: Some(e.to_string()),
                    error_code: Some(ErrorCode::InvalidTarget),
                    files: None,
                    blocks: None,
                    bytes: None,
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                },
            )
            .await?;
            return Ok(());
        }

        let report = match apply::run_task(
            stream,
            &task_id,
            &task.payload,
            self.config.sync.block_batch_target_bytes,
            self.config.sync.block_batch_size,
        )
        .await
        {
            Ok(outcome) => {
                tracing::info!(
                    task_id = %task_id,
                    files = outcome.files,
                    blocks = outcome.blocks,
                    bytes = outcome.bytes,
                    "task succeeded"
                );
                Message::TaskReport {
                    task_id,
                    status: "success".to_string(),
                    logs: None,
                    last_error: None,
                    error_code: None,
                    files: Some(outcome.files),
                    blocks: Some(outcome.blocks),
                    bytes: Some(outcome.bytes),
                    duration_ms: Some(started.elapsed().as_millis() as u64),
                }
            }
            Err(e) => build_failure_report(task_id, &e, started.elapsed()),
        };

        write_message(stream, &report).await?;
        Ok(())
    }
}

fn build_failure_report(task_id: String, e: &AgentError, elapsed: Duration) -> Message {
    let code = e.error_code();
    tracing::warn!(task_id = %task_id, error_code = ?code, "task failed: {}", e);
    let last_error = match remediation_hint(code) {
        Some(hint) => format!("{e} ({hint})"),
        None => e.to_string(),
    };
    Message::TaskReport {
        task_id,
        status: "failed".to_string(),
        logs: None,
        last_error: Some(last_error),
        error_code: Some(code),
        files: None,
        blocks: None,
        bytes: None,
        duration_ms: Some(elapsed.as_millis() as u64),
    }
}
