//! mTLS Transport Server (C6): accepts agent connections, enforces
//! token + TOFU fingerprint pairing, and multiplexes task dispatch.

use crate::state::AppState;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync_protocol::framing::{read_message, write_frame, write_message};
use sync_protocol::message::Message;
use sync_protocol::model::{ErrorCode, IndexFileEntry, SyncStrategy, TaskStatus};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);
const SYNC_START_DEADLINE: Duration = Duration::from_secs(30);
const IDLE_BACKOFF_MIN: Duration = Duration::from_secs(1);
const IDLE_BACKOFF_MAX: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub async fn serve(
    listen_addr: &str,
    tls_config: Arc<ServerConfig>,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    let acceptor = TlsAcceptor::from(tls_config);
    tracing::info!("mTLS transport listening on {}", listen_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!("accept error: {}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let state = state.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    match timeout(HANDSHAKE_DEADLINE, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => {
                            handle_connection(tls_stream, state, conn_shutdown).await;
                        }
                        Ok(Err(e)) => tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e),
                        Err(_) => tracing::warn!("TLS handshake timed out from {}", peer_addr),
                    }
                });
            }
            _ = shutdown.cancelled() => {
                tracing::info!("transport shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(mut stream: TlsStream<tokio::net::TcpStream>, state: Arc<AppState>, shutdown: CancellationToken) {
    let node_id = match perform_handshake(&mut stream, &state).await {
        Ok(Some(id)) => id,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("handshake error: {}", e);
            return;
        }
    };

    state.connections.mark_connected(node_id);
    let heartbeat_state = state.clone();
    let heartbeat_shutdown = shutdown.clone();
    let heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    heartbeat_state.connections.touch(node_id);
                    let _ = heartbeat_state.nodes.touch_last_seen(node_id).await;
                }
                _ = heartbeat_shutdown.cancelled() => return,
            }
        }
    });

    if let Err(e) = dispatch_loop(&mut stream, &state, node_id, &shutdown).await {
        tracing::info!(node_id, "connection closed: {}", e);
    }

    heartbeat.abort();
    state.connections.mark_disconnected(node_id);
}

/// Returns `Ok(Some(node_id))` on a completed, paired hello; `Ok(None)` if
/// the peer was rejected cleanly (connection already closed by us).
async fn perform_handshake(
    stream: &mut TlsStream<tokio::net::TcpStream>,
    state: &Arc<AppState>,
) -> anyhow::Result<Option<i64>> {
    let mut msg = read_message(stream).await?;

    if let Message::Enroll { token, .. } = &msg {
        match state.nodes.find_by_token(token).await? {
            Some(node) => {
                write_message(
                    stream,
                    &Message::EnrollAck {
                        ok: true,
                        node_id: Some(node.id),
                        error: None,
                    },
                )
                .await?;
            }
            None => {
                write_message(
                    stream,
                    &Message::EnrollAck {
                        ok: false,
                        node_id: None,
                        error: Some("unknown token".into()),
                    },
                )
                .await?;
            }
        }
        msg = read_message(stream).await?;
    }

    let (node_id, token) = match msg {
        Message::Hello { node_id, token, .. } => (node_id, token),
        other => {
            tracing::warn!("expected hello, got {}", other.kind());
            return Ok(None);
        }
    };

    if state.nodes.validate_agent_token(node_id, &token).await.is_err() {
        write_message(
            stream,
            &Message::HelloAck {
                ok: false,
                error: Some("invalid token".into()),
                server: None,
            },
        )
        .await?;
        return Ok(None);
    }

    let peer_certs = stream.get_ref().1.peer_certificates().map(|c| c.to_vec());
    let fingerprint = match peer_certs.as_ref().and_then(|c| c.first()) {
        Some(cert) => sync_protocol::tls::sha256_fingerprint_hex(cert),
        None => {
            write_message(
                stream,
                &Message::HelloAck {
                    ok: false,
                    error: Some("no client certificate presented".into()),
                    server: None,
                },
            )
            .await?;
            return Ok(None);
        }
    };

    if let Err(e) = state.nodes.verify_or_pair_fingerprint(node_id, &fingerprint).await {
        write_message(
            stream,
            &Message::HelloAck {
                ok: false,
                error: Some(format!("{e}")),
                server: None,
            },
        )
        .await?;
        return Ok(None);
    }

    write_message(
        stream,
        &Message::HelloAck {
            ok: true,
            error: None,
            server: Some(env!("CARGO_PKG_VERSION").to_string()),
        },
    )
    .await?;

    state.nodes.touch_last_seen(node_id).await?;
    Ok(Some(node_id))
}

async fn dispatch_loop(
    stream: &mut TlsStream<tokio::net::TcpStream>,
    state: &Arc<AppState>,
    node_id: i64,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut backoff = IDLE_BACKOFF_MIN;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let task = match state.tasks.pull_next_task(node_id).await? {
            Some(task) => {
                backoff = IDLE_BACKOFF_MIN;
                task
            }
            None => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(IDLE_BACKOFF_MAX);
                continue;
            }
        };

        write_message(stream, &Message::Task { task: task.clone() }).await?;

        let first = match timeout(SYNC_START_DEADLINE, read_message(stream)).await {
            Ok(Ok(m)) => m,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                state
                    .tasks
                    .report_task(
                        node_id,
                        &task.id,
                        TaskStatus::Failed,
                        None,
                        Some("timed out waiting for sync_start".into()),
                        Some(ErrorCode::Proto),
                        None,
                        None,
                        None,
                        None,
                    )
                    .await?;
                continue;
            }
        };

        match first {
            Message::SyncStart { .. } => {
                run_task_session(stream, state, node_id, &task.id, &task.payload).await?;
            }
            Message::TaskReport { .. } => {
                apply_report(state, node_id, first).await?;
            }
            other => {
                tracing::warn!("unexpected message after task dispatch: {}", other.kind());
            }
        }
    }
}

async fn run_task_session(
    stream: &mut TlsStream<tokio::net::TcpStream>,
    state: &Arc<AppState>,
    node_id: i64,
    task_id: &str,
    payload: &sync_protocol::model::TaskPayload,
) -> anyhow::Result<()> {
    let project = crate::models::project::find_by_name(&state.db.lock().await, &payload.project_name)?
        .ok_or_else(|| anyhow::anyhow!("unknown project {}", payload.project_name))?;
    let root = PathBuf::from(&project.root_path);

    let ignore = sync_protocol::ignore::IgnoreSet::build(
        &root,
        &payload.ignore_patterns,
        &payload.ignore_files,
    )?;

    write_message(
        stream,
        &Message::IndexBegin {
            task_id: task_id.to_string(),
            project_name: payload.project_name.clone(),
            block_hash: "sha256".to_string(),
        },
    )
    .await?;

    let mut entries: HashMap<String, IndexFileEntry> = HashMap::new();
    {
        let index = state.index.clone();
        let mut collected = Vec::new();
        match (payload.strategy, &payload.overlay_paths) {
            (SyncStrategy::Overlay, Some(paths)) => {
                index.build_index_overlay(&root, &ignore, paths, |e| {
                    collected.push(e);
                    Ok(())
                })?;
            }
            // Mirror always walks; overlay with no snapshot means a
            // renamed/deleted row forced a full-walk fallback at enqueue time.
            (SyncStrategy::Mirror, _) | (SyncStrategy::Overlay, None) => {
                index.build_index(&root, &ignore, payload.symlink_policy, |e| {
                    collected.push(e);
                    Ok(())
                })?;
            }
        }
        for entry in collected {
            entries.insert(entry.path.clone(), entry);
        }
    }

    for entry in entries.values() {
        write_message(
            stream,
            &Message::IndexFile {
                task_id: task_id.to_string(),
                file: entry.clone(),
            },
        )
        .await?;
    }

    write_message(
        stream,
        &Message::IndexEnd {
            task_id: task_id.to_string(),
        },
    )
    .await?;

    loop {
        let msg = read_message(stream).await?;
        if msg.task_id() != Some(task_id) {
            tracing::debug!("dropping stray frame for a different task");
            continue;
        }
        match msg {
            Message::BlockRequest { path, index, .. } => {
                serve_block(stream, task_id, &root, &entries, &path, index).await?;
            }
            Message::BlockBatchRequest { path, indices, .. } => {
                for index in indices {
                    serve_block(stream, task_id, &root, &entries, &path, index).await?;
                }
            }
            Message::TaskReport { .. } => {
                apply_report(state, node_id, msg).await?;
                return Ok(());
            }
            other => {
                tracing::warn!("unexpected message during task session: {}", other.kind());
            }
        }
    }
}

async fn serve_block(
    stream: &mut TlsStream<tokio::net::TcpStream>,
    task_id: &str,
    root: &std::path::Path,
    entries: &HashMap<String, IndexFileEntry>,
    path: &str,
    index: u64,
) -> anyhow::Result<()> {
    let result = read_block(root, entries, path, index);
    match result {
        Ok((hash, size, bytes)) => {
            write_message(
                stream,
                &Message::BlockResponseBin {
                    task_id: task_id.to_string(),
                    path: path.to_string(),
                    index,
                    hash,
                    size,
                    error_code: None,
                    error: None,
                },
            )
            .await?;
            write_frame(stream, &bytes).await?;
        }
        Err(e) => {
            write_message(
                stream,
                &Message::BlockResponseBin {
                    task_id: task_id.to_string(),
                    path: path.to_string(),
                    index,
                    hash: String::new(),
                    size: 0,
                    error_code: Some(ErrorCode::MissingBlock),
                    error: Some(e.to_string()),
                },
            )
            .await?;
            write_frame(stream, &[]).await?;
        }
    }
    Ok(())
}

fn read_block(
    root: &std::path::Path,
    entries: &HashMap<String, IndexFileEntry>,
    path: &str,
    index: u64,
) -> anyhow::Result<(String, u64, Vec<u8>)> {
    let entry = entries
        .get(path)
        .ok_or_else(|| anyhow::anyhow!("path not in current index: {path}"))?;
    let block_len = entry.block_len(index as usize);
    let offset = index * entry.block_size;

    let full_path = root.join(path);
    let mut file = std::fs::File::open(&full_path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; block_len as usize];
    file.read_exact(&mut buf)?;

    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(&buf);
    let hash = hex::encode(hasher.finalize());

    Ok((hash, block_len, buf))
}

async fn apply_report(state: &Arc<AppState>, node_id: i64, msg: Message) -> anyhow::Result<()> {
    if let Message::TaskReport {
        task_id,
        status,
        logs,
        last_error,
        error_code,
        files,
        blocks,
        bytes,
        duration_ms,
    } = msg
    {
        let status = TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed);
        state
            .tasks
            .report_task(
                node_id, &task_id, status, logs, last_error, error_code, files, blocks, bytes,
                duration_ms,
            )
            .await?;
    }
    Ok(())
}
