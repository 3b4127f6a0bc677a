//! Delta Apply Pipeline, agent side (C7): preflight, index ingestion,
//! per-file block reconciliation with resume support, and the mirror
//! manifest GC (C8) hookup.

use crate::manifest;
use crate::utils::errors::AgentError;
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use sync_protocol::framing::{read_frame, read_message, write_message};
use sync_protocol::ignore::IgnoreSet;
use sync_protocol::model::{ErrorCode, FileResumeMeta, IndexFileEntry, SyncStrategy, TaskPayload};
use sync_protocol::Message;
use tokio::io::{AsyncRead, AsyncWrite};

pub struct ApplyOutcome {
    pub files: u64,
    pub blocks: u64,
    pub bytes: u64,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Rejects an empty/`/` target, then verifies writability by creating and
/// removing a probe file.
pub fn preflight(payload: &TaskPayload) -> Result<PathBuf, AgentError> {
    payload
        .validate_target_path()
        .map_err(|e| AgentError::Apply(ErrorCode::InvalidTarget, e.to_string()))?;
    let root = PathBuf::from(&payload.target_path);
    std::fs::create_dir_all(&root)?;
    let probe = root.join(format!(".gohook-sync-probe-{}", std::process::id()));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    Ok(root)
}

pub async fn run_task<S>(
    stream: &mut S,
    task_id: &str,
    payload: &TaskPayload,
    batch_target_bytes: u64,
    batch_size_override: Option<usize>,
) -> Result<ApplyOutcome, AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target_root = preflight(payload)?;
    write_message(
        stream,
        &Message::SyncStart {
            task_id: task_id.to_string(),
        },
    )
    .await?;

    let mut index = HashMap::<String, IndexFileEntry>::new();
    loop {
        match read_message(stream).await? {
            Message::IndexBegin { .. } => continue,
            Message::IndexFile { file, .. } => {
                index.insert(file.path.clone(), file);
            }
            Message::IndexEnd { .. } => break,
            other => {
                return Err(AgentError::Apply(
                    ErrorCode::Proto,
                    format!("unexpected message during index stream: {}", other.kind()),
                ))
            }
        }
    }

    let ignore = IgnoreSet::build(&target_root, &payload.ignore_patterns, &payload.ignore_files)
        .map_err(|e| AgentError::Apply(ErrorCode::Index, e.to_string()))?;

    let mut outcome = ApplyOutcome {
        files: 0,
        blocks: 0,
        bytes: 0,
    };

    for (path, entry) in index.iter() {
        if ignore.is_ignored(Path::new(path), false) {
            continue;
        }
        let batch_size = batch_size_override.unwrap_or_else(|| {
            ((batch_target_bytes / entry.block_size.max(1)).max(1) as usize).min(256)
        });
        let (blocks, bytes) =
            apply_file(stream, task_id, path, entry, &target_root, payload, batch_size).await?;
        outcome.files += 1;
        outcome.blocks += blocks;
        outcome.bytes += bytes;
    }

    if payload.strategy == SyncStrategy::Mirror {
        let expected: HashSet<String> = index.keys().cloned().collect();
        let previous = manifest::read_manifest(&target_root)
            .map_err(|e| AgentError::Apply(ErrorCode::Unknown, e.to_string()))?;
        let sync_count = previous.as_ref().map(|m| m.sync_count + 1).unwrap_or(1);

        if manifest::should_full_scan(payload.fast_delete, payload.fullscan_every, sync_count) {
            if let Some(prev) = &previous {
                let removed = manifest::delete_stale(&target_root, prev, &expected)?;
                if payload.clean_empty_dirs {
                    manifest::clean_empty_dirs(&target_root, &removed, &expected);
                }
            }
        }

        manifest::write_manifest(&target_root, expected.into_iter().collect(), sync_count)
            .map_err(|e| AgentError::Apply(ErrorCode::Unknown, e.to_string()))?;
    }

    Ok(outcome)
}

async fn apply_file<S>(
    stream: &mut S,
    task_id: &str,
    rel_path: &str,
    entry: &IndexFileEntry,
    target_root: &Path,
    payload: &TaskPayload,
    batch_size: usize,
) -> Result<(u64, u64), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dst = target_root.join(rel_path);
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let (tmp_path, meta_path, mut done) = match find_resumable(&dst, entry) {
        Some((tmp, meta, resume)) => (tmp, meta, resume.done.into_iter().collect::<HashSet<_>>()),
        None => {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let tmp_name = format!(
                "{}.gohook-sync-tmp-{}",
                dst.file_name().unwrap_or_default().to_string_lossy(),
                nanos
            );
            let tmp = dst.with_file_name(tmp_name);
            let meta = tmp.with_file_name(format!(
                "{}.json",
                tmp.file_name().unwrap_or_default().to_string_lossy()
            ));
            (tmp, meta, HashSet::new())
        }
    };

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(&tmp_path)?;
    file.set_len(entry.size)?;

    let block_count = entry.block_count();
    let mut blocks_fetched = 0u64;
    let mut bytes_fetched = 0u64;
    let mut pending = Vec::new();

    for i in 0..block_count {
        let idx = i as u64;
        if done.contains(&idx) {
            continue;
        }
        let block_len = entry.block_len(i);
        if let Some(bytes) = try_local_reuse(&dst, entry.block_size, i, block_len, &entry.blocks[i]) {
            write_at(&file, idx * entry.block_size, &bytes)?;
            done.insert(idx);
            continue;
        }
        pending.push(idx);
        if pending.len() >= batch_size {
            let (b, by) = fetch_with_retry(stream, task_id, rel_path, &pending, entry, &file).await?;
            blocks_fetched += b;
            bytes_fetched += by;
            done.extend(pending.iter().copied());
            persist_resume_meta(&meta_path, entry, &done)?;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        let (b, by) = fetch_with_retry(stream, task_id, rel_path, &pending, entry, &file).await?;
        blocks_fetched += b;
        bytes_fetched += by;
        done.extend(pending.iter().copied());
        persist_resume_meta(&meta_path, entry, &done)?;
    }

    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp_path, &dst)?;
    let _ = std::fs::remove_file(&meta_path);

    if !payload.ignore_permissions {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dst, std::fs::Permissions::from_mode(entry.mode))?;
        }
        filetime::set_file_mtime(&dst, FileTime::from_unix_time(entry.mtime_unix, 0))?;
    }

    Ok((blocks_fetched, bytes_fetched))
}

/// §7: a hash mismatch is retried once before the task fails.
async fn fetch_with_retry<S>(
    stream: &mut S,
    task_id: &str,
    path: &str,
    indices: &[u64],
    entry: &IndexFileEntry,
    file: &File,
) -> Result<(u64, u64), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match fetch_batch(stream, task_id, path, indices, entry, file).await {
        Err(AgentError::Apply(ErrorCode::HashMismatch, _)) => {
            fetch_batch(stream, task_id, path, indices, entry, file).await
        }
        other => other,
    }
}

async fn fetch_batch<S>(
    stream: &mut S,
    task_id: &str,
    path: &str,
    indices: &[u64],
    entry: &IndexFileEntry,
    file: &File,
) -> Result<(u64, u64), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = if indices.len() == 1 {
        Message::BlockRequest {
            task_id: task_id.to_string(),
            path: path.to_string(),
            index: indices[0],
        }
    } else {
        Message::BlockBatchRequest {
            task_id: task_id.to_string(),
            path: path.to_string(),
            indices: indices.to_vec(),
        }
    };
    write_message(stream, &request).await?;

    let mut blocks = 0u64;
    let mut bytes = 0u64;
    for &idx in indices {
        let resp = read_message(stream).await?;
        let (resp_task, resp_path, resp_index, hash, size, error_code, error) = match resp {
            Message::BlockResponseBin {
                task_id,
                path,
                index,
                hash,
                size,
                error_code,
                error,
            } => (task_id, path, index, hash, size, error_code, error),
            other => {
                return Err(AgentError::Apply(
                    ErrorCode::Proto,
                    format!("expected block_response_bin, got {}", other.kind()),
                ))
            }
        };

        if resp_task != task_id || resp_path != path || resp_index != idx {
            return Err(AgentError::Apply(
                ErrorCode::Proto,
                format!("block response out of order: expected index {idx}, got {resp_index}"),
            ));
        }

        let raw = read_frame(stream).await?;

        if error_code.is_some() || size == 0 {
            return Err(AgentError::Apply(
                ErrorCode::MissingBlock,
                format!(
                    "server could not supply block {idx} of {path}: {}",
                    error.unwrap_or_else(|| "missing block".to_string())
                ),
            ));
        }
        if raw.len() as u64 != size {
            return Err(AgentError::Apply(
                ErrorCode::HashMismatch,
                format!("block {idx} of {path}: expected {size} bytes, got {}", raw.len()),
            ));
        }
        let actual_hash = sha256_hex(&raw);
        if actual_hash != hash || actual_hash != entry.blocks[idx as usize] {
            return Err(AgentError::Apply(
                ErrorCode::HashMismatch,
                format!("block {idx} of {path}: hash mismatch"),
            ));
        }

        write_at(file, idx * entry.block_size, &raw)?;
        blocks += 1;
        bytes += raw.len() as u64;
    }

    Ok((blocks, bytes))
}

fn try_local_reuse(
    dst: &Path,
    block_size: u64,
    index: usize,
    block_len: u64,
    expected_hash: &str,
) -> Option<Vec<u8>> {
    let file = std::fs::File::open(dst).ok()?;
    let offset = index as u64 * block_size;
    let mut buf = vec![0u8; block_len as usize];
    read_at(&file, offset, &mut buf).ok()?;
    if sha256_hex(&buf) == expected_hash {
        Some(buf)
    } else {
        None
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
}

#[cfg(not(unix))]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buf)
}

/// Looks for a `<dst>.gohook-sync-tmp-*` sidecar whose digest still
/// matches this index entry, in the destination's parent directory.
fn find_resumable(dst: &Path, entry: &IndexFileEntry) -> Option<(PathBuf, PathBuf, FileResumeMeta)> {
    let parent = dst.parent()?;
    let file_name = dst.file_name()?.to_string_lossy().to_string();
    let prefix = format!("{file_name}.gohook-sync-tmp-");
    let digest = FileResumeMeta::digest_for(entry);

    for entry_result in std::fs::read_dir(parent).ok()? {
        let dir_entry = entry_result.ok()?;
        let name = dir_entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&prefix) || !name.ends_with(".json") {
            continue;
        }
        let meta_path = dir_entry.path();
        let tmp_path = parent.join(name.trim_end_matches(".json"));
        if !tmp_path.exists() {
            continue;
        }
        let Ok(bytes) = std::fs::read(&meta_path) else { continue };
        let Ok(meta) = serde_json::from_slice::<FileResumeMeta>(&bytes) else { continue };
        if meta.blocks_digest == digest {
            return Some((tmp_path, meta_path, meta));
        }
        // Stale resume for a superseded version of this file; nothing will
        // ever pick it up again, so clear it out instead of leaking it.
        let _ = std::fs::remove_file(&tmp_path);
        let _ = std::fs::remove_file(&meta_path);
    }
    None
}

fn persist_resume_meta(
    meta_path: &Path,
    entry: &IndexFileEntry,
    done: &HashSet<u64>,
) -> std::io::Result<()> {
    let meta = FileResumeMeta {
        version: sync_protocol::model::RESUME_META_VERSION,
        path: entry.path.clone(),
        size: entry.size,
        block_size: entry.block_size,
        blocks_digest: FileResumeMeta::digest_for(entry),
        done: done.iter().copied().collect(),
    };
    std::fs::write(meta_path, serde_json::to_vec(&meta)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_reuse_accepts_a_matching_block() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello world!!!!!").unwrap();
        let hash = sha256_hex(b"hello world!!!!!");
        let reused = try_local_reuse(&path, 16, 0, 16, &hash);
        assert_eq!(reused, Some(b"hello world!!!!!".to_vec()));
    }

    #[test]
    fn local_reuse_rejects_a_mismatching_block() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello world!!!!!").unwrap();
        assert!(try_local_reuse(&path, 16, 0, 16, &"0".repeat(64)).is_none());
    }

    #[test]
    fn resume_meta_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let entry = IndexFileEntry {
            path: "a.bin".into(),
            size: 32,
            mode: 0o644,
            mtime_unix: 0,
            block_size: 16,
            blocks: vec!["x".repeat(64), "y".repeat(64)],
        };
        let mut done = HashSet::new();
        done.insert(0u64);
        let meta_path = dir.path().join("a.bin.gohook-sync-tmp-1.json");
        persist_resume_meta(&meta_path, &entry, &done).unwrap();

        let bytes = std::fs::read(&meta_path).unwrap();
        let meta: FileResumeMeta = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(meta.done, vec![0]);
        assert_eq!(meta.blocks_digest, FileResumeMeta::digest_for(&entry));
    }

    #[test]
    fn find_resumable_deletes_a_stale_sidecar_that_no_longer_matches() {
        let dir = tempfile::TempDir::new().unwrap();
        let dst = dir.path().join("a.bin");

        let stale_entry = IndexFileEntry {
            path: "a.bin".into(),
            size: 16,
            mode: 0o644,
            mtime_unix: 0,
            block_size: 16,
            blocks: vec!["x".repeat(64)],
        };
        let tmp_path = dir.path().join("a.bin.gohook-sync-tmp-1");
        let meta_path = dir.path().join("a.bin.gohook-sync-tmp-1.json");
        std::fs::write(&tmp_path, vec![0u8; 16]).unwrap();
        let mut done = HashSet::new();
        done.insert(0u64);
        persist_resume_meta(&meta_path, &stale_entry, &done).unwrap();

        let current_entry = IndexFileEntry {
            path: "a.bin".into(),
            size: 32,
            mode: 0o644,
            mtime_unix: 0,
            block_size: 16,
            blocks: vec!["x".repeat(64), "y".repeat(64)],
        };
        assert!(find_resumable(&dst, &current_entry).is_none());
        assert!(!tmp_path.exists());
        assert!(!meta_path.exists());
    }
}
