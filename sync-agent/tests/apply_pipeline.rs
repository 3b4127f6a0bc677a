//! End-to-end coverage for the delta apply pipeline, driving `apply::run_task`
//! over an in-memory duplex stream standing in for the mTLS session with a
//! hand-scripted primary on the other end.

use sha2::{Digest, Sha256};
use std::path::Path;
use sync_agent::apply;
use sync_agent::manifest;
use sync_protocol::framing::{read_message, write_frame, write_message};
use sync_protocol::model::{ErrorCode, IndexFileEntry, SymlinkPolicy, SyncStrategy, TaskPayload};
use sync_protocol::Message;
use tokio::io::DuplexStream;

const TASK_ID: &str = "t-1";

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn entry_for(path: &str, content: &[u8], block_size: u64, mtime_unix: i64) -> IndexFileEntry {
    let blocks = content
        .chunks(block_size as usize)
        .map(sha256_hex)
        .collect();
    IndexFileEntry {
        path: path.to_string(),
        size: content.len() as u64,
        mode: 0o644,
        mtime_unix,
        block_size,
        blocks,
    }
}

fn payload(target: &Path, strategy: SyncStrategy, fast_delete: bool) -> TaskPayload {
    TaskPayload {
        project_name: "proj".into(),
        target_path: target.to_string_lossy().to_string(),
        strategy,
        ignore_defaults: true,
        ignore_patterns: vec![],
        ignore_files: vec![],
        ignore_permissions: false,
        preserve_mode: Some(true),
        preserve_mtime: Some(true),
        symlink_policy: SymlinkPolicy::Skip,
        fast_delete,
        fullscan_every: None,
        clean_empty_dirs: false,
        sync_empty_dirs: false,
        overlay_paths: None,
    }
}

/// Plays the primary's half of index ingestion: reads `sync_start`, streams
/// one `index_file` per entry, then `index_end`. Leaves the block-request
/// phase to the caller.
async fn send_index(primary: &mut DuplexStream, entries: Vec<IndexFileEntry>) {
    match read_message(primary).await.unwrap() {
        Message::SyncStart { task_id } => assert_eq!(task_id, TASK_ID),
        other => panic!("expected sync_start, got {}", other.kind()),
    }
    for file in entries {
        write_message(
            primary,
            &Message::IndexFile {
                task_id: TASK_ID.to_string(),
                file,
            },
        )
        .await
        .unwrap();
    }
    write_message(
        primary,
        &Message::IndexEnd {
            task_id: TASK_ID.to_string(),
        },
    )
    .await
    .unwrap();
}

/// Reads one block request (single or batch-of-one) and responds with the
/// given bytes, asserting the requested index matches.
async fn serve_one_block(primary: &mut DuplexStream, expect_index: u64, content: &[u8]) {
    let index = match read_message(primary).await.unwrap() {
        Message::BlockRequest { index, .. } => index,
        Message::BlockBatchRequest { indices, .. } => {
            assert_eq!(indices.len(), 1);
            indices[0]
        }
        other => panic!("expected a block request, got {}", other.kind()),
    };
    assert_eq!(index, expect_index);
    write_message(
        primary,
        &Message::BlockResponseBin {
            task_id: TASK_ID.to_string(),
            path: "a.bin".to_string(),
            index,
            hash: sha256_hex(content),
            size: content.len() as u64,
            error_code: None,
            error: None,
        },
    )
    .await
    .unwrap();
    write_frame(primary, content).await.unwrap();
}

/// Reads one block request and reports it missing, the way the primary
/// does when its own read of that block fails.
async fn serve_one_block_missing(primary: &mut DuplexStream, expect_index: u64) {
    let index = match read_message(primary).await.unwrap() {
        Message::BlockRequest { index, .. } => index,
        other => panic!("expected a block request, got {}", other.kind()),
    };
    assert_eq!(index, expect_index);
    write_message(
        primary,
        &Message::BlockResponseBin {
            task_id: TASK_ID.to_string(),
            path: "a.bin".to_string(),
            index,
            hash: String::new(),
            size: 0,
            error_code: Some(ErrorCode::MissingBlock),
            error: Some("block reader failed".to_string()),
        },
    )
    .await
    .unwrap();
    write_frame(primary, &[]).await.unwrap();
}

#[tokio::test]
async fn identical_trees_need_no_block_requests() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    let content = b"hello world, nothing changed here";
    std::fs::write(target.join("a.bin"), content).unwrap();

    let entry = entry_for("a.bin", content, 8, 1_700_000_000);
    let task_payload = payload(&target, SyncStrategy::Mirror, false);

    let (mut agent_stream, mut primary_stream) = tokio::io::duplex(64 * 1024);
    let entries = vec![entry];
    let (outcome, _) = tokio::join!(
        apply::run_task(&mut agent_stream, TASK_ID, &task_payload, 64 * 1024, None),
        send_index(&mut primary_stream, entries),
    );
    let outcome = outcome.unwrap();

    assert_eq!(outcome.files, 1);
    assert_eq!(outcome.blocks, 0);
    assert_eq!(outcome.bytes, 0);

    let m = manifest::read_manifest(&target).unwrap().unwrap();
    assert_eq!(m.paths, vec!["a.bin".to_string()]);
}

#[tokio::test]
async fn a_single_changed_block_triggers_exactly_one_fetch() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("target");
    std::fs::create_dir_all(&target).unwrap();

    // Three 4-byte blocks; only the middle one differs on disk.
    std::fs::write(target.join("a.bin"), b"AAAAZZZZCCCC").unwrap();
    let full = b"AAAAXXXXCCCC";
    let entry = entry_for("a.bin", full, 4, 1_700_000_100);
    let task_payload = payload(&target, SyncStrategy::Mirror, false);

    let (mut agent_stream, mut primary_stream) = tokio::io::duplex(64 * 1024);
    let entries = vec![entry];
    let primary = async {
        send_index(&mut primary_stream, entries).await;
        serve_one_block(&mut primary_stream, 1, b"XXXX").await;
    };
    let (outcome, _) = tokio::join!(
        apply::run_task(&mut agent_stream, TASK_ID, &task_payload, 64 * 1024, Some(1)),
        primary,
    );
    let outcome = outcome.unwrap();

    assert_eq!(outcome.blocks, 1);
    assert_eq!(outcome.bytes, 4);
    assert_eq!(std::fs::read(target.join("a.bin")).unwrap(), full);

    let mtime = filetime::FileTime::from_last_modification_time(
        &std::fs::metadata(target.join("a.bin")).unwrap(),
    );
    assert_eq!(mtime.seconds(), 1_700_000_100);
}

#[tokio::test]
async fn mirror_sync_deletes_paths_the_new_index_no_longer_lists() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("target");
    std::fs::create_dir_all(&target).unwrap();
    std::fs::write(target.join("keep.txt"), b"keep me").unwrap();
    std::fs::write(target.join("old.txt"), b"delete me").unwrap();
    manifest::write_manifest(&target, vec!["keep.txt".into(), "old.txt".into()], 1).unwrap();

    let entry = entry_for("keep.txt", b"keep me", 64, 1_700_000_200);
    let task_payload = payload(&target, SyncStrategy::Mirror, false);

    let (mut agent_stream, mut primary_stream) = tokio::io::duplex(64 * 1024);
    let entries = vec![entry];
    let (outcome, _) = tokio::join!(
        apply::run_task(&mut agent_stream, TASK_ID, &task_payload, 64 * 1024, None),
        send_index(&mut primary_stream, entries),
    );
    outcome.unwrap();

    assert!(target.join("keep.txt").exists());
    assert!(!target.join("old.txt").exists());
    let m = manifest::read_manifest(&target).unwrap().unwrap();
    assert_eq!(m.paths, vec!["keep.txt".to_string()]);
}

#[tokio::test]
async fn a_second_attempt_only_fetches_the_block_the_first_attempt_never_got() {
    let dir = tempfile::TempDir::new().unwrap();
    let target = dir.path().join("target");
    std::fs::create_dir_all(&target).unwrap();

    let full = b"AAAAAAAABBBBBBBB";
    let entry = entry_for("a.bin", full, 8, 1_700_000_300);
    let task_payload = payload(&target, SyncStrategy::Mirror, true);

    // First attempt: block 0 lands, block 1 comes back as missing (stands in
    // for the primary losing the connection partway through the transfer).
    {
        let (mut agent_stream, mut primary_stream) = tokio::io::duplex(64 * 1024);
        let entries = vec![entry.clone()];
        let primary = async {
            send_index(&mut primary_stream, entries).await;
            serve_one_block(&mut primary_stream, 0, b"AAAAAAAA").await;
            serve_one_block_missing(&mut primary_stream, 1).await;
        };
        let (outcome, _) = tokio::join!(
            apply::run_task(&mut agent_stream, TASK_ID, &task_payload, 64 * 1024, Some(1)),
            primary,
        );
        assert!(outcome.is_err());
    }

    let leftovers: Vec<_> = std::fs::read_dir(&target)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("gohook-sync-tmp-"))
        .collect();
    assert_eq!(leftovers.len(), 2, "expected a tmp file and its json sidecar");

    // Second attempt: only block 1 should ever be requested.
    {
        let (mut agent_stream, mut primary_stream) = tokio::io::duplex(64 * 1024);
        let entries = vec![entry];
        let primary = async {
            send_index(&mut primary_stream, entries).await;
            serve_one_block(&mut primary_stream, 1, b"BBBBBBBB").await;
        };
        let (outcome, _) = tokio::join!(
            apply::run_task(&mut agent_stream, TASK_ID, &task_payload, 64 * 1024, Some(1)),
            primary,
        );
        let outcome = outcome.unwrap();
        assert_eq!(outcome.blocks, 1);
        assert_eq!(outcome.bytes, 8);
    }

    assert_eq!(std::fs::read(target.join("a.bin")).unwrap(), full);
    let leftovers: Vec<_> = std::fs::read_dir(&target)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains("gohook-sync-tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "resume sidecar/tmp should be cleaned up after success");
}
