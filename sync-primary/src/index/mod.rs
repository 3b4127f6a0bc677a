//! Block Hasher & Index Builder (C2): walks a project root, applies the
//! ignore matcher, emits one `IndexFileEntry` per regular file with
//! adaptive block-size SHA-256 hashes.

use lru::LruCache;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sync_protocol::ignore::IgnoreSet;
use sync_protocol::model::{IndexFileEntry, SymlinkPolicy, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Above this many blocks at the current size, double the block size
/// (until the 4 MiB cap).
const MAX_BLOCKS_BEFORE_DOUBLING: u64 = 256;

type CacheKey = (PathBuf, u64, i64, u64);

pub struct IndexBuilder {
    cache: Mutex<LruCache<CacheKey, Vec<String>>>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl IndexBuilder {
    pub fn new(max_cache_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_cache_entries.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(cap)),
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Walks `root`, applying `ignore`, and calls `emit` once per regular
    /// file in the order discovered. Any I/O error aborts the whole index:
    /// either the task's index is fully consistent or the task fails.
    pub fn build_index<F>(
        &self,
        root: &Path,
        ignore: &IgnoreSet,
        symlink_policy: SymlinkPolicy,
        mut emit: F,
    ) -> std::io::Result<()>
    where
        F: FnMut(IndexFileEntry) -> std::io::Result<()>,
    {
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let rel = path.strip_prefix(root).unwrap_or(&path);
                let file_type = entry.file_type()?;

                if file_type.is_symlink() && symlink_policy == SymlinkPolicy::Skip {
                    continue;
                }

                let is_dir = if file_type.is_symlink() {
                    path.is_dir()
                } else {
                    file_type.is_dir()
                };

                if ignore.is_ignored(rel, is_dir) {
                    continue;
                }

                if is_dir {
                    stack.push(path);
                    continue;
                }

                if !path.is_file() {
                    continue;
                }

                let entry = self.hash_entry(&path, rel)?;
                emit(entry)?;
            }
        }
        Ok(())
    }

    /// Overlay delta mode: iterate just the given relative paths instead
    /// of a full walk. Callers must only invoke this when the pending
    /// change queue contains nothing but `created`/`modified` rows — any
    /// `renamed`/`deleted` row forces a full-walk fallback.
    pub fn build_index_overlay<F>(
        &self,
        root: &Path,
        ignore: &IgnoreSet,
        paths: &[String],
        mut emit: F,
    ) -> std::io::Result<()>
    where
        F: FnMut(IndexFileEntry) -> std::io::Result<()>,
    {
        for rel_str in paths {
            let rel = Path::new(rel_str);
            if ignore.is_ignored(rel, false) {
                continue;
            }
            let full = root.join(rel);
            if !full.is_file() {
                continue;
            }
            let entry = self.hash_entry(&full, rel)?;
            emit(entry)?;
        }
        Ok(())
    }

    fn hash_entry(&self, full_path: &Path, rel_path: &Path) -> std::io::Result<IndexFileEntry> {
        let meta = std::fs::metadata(full_path)?;
        let size = meta.len();
        let mtime_unix = mtime_unix(&meta);
        let mtime_ns = mtime_ns(&meta);
        let mode = file_mode(&meta);
        let block_size = compute_block_size(size);

        let key: CacheKey = (full_path.to_path_buf(), size, mtime_ns, block_size);
        if let Some(blocks) = self.cache.lock().unwrap().get(&key).cloned() {
            self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(IndexFileEntry {
                path: normalize_path(rel_path),
                size,
                mode,
                mtime_unix,
                block_size,
                blocks,
            });
        }
        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let blocks = hash_file_blocks(full_path, size, block_size)?;
        self.cache.lock().unwrap().put(key, blocks.clone());

        Ok(IndexFileEntry {
            path: normalize_path(rel_path),
            size,
            mode,
            mtime_unix,
            block_size,
            blocks,
        })
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(std::sync::atomic::Ordering::Relaxed),
            self.misses.load(std::sync::atomic::Ordering::Relaxed),
        )
    }
}

/// Start at 128 KiB, double until the file fits in <= 256 blocks or the
/// 4 MiB cap is hit.
pub fn compute_block_size(file_size: u64) -> u64 {
    let mut block_size = MIN_BLOCK_SIZE;
    while block_size < MAX_BLOCK_SIZE && file_size.div_ceil(block_size) > MAX_BLOCKS_BEFORE_DOUBLING {
        block_size *= 2;
    }
    block_size.min(MAX_BLOCK_SIZE)
}

fn hash_file_blocks(path: &Path, size: u64, block_size: u64) -> std::io::Result<Vec<String>> {
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut file = std::fs::File::open(path)?;
    let block_count = size.div_ceil(block_size) as usize;
    let mut blocks = Vec::with_capacity(block_count);
    let mut buf = vec![0u8; block_size as usize];

    for _ in 0..block_count {
        let mut total_read = 0usize;
        loop {
            let n = file.read(&mut buf[total_read..])?;
            if n == 0 {
                break;
            }
            total_read += n;
            if total_read == buf.len() {
                break;
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(&buf[..total_read]);
        blocks.push(hex::encode(hasher.finalize()));
    }
    Ok(blocks)
}

fn normalize_path(p: &Path) -> String {
    p.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

fn mtime_unix(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
}

#[cfg(not(unix))]
fn mtime_ns(meta: &std::fs::Metadata) -> i64 {
    mtime_unix(meta) * 1_000_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_stays_at_floor_for_small_files() {
        assert_eq!(compute_block_size(1024), MIN_BLOCK_SIZE);
    }

    #[test]
    fn block_size_doubles_past_the_block_count_threshold() {
        // 256 blocks at 128 KiB is the threshold; one more block should double.
        let just_over = MIN_BLOCK_SIZE * MAX_BLOCKS_BEFORE_DOUBLING + 1;
        assert_eq!(compute_block_size(just_over), MIN_BLOCK_SIZE * 2);
    }

    #[test]
    fn block_size_caps_at_4mib() {
        assert_eq!(compute_block_size(u64::MAX / 2), MAX_BLOCK_SIZE);
    }

    #[test]
    fn empty_file_yields_zero_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();
        let blocks = hash_file_blocks(&path, 0, MIN_BLOCK_SIZE).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn builds_index_over_a_small_tree_respecting_ignores() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), b"ref: refs/heads/main").unwrap();

        let ignore = IgnoreSet::build(dir.path(), &[], &[]).unwrap();
        let builder = IndexBuilder::new(64);
        let mut seen = Vec::new();
        builder
            .build_index(dir.path(), &ignore, SymlinkPolicy::Skip, |e| {
                seen.push(e.path);
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec!["keep.txt".to_string()]);
    }

    #[test]
    fn cache_hit_on_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"stable content").unwrap();

        let ignore = IgnoreSet::build(dir.path(), &[], &[]).unwrap();
        let builder = IndexBuilder::new(64);

        let mut first = Vec::new();
        builder
            .build_index(dir.path(), &ignore, SymlinkPolicy::Skip, |e| {
                first.push(e);
                Ok(())
            })
            .unwrap();
        let mut second = Vec::new();
        builder
            .build_index(dir.path(), &ignore, SymlinkPolicy::Skip, |e| {
                second.push(e);
                Ok(())
            })
            .unwrap();

        assert_eq!(first[0].blocks, second[0].blocks);
        let (hits, misses) = builder.cache_stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }
}
