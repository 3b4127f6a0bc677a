//! Mirror Manifest (C8): records every path written by the last mirror
//! sync so the next run can delete whatever the new index no longer
//! emits. Read tolerates a missing file (first run) and rejects an
//! unknown version; writes are tmp-then-rename so the file is never
//! observed truncated or invalid.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use sync_protocol::model::{MirrorManifest, MANIFEST_FILE_NAME, MANIFEST_VERSION};

pub fn manifest_path(target: &Path) -> PathBuf {
    target.join(MANIFEST_FILE_NAME)
}

pub fn read_manifest(target: &Path) -> anyhow::Result<Option<MirrorManifest>> {
    match std::fs::read(manifest_path(target)) {
        Ok(bytes) => {
            let manifest: MirrorManifest = serde_json::from_slice(&bytes)?;
            if manifest.version != MANIFEST_VERSION {
                anyhow::bail!("unsupported mirror manifest version {}", manifest.version);
            }
            Ok(Some(manifest))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn write_manifest(target: &Path, paths: Vec<String>, sync_count: u64) -> anyhow::Result<()> {
    let manifest = MirrorManifest::new(paths, sync_count);
    let path = manifest_path(target);
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(&manifest)?)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// Whether this run should do the full manifest read/delete walk. With
/// `fast_delete` off, every run is a full scan. With it on, only every
/// `fullscan_every`th run scans; the skipped runs rely on the next full
/// scan to catch anything they would have deleted.
pub fn should_full_scan(fast_delete: bool, fullscan_every: Option<u32>, sync_count: u64) -> bool {
    if !fast_delete {
        return true;
    }
    let every = fullscan_every.unwrap_or(10).max(1) as u64;
    sync_count % every == 0
}

/// Removes any path in `previous` that is absent from `expected`. The
/// manifest file itself is never listed in `previous.paths` and is
/// therefore never touched here. Returns the set of paths actually
/// removed, for empty-directory pruning and logging.
pub fn delete_stale(
    target: &Path,
    previous: &MirrorManifest,
    expected: &HashSet<String>,
) -> std::io::Result<Vec<String>> {
    let mut removed = Vec::new();
    for path in &previous.paths {
        if expected.contains(path) {
            continue;
        }
        let full = target.join(path);
        match std::fs::remove_file(&full) {
            Ok(()) => removed.push(path.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Opt-in: walk upward from each removed file's parent directory toward
/// `target`, removing directories that are now empty, stopping as soon as
/// a directory is still a prefix of some path in `expected`.
pub fn clean_empty_dirs(target: &Path, removed: &[String], expected: &HashSet<String>) {
    let mut dirs: Vec<PathBuf> = removed
        .iter()
        .filter_map(|p| Path::new(p).parent().filter(|pp| !pp.as_os_str().is_empty()))
        .map(|p| p.to_path_buf())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    dirs.dedup();

    for start in dirs {
        let mut cur = Some(start);
        while let Some(dir) = cur {
            let dir_str = dir.to_string_lossy().replace('\\', "/");
            let still_referenced = expected
                .iter()
                .any(|e| e == &dir_str || e.starts_with(&format!("{dir_str}/")));
            if still_referenced {
                break;
            }
            if std::fs::remove_dir(target.join(&dir)).is_err() {
                break;
            }
            cur = dir.parent().filter(|p| !p.as_os_str().is_empty()).map(|p| p.to_path_buf());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[test]
    fn missing_manifest_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(read_manifest(dir.path()).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            manifest_path(dir.path()),
            r#"{"version":99,"created_at":"2024-01-01T00:00:00Z","sync_count":0,"paths":[]}"#,
        )
        .unwrap();
        assert!(read_manifest(dir.path()).is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), vec!["b.txt".into(), "a.txt".into()], 3).unwrap();
        let manifest = read_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(manifest.paths, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert_eq!(manifest.sync_count, 3);
    }

    #[test]
    fn delete_stale_removes_only_paths_absent_from_expected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("old.txt"), b"o").unwrap();

        let previous = MirrorManifest::new(vec!["keep.txt".into(), "old.txt".into()], 0);
        let mut expected = HashSet::new();
        expected.insert("keep.txt".to_string());

        let removed = delete_stale(dir.path(), &previous, &expected).unwrap();
        assert_eq!(removed, vec!["old.txt".to_string()]);
        assert!(dir.path().join("keep.txt").exists());
        assert!(!dir.path().join("old.txt").exists());
    }

    #[test]
    fn fast_delete_skips_non_multiple_runs() {
        assert!(should_full_scan(false, None, 5));
        assert!(!should_full_scan(true, Some(10), 3));
        assert!(should_full_scan(true, Some(10), 10));
    }

    #[test]
    fn clean_empty_dirs_stops_at_a_still_referenced_ancestor() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/keep.txt"), b"k").unwrap();

        let removed = vec!["a/b/old.txt".to_string()];
        let mut expected = HashSet::new();
        expected.insert("a/keep.txt".to_string());

        clean_empty_dirs(dir.path(), &removed, &expected);
        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a").exists());
    }
}
