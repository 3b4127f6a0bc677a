//! gitignore-style path filter shared by the index builder, the manifest
//! writer and the mirror-delete walker, so "present in manifest" and
//! "present in index" never disagree for the same path.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Paths excluded unless the caller opts out of defaults via
/// `TaskPayload.ignore_defaults == false` meaning "use only these plus
/// caller patterns" — defaults are always layered in regardless, they are
/// baseline hygiene, not a feature toggle.
const BUILTIN_DEFAULTS: &[&str] = &[
    ".git",
    "node_modules",
    ".DS_Store",
    ".gohook-sync-manifest.json",
    ".gohook-sync-tmp-*",
];

pub struct IgnoreSet {
    matcher: Gitignore,
}

impl IgnoreSet {
    /// Build a matcher for a project root from caller patterns and zero or
    /// more ignore files (read relative to `root`). Definition order is
    /// preserved: built-in defaults first, then `ignore_files` in the order
    /// given, then `ignore_patterns`; within the combined set, last match
    /// wins, which is `ignore::gitignore`'s native semantics.
    pub fn build(
        root: &Path,
        ignore_patterns: &[String],
        ignore_files: &[String],
    ) -> Result<Self, ignore::Error> {
        let mut builder = GitignoreBuilder::new(root);

        for pattern in BUILTIN_DEFAULTS {
            builder.add_line(None, pattern)?;
        }
        for file in ignore_files {
            let path = root.join(file);
            if path.exists() {
                if let Some(err) = builder.add(&path) {
                    return Err(err);
                }
            }
        }
        for pattern in ignore_patterns {
            builder.add_line(None, pattern)?;
        }

        let matcher = builder.build()?;
        Ok(Self { matcher })
    }

    /// `path` must be relative to the project root.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(path, is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn excludes_builtin_defaults() {
        let dir = TempDir::new().unwrap();
        let set = IgnoreSet::build(dir.path(), &[], &[]).unwrap();
        assert!(set.is_ignored(Path::new(".git/HEAD"), false));
        assert!(set.is_ignored(Path::new("node_modules/x/index.js"), false));
    }

    #[test]
    fn negation_overrides_an_earlier_exclude() {
        let dir = TempDir::new().unwrap();
        let patterns = vec!["*.log".to_string(), "!keep.log".to_string()];
        let set = IgnoreSet::build(dir.path(), &patterns, &[]).unwrap();
        assert!(set.is_ignored(Path::new("debug.log"), false));
        assert!(!set.is_ignored(Path::new("keep.log"), false));
    }

    #[test]
    fn reads_an_ignore_file_from_project_root() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join(".syncignore")).unwrap();
        writeln!(f, "dist/").unwrap();
        drop(f);

        let set = IgnoreSet::build(dir.path(), &[], &[".syncignore".to_string()]).unwrap();
        assert!(set.is_ignored(Path::new("dist"), true));
        assert!(!set.is_ignored(Path::new("src"), true));
    }

    #[test]
    fn directory_only_pattern_does_not_match_a_file() {
        let dir = TempDir::new().unwrap();
        let patterns = vec!["build/".to_string()];
        let set = IgnoreSet::build(dir.path(), &patterns, &[]).unwrap();
        assert!(set.is_ignored(Path::new("build"), true));
        assert!(!set.is_ignored(Path::new("build"), false));
    }
}
