//! Data model shared by the primary and the agent: node identity, task
//! lifecycle, the block index, and the on-disk manifest/resume formats.

use serde::{Deserialize, Serialize};

/// Node kind. Only `Agent` has an implemented dispatch path today; the
/// other variants are recognized so a future rsync/SSH driver has somewhere
/// to land without reshaping the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Agent,
    Ssh,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub address: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub token: String,
    /// sha256 hex of the first-seen peer certificate; empty = unpaired.
    pub agent_cert_fingerprint: String,
    pub last_seen: Option<chrono::DateTime<chrono::Utc>>,
    pub install_status: String,
    pub agent_version: Option<String>,
}

impl Node {
    pub fn is_paired(&self) -> bool {
        !self.agent_cert_fingerprint.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            "retrying" => Some(TaskStatus::Retrying),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_name: String,
    pub node_id: i64,
    pub driver: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub payload: TaskPayload,
    pub logs: String,
    pub last_error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub files_total: u64,
    pub blocks_total: u64,
    pub bytes_total: u64,
    pub duration_ms: Option<u64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStrategy {
    Mirror,
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    Skip,
    Follow,
}

impl Default for SymlinkPolicy {
    fn default() -> Self {
        SymlinkPolicy::Skip
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub project_name: String,
    pub target_path: String,
    pub strategy: SyncStrategy,
    #[serde(default)]
    pub ignore_defaults: bool,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub ignore_files: Vec<String>,
    #[serde(default)]
    pub ignore_permissions: bool,
    #[serde(default)]
    pub preserve_mode: Option<bool>,
    #[serde(default)]
    pub preserve_mtime: Option<bool>,
    #[serde(default)]
    pub symlink_policy: SymlinkPolicy,
    #[serde(default)]
    pub fast_delete: bool,
    #[serde(default)]
    pub fullscan_every: Option<u32>,
    #[serde(default)]
    pub clean_empty_dirs: bool,
    #[serde(default)]
    pub sync_empty_dirs: bool,
    /// Overlay delta mode only: the `created`/`modified` paths to index
    /// instead of a full walk. `None` means fall back to a full walk
    /// (always the case for mirror mode, and for overlay when the change
    /// queue held a `renamed`/`deleted` row at enqueue time).
    #[serde(default)]
    pub overlay_paths: Option<Vec<String>>,
}

impl TaskPayload {
    /// Reject `""` and `"/"` per the agent preflight invariant.
    pub fn validate_target_path(&self) -> std::result::Result<(), &'static str> {
        if self.target_path.is_empty() || self.target_path == "/" {
            return Err("target path must not be empty or \"/\"");
        }
        Ok(())
    }
}

/// Power-of-two block size, clamped to the [128 KiB, 4 MiB] range mandated
/// by the adaptive index builder.
pub const MIN_BLOCK_SIZE: u64 = 128 * 1024;
pub const MAX_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFileEntry {
    /// Forward-slash, relative to project root.
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime_unix: i64,
    pub block_size: u64,
    /// Lowercase hex sha-256 per block, in order.
    pub blocks: Vec<String>,
}

impl IndexFileEntry {
    pub fn block_count(&self) -> usize {
        if self.size == 0 {
            return 0;
        }
        self.size.div_ceil(self.block_size) as usize
    }

    pub fn block_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.block_size;
        (self.size - start).min(self.block_size)
    }
}

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE_NAME: &str = ".gohook-sync-manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorManifest {
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub sync_count: u64,
    pub paths: Vec<String>,
}

impl MirrorManifest {
    pub fn new(mut paths: Vec<String>, sync_count: u64) -> Self {
        paths.sort();
        paths.dedup();
        Self {
            version: MANIFEST_VERSION,
            created_at: chrono::Utc::now(),
            sync_count,
            paths,
        }
    }
}

pub const RESUME_META_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResumeMeta {
    pub version: u32,
    pub path: String,
    pub size: u64,
    pub block_size: u64,
    /// sha-256 over the concatenated per-block hash vector of the index
    /// entry this resume is tracking — lets us tell a stale sidecar from
    /// one that matches the task we're currently applying.
    pub blocks_digest: String,
    /// Indices of blocks already written into the temp file.
    pub done: Vec<u64>,
}

impl FileResumeMeta {
    pub fn digest_for(entry: &IndexFileEntry) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for b in &entry.blocks {
            hasher.update(b.as_bytes());
        }
        hasher.update(entry.block_size.to_le_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeType {
    Created,
    Modified,
    Deleted,
    Renamed,
}

impl FileChangeType {
    /// created -> modified promotion is a no-op; deleted always overrides.
    pub fn merge(current: FileChangeType, incoming: FileChangeType) -> FileChangeType {
        use FileChangeType::*;
        match (current, incoming) {
            (_, Deleted) => Deleted,
            (Created, Modified) => Created,
            (_, other) => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: FileChangeType,
    pub project_name: String,
    pub mod_time: chrono::DateTime<chrono::Utc>,
    pub processed: bool,
}

/// Wire-facing error taxonomy (§7). Distinct from the Rust-internal error
/// enums, which map down to these for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Eacces,
    Eperm,
    Erofs,
    Enospc,
    Enoent,
    InvalidTarget,
    Proto,
    MissingBlock,
    HashMismatch,
    Index,
    Timeout,
    Unknown,
}

impl ErrorCode {
    /// Whether the reaper/controller could reasonably retry a task that
    /// failed with this code.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Enospc
                | ErrorCode::Enoent
                | ErrorCode::Proto
                | ErrorCode::MissingBlock
                | ErrorCode::HashMismatch
                | ErrorCode::Index
                | ErrorCode::Timeout
        )
    }
}
