//! Agent identity persistence (§6 "Agent state"): `<data_dir>/state.json`
//! carries whatever the primary assigned at enrollment so a restart does
//! not re-enroll.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub node_id: Option<i64>,
    pub token: String,
    pub server: String,
    pub updated: chrono::DateTime<chrono::Utc>,
}

fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
}

impl AgentState {
    pub fn new(node_id: Option<i64>, token: String, server: String) -> Self {
        Self {
            node_id,
            token,
            server,
            updated: chrono::Utc::now(),
        }
    }

    /// Tolerates a missing file (first run).
    pub fn load(data_dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = state_path(data_dir);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic tmp-then-rename write, same pattern as the mirror manifest.
    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let path = state_path(data_dir);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_state_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(AgentState::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = TempDir::new().unwrap();
        let state = AgentState::new(Some(7), "tok".to_string(), "primary:9001".to_string());
        state.save(dir.path()).unwrap();

        let loaded = AgentState::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.node_id, Some(7));
        assert_eq!(loaded.token, "tok");
        assert_eq!(loaded.server, "primary:9001");
    }
}
