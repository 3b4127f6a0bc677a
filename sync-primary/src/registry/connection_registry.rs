//! In-memory online/last-seen table (C11), lost on restart — the
//! persisted `Node.last_seen` column is the fallback for UI display
//! across a process restart.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const CONNECTED_TTL: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy)]
struct Entry {
    connected: bool,
    last_seen: Instant,
}

pub struct ConnectionRegistry {
    nodes: DashMap<i64, Entry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Unpaired,
    Connected,
    Disconnected,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    pub fn mark_connected(&self, node_id: i64) {
        self.nodes.insert(
            node_id,
            Entry {
                connected: true,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn touch(&self, node_id: i64) {
        if let Some(mut e) = self.nodes.get_mut(&node_id) {
            e.last_seen = Instant::now();
        } else {
            self.mark_connected(node_id);
        }
    }

    pub fn mark_disconnected(&self, node_id: i64) {
        if let Some(mut e) = self.nodes.get_mut(&node_id) {
            e.connected = false;
        }
    }

    /// `has_history` should come from whether `Node.last_seen` is set, so
    /// status survives a registry reset on restart.
    pub fn connection_status(&self, node_id: i64, is_paired: bool, has_history: bool) -> ConnectionStatus {
        if !is_paired && !has_history {
            return ConnectionStatus::Unpaired;
        }
        match self.nodes.get(&node_id) {
            Some(e) if e.connected && e.last_seen.elapsed() < CONNECTED_TTL => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaired_with_no_history_reports_unpaired() {
        let reg = ConnectionRegistry::new();
        assert_eq!(reg.connection_status(1, false, false), ConnectionStatus::Unpaired);
    }

    #[test]
    fn connected_node_within_ttl_reports_connected() {
        let reg = ConnectionRegistry::new();
        reg.mark_connected(1);
        assert_eq!(reg.connection_status(1, true, true), ConnectionStatus::Connected);
    }

    #[test]
    fn disconnected_after_mark_disconnected() {
        let reg = ConnectionRegistry::new();
        reg.mark_connected(1);
        reg.mark_disconnected(1);
        assert_eq!(reg.connection_status(1, true, true), ConnectionStatus::Disconnected);
    }
}
