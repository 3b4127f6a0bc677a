//! Node identity, pairing fingerprint, and rotating token (C4).

use crate::db::connection::Db;
use crate::error::{AppError, Result};
use crate::models::node;
use base64::Engine;
use rand::RngCore;
use sync_protocol::model::{Node, NodeType};

pub struct NodeRegistry {
    db: Db,
}

impl NodeRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn list(&self) -> Result<Vec<Node>> {
        let conn = self.db.lock().await;
        Ok(node::list(&conn)?)
    }

    /// Mints a fresh 32-byte URL-safe token. The caller is responsible for
    /// transmitting it to the agent operator out-of-band exactly once.
    pub async fn create(&self, name: &str, address: &str, node_type: NodeType) -> Result<Node> {
        let token = mint_token();
        let conn = self.db.lock().await;
        let id = node::insert(&conn, name, address, node_type, &token)?;
        node::find_by_id(&conn, id)?.ok_or_else(|| AppError::NotFound(format!("node {id}")))
    }

    pub async fn update(&self, id: i64, name: Option<&str>, address: Option<&str>) -> Result<Node> {
        let conn = self.db.lock().await;
        let mut fields: Vec<(&str, &dyn rusqlite::types::ToSql)> = vec![];
        if let Some(n) = name {
            fields.push(("name", n));
        }
        if let Some(a) = address {
            fields.push(("address", a));
        }
        node::update_fields(&conn, id, &fields)?;
        node::find_by_id(&conn, id)?.ok_or_else(|| AppError::NotFound(format!("node {id}")))
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let conn = self.db.lock().await;
        node::delete(&conn, id)?;
        Ok(())
    }

    /// New token does not invalidate an open session; it only blocks the
    /// next reconnect attempt from using the old value.
    pub async fn rotate_token(&self, id: i64) -> Result<String> {
        let token = mint_token();
        let conn = self.db.lock().await;
        node::update_fields(&conn, id, &[("token", &token)])?;
        Ok(token)
    }

    /// Clears the pairing fingerprint so the next connecting agent can
    /// re-TOFU. Intended for hardware replacement.
    pub async fn reset_pairing(&self, id: i64) -> Result<()> {
        let conn = self.db.lock().await;
        node::update_fields(&conn, id, &[("agent_cert_fingerprint", &"")])?;
        Ok(())
    }

    /// Enrollment path only.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<Node>> {
        let conn = self.db.lock().await;
        Ok(node::find_by_token(&conn, token)?)
    }

    pub async fn validate_agent_token(&self, id: i64, token: &str) -> Result<()> {
        let conn = self.db.lock().await;
        let n = node::find_by_id(&conn, id)?.ok_or_else(|| AppError::NotFound(format!("node {id}")))?;
        if constant_time_eq(n.token.as_bytes(), token.as_bytes()) {
            Ok(())
        } else {
            Err(AppError::InvalidToken)
        }
    }

    /// TOFU pairing check: stores the fingerprint if this is the first
    /// successful hello, otherwise requires an exact match.
    pub async fn verify_or_pair_fingerprint(&self, id: i64, fingerprint: &str) -> Result<()> {
        let conn = self.db.lock().await;
        let n = node::find_by_id(&conn, id)?.ok_or_else(|| AppError::NotFound(format!("node {id}")))?;
        if n.agent_cert_fingerprint.is_empty() {
            node::update_fields(&conn, id, &[("agent_cert_fingerprint", &fingerprint)])?;
            return Ok(());
        }
        if constant_time_eq(n.agent_cert_fingerprint.as_bytes(), fingerprint.as_bytes()) {
            Ok(())
        } else {
            Err(AppError::FingerprintMismatch)
        }
    }

    pub async fn touch_last_seen(&self, id: i64) -> Result<()> {
        let conn = self.db.lock().await;
        node::touch_last_seen(&conn, id)?;
        Ok(())
    }
}

fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn constant_time_eq_accepts_equal_slices() {
        assert!(constant_time_eq(b"token-value", b"token-value"));
    }

    #[test]
    fn mint_token_is_url_safe_and_unpadded() {
        let t = mint_token();
        assert!(!t.contains('='));
        assert!(t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
