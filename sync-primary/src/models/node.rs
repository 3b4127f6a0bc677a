//! Row mapping for the `nodes` table. Business rules (token minting, TOFU
//! pairing, constant-time comparison) live in `registry::node_registry`;
//! this module only knows how to read and write rows.

use rusqlite::{params, Row};
use sync_protocol::model::{Node, NodeType};

fn node_type_from_str(s: &str) -> NodeType {
    match s {
        "ssh" => NodeType::Ssh,
        "custom" => NodeType::Custom,
        _ => NodeType::Agent,
    }
}

fn node_type_as_str(t: NodeType) -> &'static str {
    match t {
        NodeType::Agent => "agent",
        NodeType::Ssh => "ssh",
        NodeType::Custom => "custom",
    }
}

pub fn row_to_node(row: &Row) -> rusqlite::Result<Node> {
    let last_seen: Option<String> = row.get("last_seen")?;
    Ok(Node {
        id: row.get("id")?,
        name: row.get("name")?,
        address: row.get("address")?,
        node_type: node_type_from_str(&row.get::<_, String>("type")?),
        token: row.get("token")?,
        agent_cert_fingerprint: row.get("agent_cert_fingerprint")?,
        last_seen: last_seen.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&chrono::Utc))),
        install_status: row.get("install_status")?,
        agent_version: row.get("agent_version")?,
    })
}

pub fn list(conn: &rusqlite::Connection) -> rusqlite::Result<Vec<Node>> {
    let mut stmt = conn.prepare("SELECT * FROM nodes ORDER BY id")?;
    let rows = stmt.query_map([], row_to_node)?;
    rows.collect()
}

pub fn find_by_id(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<Option<Node>> {
    conn.query_row("SELECT * FROM nodes WHERE id = ?1", params![id], row_to_node)
        .map(Some)
        .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
}

pub fn find_by_token(conn: &rusqlite::Connection, token: &str) -> rusqlite::Result<Option<Node>> {
    conn.query_row(
        "SELECT * FROM nodes WHERE token = ?1",
        params![token],
        row_to_node,
    )
    .map(Some)
    .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })
}

#[allow(clippy::too_many_arguments)]
pub fn insert(
    conn: &rusqlite::Connection,
    name: &str,
    address: &str,
    node_type: NodeType,
    token: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO nodes (name, address, type, token) VALUES (?1, ?2, ?3, ?4)",
        params![name, address, node_type_as_str(node_type), token],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_fields(
    conn: &rusqlite::Connection,
    id: i64,
    fields: &[(&str, &dyn rusqlite::types::ToSql)],
) -> rusqlite::Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let set_clause = fields
        .iter()
        .enumerate()
        .map(|(i, (col, _))| format!("{col} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE nodes SET {set_clause}, updated_at = datetime('now') WHERE id = ?{}",
        fields.len() + 1
    );
    let mut params: Vec<&dyn rusqlite::types::ToSql> = fields.iter().map(|(_, v)| *v).collect();
    params.push(&id);
    conn.execute(&sql, params.as_slice())?;
    Ok(())
}

pub fn delete(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn touch_last_seen(conn: &rusqlite::Connection, id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE nodes SET last_seen = datetime('now') WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}
