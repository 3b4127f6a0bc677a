//! Command-line surface (§6 "Agent CLI surface"). Every flag has a
//! matching environment variable via clap's `env` attribute, applied
//! before these values override the layered file/env config in
//! [`crate::config::AgentConfig::apply_cli_overrides`].

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a layered TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// `host:port` of the primary's mTLS transport listener
    #[arg(long, env = "SYNC_AGENT_SERVER")]
    pub server: Option<String>,

    /// Enrollment / hello token
    #[arg(long, env = "SYNC_AGENT_TOKEN")]
    pub token: Option<String>,

    /// Working directory for state, TLS material and temp files
    #[arg(long = "data-dir", env = "SYNC_AGENT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Pinned primary certificate fingerprint (hex sha-256); omit for TOFU
    #[arg(long = "server-fingerprint", env = "SYNC_AGENT_SERVER_FINGERPRINT")]
    pub server_fingerprint: Option<String>,

    /// Node id assigned by the primary; optional after first enrollment,
    /// since it is then persisted in `state.json`
    #[arg(long = "node-id", env = "SYNC_AGENT_NODE_ID")]
    pub node_id: Option<i64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}
