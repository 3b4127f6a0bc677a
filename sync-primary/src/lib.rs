//! Sync Primary Library
//!
//! Task dispatch, mTLS transport, and the block index builder for the
//! gohook-sync primary node.

pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod index;
pub mod models;
pub mod reaper;
pub mod registry;
pub mod state;
pub mod tasks;
pub mod tls;
pub mod transport;
pub mod watcher;

pub use config::AppConfig;
pub use error::AppError;
pub use state::AppState;
pub type Result<T> = std::result::Result<T, AppError>;
