use crate::config::AppConfig;
use crate::db::connection::Db;
use crate::index::IndexBuilder;
use crate::registry::connection_registry::ConnectionRegistry;
use crate::registry::node_registry::NodeRegistry;
use crate::tasks::TaskStore;
use std::sync::Arc;

pub struct AppState {
    pub db: Db,
    pub config: AppConfig,
    pub nodes: Arc<NodeRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub tasks: Arc<TaskStore>,
    pub index: Arc<IndexBuilder>,
}

impl AppState {
    pub fn new(db: Db, config: AppConfig) -> Self {
        let cache_entries = config.block_cache_max_entries;
        Self {
            nodes: Arc::new(NodeRegistry::new(db.clone())),
            connections: Arc::new(ConnectionRegistry::new()),
            tasks: Arc::new(TaskStore::new(db.clone())),
            index: Arc::new(IndexBuilder::new(cache_entries)),
            db,
            config,
        }
    }
}
