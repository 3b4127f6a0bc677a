use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub tls_dir: PathBuf,
    pub log_level: String,
    pub reaper_max_running_age_secs: u64,
    pub reaper_interval_secs: u64,
    pub debounce_default_ms: u64,
    pub block_cache_max_entries: usize,
    pub server_fingerprint_override: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("SYNC_DATA_DIR").unwrap_or_else(|_| "./data".into()),
        );

        Self {
            listen_addr: std::env::var("SYNC_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9001".into()),
            db_path: data_dir.join("sync-primary.db"),
            tls_dir: PathBuf::from(
                std::env::var("SYNC_TLS_DIR").unwrap_or_else(|_| "./sync_tls".into()),
            ),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            reaper_max_running_age_secs: std::env::var("SYNC_REAPER_MAX_AGE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30 * 60),
            reaper_interval_secs: std::env::var("SYNC_REAPER_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            debounce_default_ms: std::env::var("SYNC_DEBOUNCE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1500),
            block_cache_max_entries: std::env::var("SYNC_BLOCK_CACHE_ENTRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
            server_fingerprint_override: std::env::var("SYNC_SERVER_FINGERPRINT").ok(),
        }
    }
}
