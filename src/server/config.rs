//! Ingestion server configuration.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database_path: PathBuf,
    /// Limit on the request body as received (possibly compressed).
    pub max_body_bytes: usize,
    /// Limit on a zstd request body after decompression.
    pub max_decompressed_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            database_path: PathBuf::from("pos-sync-server.db"),
            max_body_bytes: 8 * 1024 * 1024,
            max_decompressed_bytes: 32 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        // Never allow less room after decompression than before it.
        self.max_decompressed_bytes = self.max_decompressed_bytes.max(max);
        self
    }
}
