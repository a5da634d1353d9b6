//! Database configuration

use serde::{Deserialize, Serialize};

/// Multi-node database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL of the master (read-write) node
    pub master_url: String,
    /// PostgreSQL URLs of read-only replicas; reads fall back to the master when empty
    #[serde(default)]
    pub replica_urls: Vec<String>,
    /// Maximum connections per node
    pub max_connections: u32,
    /// Minimum connections per node
    pub min_connections: u32,
    /// Connection acquire timeout in seconds
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            master_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/tollgate".to_string()),
            replica_urls: Vec::new(),
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    /// Mask sensitive parts of the master URL for logging
    pub fn master_url_masked(&self) -> String {
        mask_url(&self.master_url)
    }
}

/// Replace the password of a connection URL with `***`.
pub fn mask_url(url: &str) -> String {
    if let (Some(at_pos), Some(scheme_end)) = (url.rfind('@'), url.find("://")) {
        if at_pos > scheme_end {
            let scheme = &url[..scheme_end + 3];
            let after_at = &url[at_pos..];
            let user_pass = &url[scheme_end + 3..at_pos];
            if let Some(colon_pos) = user_pass.find(':') {
                let user = &user_pass[..colon_pos];
                return format!("{}{}:***{}", scheme, user, after_at);
            }
        }
    }
    url.to_string()
}
