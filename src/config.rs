use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

const DEFAULT_SEGMENT_SIZE: u64 = 768 * 1024; // 786432
const DEFAULT_PACK_THRESHOLD: u64 = 50 * 1024; // 51200

/// Top-level application configuration loaded from file + environment.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreSection,
    pub segment: SegmentSection,
    pub wire: WireSection,
    pub workers: WorkersSection,
    pub kdf: KdfSection,
    pub posting: PostingSection,
    pub index: IndexSection,
    pub logging: LoggingSection,
}

impl AppConfig {
    /// Load configuration from disk and environment.
    pub fn load() -> Result<Self> {
        let config_path =
            env::var("USENETSYNC_CONFIG").unwrap_or_else(|_| "config.toml".to_string());

        let mut builder = config::Config::builder();

        if Path::new(&config_path).exists() {
            builder = builder.add_source(config::File::from(PathBuf::from(&config_path)));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("USENETSYNC")
                .separator("_")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| Error::config(e.to_string()))?;
        let mut cfg: Self = settings
            .try_deserialize()
            .map_err(|e| Error::config(e.to_string()))?;

        if cfg.logging.level.trim().is_empty() {
            cfg.logging.level = "info".to_string();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject inconsistent settings before any component sees them.
    pub fn validate(&self) -> Result<()> {
        if self.segment.size_bytes == 0 {
            return Err(Error::config("segment.size_bytes must be non-zero"));
        }
        if self.segment.pack_threshold_bytes > self.segment.size_bytes {
            return Err(Error::config(
                "segment.pack_threshold_bytes must not exceed segment.size_bytes",
            ));
        }
        if self.segment.redundancy == 0 {
            return Err(Error::config("segment.redundancy must be at least 1"));
        }
        if self.wire.host.trim().is_empty() {
            return Err(Error::config("wire.host must be specified"));
        }
        if self.posting.groups.is_empty() {
            return Err(Error::config("posting.groups must list at least one group"));
        }
        if self.wire.pool.max_active == 0 {
            return Err(Error::config("wire.pool.max_active must be at least 1"));
        }
        if self.wire.pool.min_idle > self.wire.pool.max_active {
            return Err(Error::config(
                "wire.pool.min_idle must not exceed wire.pool.max_active",
            ));
        }
        if let StoreBackendKind::Server = self.store.backend {
            if self.store.server.is_none() {
                return Err(Error::config(
                    "store.server configuration required when backend is 'server'",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackendKind,
    pub path: String,
    pub server: Option<ServerStoreSection>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Embedded,
            path: "./usenetsync.db".to_string(),
            server: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    #[default]
    Embedded,
    Server,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerStoreSection {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SegmentSection {
    pub size_bytes: u64,
    pub pack_threshold_bytes: u64,
    /// Number of unique copies per logical segment; 1 means primary only.
    pub redundancy: u32,
}

impl Default for SegmentSection {
    fn default() -> Self {
        Self {
            size_bytes: DEFAULT_SEGMENT_SIZE,
            pack_threshold_bytes: DEFAULT_PACK_THRESHOLD,
            redundancy: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WireSection {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool: PoolSection,
    pub retry: RetrySection,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Substrate per-article body cap; segments larger than this are split
    /// into stitched multi-part postings.
    pub article_size_limit: u64,
}

impl Default for WireSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 563,
            tls: true,
            username: None,
            password: None,
            pool: PoolSection::default(),
            retry: RetrySection::default(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            article_size_limit: 3 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub min_idle: usize,
    pub max_active: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_active: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub attempts: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_ms: 500,
            cap_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub upload: usize,
    pub download: usize,
    /// Enqueue stalls once this many rows of one session sit undrained.
    pub queue_high_water: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        let default_pool = std::thread::available_parallelism()
            .map(|n| n.get().min(8))
            .unwrap_or(4);
        Self {
            upload: default_pool,
            download: default_pool,
            queue_high_water: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct KdfSection {
    /// Auto-tune target for password derivation on this host.
    pub target_ms: u64,
}

impl Default for KdfSection {
    fn default() -> Self {
        Self { target_ms: 250 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostingSection {
    /// Ordered list; groups rotate round-robin across segments.
    pub groups: Vec<String>,
}

impl Default for PostingSection {
    fn default() -> Self {
        Self {
            groups: vec!["alt.binaries.misc".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    /// Files processed per transaction batch.
    pub batch_size: usize,
    /// Glob-lite patterns: `*` wildcard within a path component, plain
    /// substrings and path prefixes otherwise.
    pub exclude: Vec<String>,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.wire.host = "news.example.net".to_string();
        cfg
    }

    #[test]
    fn test_defaults_match_contract() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.segment.size_bytes, 786432);
        assert_eq!(cfg.segment.pack_threshold_bytes, 51200);
        assert_eq!(cfg.segment.redundancy, 1);
        assert_eq!(cfg.wire.retry.attempts, 5);
        assert_eq!(cfg.wire.retry.base_ms, 500);
        assert_eq!(cfg.kdf.target_ms, 250);
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());

        let mut cfg = valid();
        cfg.segment.redundancy = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.segment.pack_threshold_bytes = cfg.segment.size_bytes + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.wire.host.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.posting.groups.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.store.backend = StoreBackendKind::Server;
        assert!(cfg.validate().is_err());
    }
}
