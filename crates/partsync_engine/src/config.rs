//! Engine configuration: store endpoints plus pool bounds.

use partsync_protocol::defaults;
use std::path::PathBuf;

/// Concurrency bounds for one run. Every bound has an environment override
/// named after the knob.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub ftp_parallel: usize,
    pub ftp_retries: u32,
    pub ftp_timeout_secs: u64,
    pub transform_parallel: usize,
    pub mongo_concurrent: usize,
    pub mongo_workers: usize,
    pub es_bulk_concurrent: usize,
    pub es_chunk_pairs: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            ftp_parallel: defaults::FTP_PARALLEL,
            ftp_retries: defaults::FTP_RETRIES,
            ftp_timeout_secs: defaults::FTP_TIMEOUT_SECS,
            transform_parallel: defaults::TRANSFORM_PARALLEL,
            mongo_concurrent: defaults::MONGO_CONCURRENT,
            mongo_workers: defaults::MONGO_WORKERS,
            es_bulk_concurrent: defaults::ES_BULK_CONCURRENT,
            es_chunk_pairs: defaults::ES_CHUNK_PAIRS,
        }
    }
}

impl PoolLimits {
    /// Transform workers actually used: the configured bound capped by the
    /// host's core count.
    pub fn effective_transform_parallel(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.transform_parallel.min(cores).max(1)
    }

    fn env_usize(name: &str, default: usize) -> usize {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn env_u64(name: &str, default: u64) -> u64 {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            ftp_parallel: Self::env_usize("FTP_PARALLEL", base.ftp_parallel),
            ftp_retries: Self::env_u64("FTP_RETRIES", base.ftp_retries as u64) as u32,
            ftp_timeout_secs: Self::env_u64("FTP_TIMEOUT", base.ftp_timeout_secs),
            transform_parallel: Self::env_usize("TRANSFORM_PARALLEL", base.transform_parallel),
            mongo_concurrent: Self::env_usize("MONGO_CONCURRENT", base.mongo_concurrent),
            mongo_workers: Self::env_usize("MONGO_WORKERS", base.mongo_workers),
            es_bulk_concurrent: Self::env_usize("ES_BULK_CONCURRENT", base.es_bulk_concurrent),
            es_chunk_pairs: Self::env_usize("ES_CHUNK_LINES", base.es_chunk_pairs),
        }
    }
}

/// Everything a pipeline run needs to know about the outside world.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Primary store connection string.
    pub mongo_uri: String,
    /// Database name; when None, taken from the URI path or "partsync".
    pub mongo_db: Option<String>,
    /// Path to the external bulk loader. When None, the in-process
    /// fallback loader is used.
    pub mongoimport_bin: Option<PathBuf>,
    /// Search store base URL.
    pub search_node: String,
    /// Alias served to readers; each run writes a fresh index behind it.
    pub search_alias: String,
    pub search_username: Option<String>,
    pub search_password: Option<String>,
    /// Root under which each run creates its scratch directory.
    pub scratch_root: PathBuf,
    pub limits: PoolLimits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mongo_uri: "mongodb://127.0.0.1:27017".to_string(),
            mongo_db: None,
            mongoimport_bin: None,
            search_node: "http://127.0.0.1:9200".to_string(),
            search_alias: defaults::DEFAULT_SEARCH_ALIAS.to_string(),
            search_username: None,
            search_password: None,
            scratch_root: std::env::temp_dir().join("partsync"),
            limits: PoolLimits::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            mongo_uri: std::env::var("MONGODB_URI").unwrap_or(base.mongo_uri),
            mongo_db: std::env::var("MONGODB_DB").ok(),
            mongoimport_bin: std::env::var("MONGOIMPORT_BIN").ok().map(PathBuf::from),
            search_node: std::env::var("ELASTICSEARCH_NODE").unwrap_or(base.search_node),
            search_alias: std::env::var("ELASTICSEARCH_INDEX").unwrap_or(base.search_alias),
            search_username: std::env::var("ELASTICSEARCH_USERNAME").ok(),
            search_password: std::env::var("ELASTICSEARCH_PASSWORD").ok(),
            scratch_root: std::env::var("PARTSYNC_SCRATCH")
                .map(PathBuf::from)
                .unwrap_or(base.scratch_root),
            limits: PoolLimits::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_parallel_is_bounded_by_cores() {
        let limits = PoolLimits {
            transform_parallel: 10_000,
            ..Default::default()
        };
        let effective = limits.effective_transform_parallel();
        assert!(effective >= 1);
        assert!(effective <= 10_000);

        let single = PoolLimits {
            transform_parallel: 1,
            ..Default::default()
        };
        assert_eq!(single.effective_transform_parallel(), 1);
    }
}
