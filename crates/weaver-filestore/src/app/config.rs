//! Node configuration.
//!
//! ```toml
//! workdir = "/var/lib/weaver"
//! caching = true
//! max_concurrent_writes = 8
//! cache_max_bytes = 1073741824
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::domain::ConfigError;

pub const ENV_WORKDIR: &str = "WEAVER_WORKDIR";
pub const ENV_CACHING: &str = "WEAVER_CACHING";
pub const ENV_MAX_CONCURRENT_WRITES: &str = "WEAVER_MAX_CONCURRENT_WRITES";

const DEFAULT_MAX_CONCURRENT_WRITES: usize = 8;
const DEFAULT_CACHE_MAX_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileStoreConfig {
    /// Node-local directory holding task directories and the cache.
    pub workdir: PathBuf,

    /// Use the shared node cache for global file reads.
    #[serde(default)]
    pub caching: bool,

    /// Upper bound on uploads running at once on this node.
    #[serde(default = "default_max_concurrent_writes")]
    pub max_concurrent_writes: usize,

    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: u64,
}

fn default_max_concurrent_writes() -> usize {
    DEFAULT_MAX_CONCURRENT_WRITES
}

fn default_cache_max_bytes() -> u64 {
    DEFAULT_CACHE_MAX_BYTES
}

impl FileStoreConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            caching: false,
            max_concurrent_writes: DEFAULT_MAX_CONCURRENT_WRITES,
            cache_max_bytes: DEFAULT_CACHE_MAX_BYTES,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `WEAVER_*` environment variables on top of the file values.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(workdir) = lookup(ENV_WORKDIR) {
            self.workdir = PathBuf::from(workdir);
        }
        if let Some(raw) = lookup(ENV_CACHING) {
            self.caching = parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                field: "caching",
                reason: format!("'{raw}' is not a boolean"),
            })?;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT_WRITES) {
            self.max_concurrent_writes = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "max_concurrent_writes",
                reason: format!("'{raw}' is not a number"),
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_writes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_writes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrent_writes > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_writes",
                reason: format!("must be at most {}", Semaphore::MAX_PERMITS),
            });
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "workdir",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
