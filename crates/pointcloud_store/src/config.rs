use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use pointcloud_core::{PointCloudError, PointCloudResult};

const DEFAULT_CONFIG_NAME: &str = "pointcloud.json";

pub const DEFAULT_CACHE_CAPACITY: usize = 5_000;
pub const DEFAULT_INDEX_AFTER_HITS: u64 = 3;
pub const DEFAULT_OPTIMIZE_EVERY: u64 = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Memory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: Option<usize>,
    pub index_after_hits: Option<u64>,
    pub optimize_every: Option<u64>,
}

impl CacheConfig {
    pub fn with_defaults() -> Self {
        Self {
            capacity: Some(DEFAULT_CACHE_CAPACITY),
            index_after_hits: Some(DEFAULT_INDEX_AFTER_HITS),
            optimize_every: Some(DEFAULT_OPTIMIZE_EVERY),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    pub parallel_remap: Option<bool>,
    pub warn_non_finite: Option<bool>,
}

impl IngestConfig {
    pub fn with_defaults() -> Self {
        Self {
            parallel_remap: Some(true),
            warn_non_finite: Some(true),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database: DatabaseConfig,
    pub cache: Option<CacheConfig>,
    pub ingest: Option<IngestConfig>,
    pub diagnostics: Option<DiagnosticsConfig>,
}

/// Config with every optional knob resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreSettings {
    pub cache_capacity: usize,
    pub index_after_hits: u64,
    pub optimize_every: u64,
    pub parallel_remap: bool,
    pub warn_non_finite: bool,
    pub record_statements: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            index_after_hits: DEFAULT_INDEX_AFTER_HITS,
            optimize_every: DEFAULT_OPTIMIZE_EVERY,
            parallel_remap: true,
            warn_non_finite: true,
            record_statements: false,
        }
    }
}

impl StoreConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            cache: Some(CacheConfig::with_defaults()),
            ingest: Some(IngestConfig::with_defaults()),
            diagnostics: Some(DiagnosticsConfig {
                enabled: Some(false),
            }),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            database: DatabaseConfig::Memory,
            ..Self::default_sqlite("")
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> PointCloudResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| PointCloudError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| PointCloudError::storage(format!("read config: {err}")))?;
            let config: StoreConfig = serde_json::from_str(&raw)
                .map_err(|err| PointCloudError::invalid(err.to_string()))?;
            return Ok(config);
        }
        let default = StoreConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| PointCloudError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| PointCloudError::storage(format!("write config: {err}")))?;
        Ok(default)
    }

    /// Resolves the on-disk location, or `None` for an in-memory store.
    pub fn sqlite_path(&self, base_dir: &Path) -> Option<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path
                    .clone()
                    .filter(|path| !path.is_empty())
                    .unwrap_or_else(|| "pointcloud.sqlite".to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Some(candidate)
                } else {
                    Some(base_dir.join(candidate))
                }
            }
            DatabaseConfig::Memory => None,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Memory => "memory",
        }
    }

    pub fn settings(&self) -> PointCloudResult<StoreSettings> {
        let defaults = StoreSettings::default();
        let cache = self.cache.as_ref();
        let cache_capacity = cache
            .and_then(|cfg| cfg.capacity)
            .unwrap_or(defaults.cache_capacity);
        if cache_capacity == 0 {
            return Err(PointCloudError::invalid("cache capacity must be positive"));
        }
        let ingest = self.ingest.as_ref();
        Ok(StoreSettings {
            cache_capacity,
            index_after_hits: cache
                .and_then(|cfg| cfg.index_after_hits)
                .unwrap_or(defaults.index_after_hits),
            optimize_every: cache
                .and_then(|cfg| cfg.optimize_every)
                .unwrap_or(defaults.optimize_every),
            parallel_remap: ingest
                .and_then(|cfg| cfg.parallel_remap)
                .unwrap_or(defaults.parallel_remap),
            warn_non_finite: ingest
                .and_then(|cfg| cfg.warn_non_finite)
                .unwrap_or(defaults.warn_non_finite),
            record_statements: self
                .diagnostics
                .as_ref()
                .and_then(|cfg| cfg.enabled)
                .unwrap_or(defaults.record_statements),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_or_init_writes_default_then_reads_it_back() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path();
        let db = base.join("points.sqlite");
        let first = StoreConfig::load_or_init(base, &db).expect("init");
        assert!(base.join(DEFAULT_CONFIG_NAME).exists());
        assert_eq!(first.backend_name(), "sqlite");

        let second = StoreConfig::load_or_init(base, &db).expect("reload");
        assert_eq!(second.sqlite_path(base), Some(db));
    }

    #[test]
    fn settings_fill_missing_values_with_defaults() {
        let config = StoreConfig {
            database: DatabaseConfig::Memory,
            cache: Some(CacheConfig {
                capacity: Some(16),
                index_after_hits: None,
                optimize_every: None,
            }),
            ingest: None,
            diagnostics: None,
        };
        let settings = config.settings().expect("settings");
        assert_eq!(settings.cache_capacity, 16);
        assert_eq!(settings.index_after_hits, DEFAULT_INDEX_AFTER_HITS);
        assert!(settings.parallel_remap);
        assert!(config.sqlite_path(Path::new("/tmp")).is_none());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = StoreConfig::in_memory();
        config.cache = Some(CacheConfig {
            capacity: Some(0),
            index_after_hits: None,
            optimize_every: None,
        });
        assert!(matches!(
            config.settings(),
            Err(PointCloudError::Validation { .. })
        ));
    }

    #[test]
    fn memory_backend_roundtrips_through_json() {
        let raw = serde_json::to_string(&StoreConfig::in_memory()).expect("serialize");
        assert!(raw.contains("\"backend\":\"memory\""));
        let decoded: StoreConfig = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(decoded.backend_name(), "memory");
    }
}
