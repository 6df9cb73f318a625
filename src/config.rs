//! Runtime configuration from environment variables.
//!
//! - `SITEPLAN_DB` - SQLite file (default: platform data dir)
//! - `SITEPLAN_ASSETS` - base URL or directory of JSON documents (default: `./assets`)
//! - `SITEPLAN_APP_MODE` - `dev` or `prod` (default: `prod`)
//! - `SITEPLAN_AUTOSAVE_MS` - autosave debounce in milliseconds (default: 250)
//! - `SITEPLAN_NAMESPACE` - storage key prefix (default: `siteplan`)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::gate::AppMode;
use crate::persistence::{PersistenceConfig, DEFAULT_AUTOSAVE_DELAY};
use crate::source::{DirSource, DocumentSource, HttpSource};
use crate::storage::{self, SqliteStorage};

const DEFAULT_ASSETS: &str = "./assets";

/// Where JSON documents are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    Url(String),
    Dir(PathBuf),
}

impl AssetLocation {
    pub fn parse(s: &str) -> Self {
        if s.starts_with("http://") || s.starts_with("https://") {
            Self::Url(s.to_string())
        } else {
            Self::Dir(PathBuf::from(s))
        }
    }
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub db_path: Option<PathBuf>,
    pub assets: AssetLocation,
    pub app_mode: AppMode,
    pub autosave_delay: Duration,
    pub namespace: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            assets: AssetLocation::Dir(PathBuf::from(DEFAULT_ASSETS)),
            app_mode: AppMode::Production,
            autosave_delay: DEFAULT_AUTOSAVE_DELAY,
            namespace: PersistenceConfig::default().namespace,
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Unparseable values fall back
    /// to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let autosave_delay = lookup("SITEPLAN_AUTOSAVE_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.autosave_delay);

        Self {
            db_path: lookup("SITEPLAN_DB").map(PathBuf::from),
            assets: lookup("SITEPLAN_ASSETS")
                .map(|s| AssetLocation::parse(&s))
                .unwrap_or(defaults.assets),
            app_mode: lookup("SITEPLAN_APP_MODE")
                .map(|s| AppMode::parse(&s))
                .unwrap_or(defaults.app_mode),
            autosave_delay,
            namespace: lookup("SITEPLAN_NAMESPACE")
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.namespace),
        }
    }

    pub fn document_source(&self) -> Arc<dyn DocumentSource> {
        match &self.assets {
            AssetLocation::Url(base) => Arc::new(HttpSource::with_base(base.clone())),
            AssetLocation::Dir(dir) => Arc::new(DirSource::new(dir.clone())),
        }
    }

    pub fn persistence_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            namespace: self.namespace.clone(),
            autosave_delay: self.autosave_delay,
            ..PersistenceConfig::default()
        }
    }

    /// Open and migrate the configured SQLite storage.
    pub fn open_storage(&self) -> anyhow::Result<SqliteStorage> {
        let path = match &self.db_path {
            Some(path) => path.clone(),
            None => storage::default_path()?,
        };
        tracing::debug!(path = %path.display(), "opening storage");
        let storage = SqliteStorage::open(path)?;
        storage.migrate()?;
        Ok(storage)
    }
}
