//! YAML configuration for the frontend and agent daemons.
//!
//! Site configuration is a set of YAML files fetched from git by a sibling
//! process and mounted at well-known paths. Files are parsed into typed
//! structs with defaults merged in; [`ConfigCache`] keeps the parsed value
//! for the lifetime of a daemon and re-reads it on request.

mod agent;
mod frontend;

pub use agent::{
    AgentConfig, AgentGeneral, AgentInterfaceConfig, AgentSection, QosConfig, QosInterface,
    QosPolicy,
};
pub use frontend::{
    AnsibleConfig, AuthConfig, BackendKind, FrontendConfig, GeneralConfig, RestConfig,
    ServicesConfig, SiteConfig, SwitchConfig, SwitchPortConfig,
};

use crate::error::{SrmError, SrmResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Common loading behaviour of the YAML config files.
pub trait ConfigFile: DeserializeOwned + Serialize + Default + PartialEq + Send + Sync {
    /// Default location of the file.
    const DEFAULT_PATH: &'static str;

    /// Checks cross-field constraints after parsing.
    fn validate(&self) -> SrmResult<()>;

    /// Parses YAML text and validates it.
    fn from_yaml_str(content: &str) -> SrmResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| SrmError::invalid_config("yaml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from file; a missing file is an error.
    fn load(path: impl AsRef<Path>) -> SrmResult<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).map_err(|e| SrmError::io(path.display().to_string(), e))?;
        Self::from_yaml_str(&content).map_err(|e| match e {
            SrmError::InvalidConfig { field, message } => SrmError::InvalidConfig {
                field: format!("{}:{}", path.display(), field),
                message,
            },
            other => other,
        })
    }

    /// Loads configuration from file, falling back to defaults if the file is missing.
    fn load_or_default(path: impl AsRef<Path>) -> SrmResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Writes the configuration as YAML.
    fn save(&self, path: impl AsRef<Path>) -> SrmResult<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).map_err(|e| SrmError::io(path.display().to_string(), e))
    }
}

/// Process-wide cache of a parsed config file with explicit reload.
#[derive(Debug)]
pub struct ConfigCache<T: ConfigFile> {
    path: PathBuf,
    current: RwLock<Arc<T>>,
    loaded_at: RwLock<Instant>,
}

impl<T: ConfigFile> ConfigCache<T> {
    /// Loads the file at `path` and caches it.
    pub fn open(path: impl Into<PathBuf>) -> SrmResult<Self> {
        let path = path.into();
        let config = T::load(&path)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
            loaded_at: RwLock::new(Instant::now()),
        })
    }

    /// Wraps an already parsed value; `reload` reads from `path`.
    pub fn from_value(path: impl Into<PathBuf>, config: T) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(config)),
            loaded_at: RwLock::new(Instant::now()),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<T> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Time since the cached value was (re)loaded.
    pub fn age(&self) -> std::time::Duration {
        match self.loaded_at.read() {
            Ok(guard) => guard.elapsed(),
            Err(poisoned) => poisoned.into_inner().elapsed(),
        }
    }

    /// Re-reads the file. Returns true if the content changed.
    ///
    /// On error the previous value stays in place.
    pub fn reload(&self) -> SrmResult<bool> {
        let fresh = T::load(&self.path)?;
        let changed = *self.get() != fresh;
        if let Ok(mut guard) = self.current.write() {
            *guard = Arc::new(fresh);
        }
        if let Ok(mut guard) = self.loaded_at.write() {
            *guard = Instant::now();
        }
        if changed {
            tracing::info!(path = %self.path.display(), "Configuration changed on reload");
        }
        Ok(changed)
    }
}
