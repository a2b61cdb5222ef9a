//! Configuration snapshot and the stores that hand it out.
//!
//! A snapshot is taken once per interception cycle and never changes while a
//! check is in flight.

use crate::error::ConfigError;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8000";
pub const DEFAULT_REGRET_THRESHOLD: u8 = 70;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_DEBOUNCE_DELAY_MS: u64 = 300;

const CONFIG_DIR_NAME: &str = "regret-guard";
const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub classifier_endpoint: String,
    pub regret_threshold: u8,
    pub request_timeout_ms: u64,
    pub debounce_delay_ms: u64,
    pub enabled: bool,
    /// Context label sent as `context.app`.
    pub app: String,
    /// Context label sent as `context.reason_hint`.
    pub reason_hint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            classifier_endpoint: DEFAULT_ENDPOINT.to_string(),
            regret_threshold: DEFAULT_REGRET_THRESHOLD,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            debounce_delay_ms: DEFAULT_DEBOUNCE_DELAY_MS,
            enabled: true,
            app: "messaging".to_string(),
            reason_hint: "messaging".to_string(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    /// `<endpoint>/<path>`, tolerating a trailing slash on the endpoint.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.classifier_endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        reqwest::Url::parse(&self.classifier_endpoint).map_err(|e| {
            ConfigError::InvalidEndpoint {
                endpoint: self.classifier_endpoint.clone(),
                details: e.to_string(),
            }
        })?;
        if self.regret_threshold > 100 {
            return Err(ConfigError::InvalidThreshold(self.regret_threshold));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(())
    }
}

/// Source of configuration snapshots, read once per interception cycle.
pub trait ConfigStore: Send + Sync {
    fn get_config(&self) -> BoxFuture<'_, Config>;
}

/// Holds a snapshot in memory. `replace` takes effect on the next cycle.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigStore {
    config: Arc<RwLock<Config>>,
}

impl StaticConfigStore {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn replace(&self, config: Config) {
        let mut guard = self
            .config
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = config;
    }
}

impl ConfigStore for StaticConfigStore {
    fn get_config(&self) -> BoxFuture<'_, Config> {
        let snapshot = self
            .config
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        Box::pin(future::ready(snapshot))
    }
}

/// Reads YAML from disk on every cycle so edits apply without a restart.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
    endpoint: Option<String>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            endpoint: None,
        }
    }

    /// `<config_dir>/regret-guard/config.yaml`
    pub fn default_location() -> Result<Self, ConfigError> {
        let dir = dirs_next::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(Self::new(dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME)))
    }

    /// Endpoint that wins over whatever the file says.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        let config = self.overridden(self.read()?);
        config.validate()?;
        Ok(config)
    }

    fn read(&self) -> Result<Config, ConfigError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No config file, using defaults");
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if content.trim().is_empty() {
            return Ok(Config::default());
        }

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            details: e.to_string(),
        })
    }

    fn overridden(&self, mut config: Config) -> Config {
        if let Some(endpoint) = &self.endpoint {
            config.classifier_endpoint = endpoint.clone();
        }
        config
    }
}

impl ConfigStore for FileConfigStore {
    fn get_config(&self) -> BoxFuture<'_, Config> {
        let config = self.load().unwrap_or_else(|err| {
            warn!(path = %self.path.display(), error = %err, "Falling back to default config");
            self.overridden(Config::default())
        });
        Box::pin(future::ready(config))
    }
}

/// Store used by the binary.
///
/// An explicit `path` must load cleanly now; after that, and for the default
/// location, a broken file only degrades a cycle to defaults. Without a
/// config directory the defaults are served from memory.
pub fn open_store(
    path: Option<&Path>,
    endpoint: Option<String>,
) -> Result<Arc<dyn ConfigStore>, ConfigError> {
    if let Some(endpoint) = &endpoint {
        Config {
            classifier_endpoint: endpoint.clone(),
            ..Config::default()
        }
        .validate()?;
    }

    let store = match path {
        Some(path) => FileConfigStore::new(path),
        None => match FileConfigStore::default_location() {
            Ok(store) => store,
            Err(err) => {
                debug!(error = %err, "Using built-in defaults");
                let mut config = Config::default();
                if let Some(endpoint) = endpoint {
                    config.classifier_endpoint = endpoint;
                }
                return Ok(Arc::new(StaticConfigStore::new(config)));
            }
        },
    };
    let store = match endpoint {
        Some(endpoint) => store.with_endpoint(endpoint),
        None => store,
    };
    if path.is_some() {
        store.load()?;
    }
    Ok(Arc::new(store))
}

/// Expand ~ to home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
