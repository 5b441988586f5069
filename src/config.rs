//! Configuration management
//!
//! YAML file merged with `ENVCTL_`-prefixed environment variables through
//! figment. Every section defaults sensibly so an empty config boots a
//! working control plane. The core treats configuration as read-only; the
//! `config_save`/`config_reload` tools go through [`ConfigStore`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::aggregator::AggregatorSettings;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address of the aggregator endpoint
    pub server: ServerConfig,
    /// Aggregator behavior
    pub aggregator: AggregatorConfig,
    /// Orchestrator behavior
    pub orchestrator: OrchestratorConfig,
    /// Directories scanned for ServiceClass YAML definitions
    pub class_dirs: Vec<String>,
    /// Declarative service instances created at boot
    pub services: Vec<ServiceSpec>,
}

/// Listen address configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

/// Aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Disable destructive-tool blocking
    pub yolo: bool,
    /// Per-dispatch timeout
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Upstream reconnect backoff
    pub reconnect: ReconnectConfig,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            yolo: false,
            call_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Reconnect backoff bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Delay cap
    #[serde(with = "humantime_serde")]
    pub cap: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl AggregatorConfig {
    /// Convert to runtime settings
    #[must_use]
    pub fn settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            call_timeout: self.call_timeout,
            reconnect_base: self.reconnect.base,
            reconnect_cap: self.reconnect.cap,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sibling concurrency within a topological level
    pub parallelism: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: crate::scheduler::DEFAULT_PARALLELISM,
        }
    }
}

/// A declarative service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// ServiceClass name
    pub class: String,
    /// Instance label; rendered from the class default when omitted
    #[serde(default)]
    pub label: Option<String>,
    /// Creation parameters
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Start the instance at boot
    #[serde(default)]
    pub auto_start: bool,
}

impl Config {
    /// Load from an optional YAML file merged with `ENVCTL_*` env vars
    ///
    /// # Errors
    ///
    /// `Config` when the file or environment cannot be deserialized.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("ENVCTL_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Runtime holder for the loaded configuration
///
/// The collaborator seam behind the `config_get`/`config_save`/
/// `config_reload` control tools.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Config>,
}

impl ConfigStore {
    /// Wrap a loaded configuration
    #[must_use]
    pub fn new(config: Config, path: Option<PathBuf>) -> Self {
        Self {
            path,
            current: RwLock::new(config),
        }
    }

    /// Snapshot of the current configuration
    #[must_use]
    pub fn get(&self) -> Config {
        self.current.read().clone()
    }

    /// Current configuration as JSON
    #[must_use]
    pub fn as_json(&self) -> Value {
        serde_json::to_value(self.get()).unwrap_or(Value::Null)
    }

    /// Write the current configuration back to its YAML file
    ///
    /// # Errors
    ///
    /// `Config` when no file path is associated or the write fails.
    pub fn save(&self) -> Result<PathBuf> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| Error::Config("no config file to save to".to_string()))?;
        let yaml = serde_yaml::to_string(&self.get())
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&path, yaml)?;
        Ok(path)
    }

    /// Re-read the configuration from disk
    ///
    /// # Errors
    ///
    /// `Config` when no file path is associated or the reload fails.
    pub fn reload(&self) -> Result<Config> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| Error::Config("no config file to reload from".to_string()))?;
        let fresh = Config::load(Some(&path))?;
        *self.current.write() = fresh.clone();
        Ok(fresh)
    }
}
