//! Configuration management for the caching proxy
//!
//! Configuration lives in a YAML file. [`SharedConfig`] holds the current
//! snapshot and re-reads the file when its modification time changes, so a
//! running proxy picks up edits on the next request cycle.

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Configuration for the proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Loopback port to listen on (default: 8080, 0 picks an ephemeral port)
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Secondary proxy host; unset means direct connections
    #[serde(default)]
    pub proxy_host: Option<String>,

    /// Secondary proxy port (default: 8081)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Also send CONNECT tunnels through the secondary proxy
    #[serde(default)]
    pub proxy_ssl: bool,

    /// Resolve video titles to build readable cache file names (default: true)
    #[serde(default = "default_true")]
    pub title: bool,

    /// Update the modification time of cache files when they are served
    #[serde(default = "default_true")]
    pub touch_cache: bool,

    /// Keep partial downloads and resume them with a Range request
    #[serde(default)]
    pub resume_download: bool,

    /// Browser read timeout in milliseconds (default: 600000, 0 = unlimited)
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Charset that cache file names are narrowed to, e.g. "Shift_JIS"
    #[serde(default)]
    pub file_name_charset: Option<String>,

    /// Cache root directory (default: "cache")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Number of id entries the metadata cache keeps (default: 10000)
    #[serde(default = "default_metadata_capacity")]
    pub metadata_capacity: usize,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,
}

// Default value functions for serde
fn default_listen_port() -> u16 {
    8080
}

fn default_proxy_port() -> u16 {
    8081
}

fn default_true() -> bool {
    true
}

fn default_read_timeout() -> u64 {
    600_000 // 10 minutes
}

fn default_cache_dir() -> String {
    "cache".to_string()
}

fn default_metadata_capacity() -> usize {
    10_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_port: default_listen_port(),
            proxy_host: None,
            proxy_port: default_proxy_port(),
            proxy_ssl: false,
            title: default_true(),
            touch_cache: default_true(),
            resume_download: false,
            read_timeout_ms: default_read_timeout(),
            file_name_charset: None,
            cache_dir: default_cache_dir(),
            metadata_capacity: default_metadata_capacity(),
            debug: false,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: ProxyConfig = serde_yaml::from_str(&content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as YAML
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(path.as_ref(), content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to write config file: {}", e))
        })
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - cache_dir must not be empty
    /// - metadata_capacity must be > 0
    /// - file_name_charset must be a known encoding label
    /// - proxy_port must be > 0 when proxy_host is set
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.trim().is_empty() {
            return Err(ProxyError::ConfigError(
                "cache_dir must not be empty".to_string(),
            ));
        }

        if self.metadata_capacity == 0 {
            return Err(ProxyError::ConfigError(
                "metadata_capacity must be greater than 0".to_string(),
            ));
        }

        if let Some(label) = &self.file_name_charset {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(ProxyError::ConfigError(format!(
                    "unknown file_name_charset '{}'",
                    label
                )));
            }
        }

        if self.secondary_proxy().is_some() && self.proxy_port == 0 {
            return Err(ProxyError::ConfigError(
                "proxy_port must be greater than 0 when proxy_host is set".to_string(),
            ));
        }

        Ok(())
    }

    /// The secondary proxy as (host, port), if one is configured
    pub fn secondary_proxy(&self) -> Option<(&str, u16)> {
        match self.proxy_host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => Some((host, self.proxy_port)),
            _ => None,
        }
    }

    /// Read timeout for browser sockets; `None` means unlimited
    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Update configuration from another config
    ///
    /// # Arguments
    /// * `new_config` - The new configuration to apply
    ///
    /// # Returns
    /// * `Ok(ConfigChanges)` - Description of what changed
    /// * `Err(ProxyError)` - If the new configuration is invalid
    pub fn update_from(&mut self, new_config: &ProxyConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let mut changes = ConfigChanges::default();

        if self.listen_port != new_config.listen_port {
            changes.listen_port_changed = true;
        }

        if self.proxy_host != new_config.proxy_host
            || self.proxy_port != new_config.proxy_port
            || self.proxy_ssl != new_config.proxy_ssl
        {
            changes.proxy_changed = true;
        }

        if self.title != new_config.title {
            changes.title_changed = true;
        }

        if self.touch_cache != new_config.touch_cache {
            changes.touch_cache_changed = true;
        }

        if self.resume_download != new_config.resume_download {
            changes.resume_changed = true;
        }

        if self.read_timeout_ms != new_config.read_timeout_ms {
            changes.read_timeout_changed = true;
        }

        if self.file_name_charset != new_config.file_name_charset {
            changes.file_name_charset_changed = true;
        }

        if self.cache_dir != new_config.cache_dir {
            changes.cache_dir_changed = true;
        }

        if self.metadata_capacity != new_config.metadata_capacity {
            changes.metadata_capacity_changed = true;
        }

        if self.debug != new_config.debug {
            changes.debug_changed = true;
        }

        *self = new_config.clone();
        Ok(changes)
    }
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone)]
pub struct ConfigChanges {
    pub listen_port_changed: bool,
    pub proxy_changed: bool,
    pub title_changed: bool,
    pub touch_cache_changed: bool,
    pub resume_changed: bool,
    pub read_timeout_changed: bool,
    pub file_name_charset_changed: bool,
    pub cache_dir_changed: bool,
    pub metadata_capacity_changed: bool,
    pub debug_changed: bool,
}

impl ConfigChanges {
    /// Check if any changes were made
    pub fn has_changes(&self) -> bool {
        !self.summary().is_empty()
    }

    /// Settings that only take effect after a restart
    pub fn requires_restart(&self) -> bool {
        self.listen_port_changed
            || self.cache_dir_changed
            || self.file_name_charset_changed
            || self.metadata_capacity_changed
            || self.debug_changed
    }

    /// Get a summary of changes
    pub fn summary(&self) -> Vec<String> {
        let fields = [
            (self.listen_port_changed, "listen_port"),
            (self.proxy_changed, "proxy"),
            (self.title_changed, "title"),
            (self.touch_cache_changed, "touch_cache"),
            (self.resume_changed, "resume_download"),
            (self.read_timeout_changed, "read_timeout_ms"),
            (self.file_name_charset_changed, "file_name_charset"),
            (self.cache_dir_changed, "cache_dir"),
            (self.metadata_capacity_changed, "metadata_capacity"),
            (self.debug_changed, "debug"),
        ];
        fields
            .iter()
            .filter(|(changed, _)| *changed)
            .map(|(_, name)| name.to_string())
            .collect()
    }
}

struct LoadedConfig {
    config: Arc<ProxyConfig>,
    modified: Option<SystemTime>,
}

/// Hot-reloadable configuration shared by every connection
///
/// Cloning is cheap; all clones observe the same reloads.
#[derive(Clone)]
pub struct SharedConfig {
    path: Option<PathBuf>,
    state: Arc<RwLock<LoadedConfig>>,
}

impl SharedConfig {
    /// Wrap a fixed configuration that is never reloaded
    pub fn fixed(config: ProxyConfig) -> Self {
        SharedConfig {
            path: None,
            state: Arc::new(RwLock::new(LoadedConfig {
                config: Arc::new(config),
                modified: None,
            })),
        }
    }

    /// Load the configuration file, writing a default one if it is missing
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            info!("Config file {} not found, writing defaults", path.display());
            ProxyConfig::default().store(&path)?;
        }

        let config = ProxyConfig::from_file(&path)?;
        let modified = modified_time(&path);
        Ok(SharedConfig {
            path: Some(path),
            state: Arc::new(RwLock::new(LoadedConfig {
                config: Arc::new(config),
                modified,
            })),
        })
    }

    /// The current configuration snapshot
    pub fn current(&self) -> Arc<ProxyConfig> {
        match self.state.read() {
            Ok(state) => state.config.clone(),
            Err(poisoned) => poisoned.into_inner().config.clone(),
        }
    }

    /// Re-read the file if it changed since the last load
    ///
    /// # Returns
    /// `true` when a new configuration was applied
    pub fn reload(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };

        let modified = modified_time(path);
        {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if modified.is_none() || modified == state.modified {
                return false;
            }
        }

        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        // another connection may have reloaded while we waited for the lock
        if modified == state.modified {
            return false;
        }
        state.modified = modified;

        let new_config = match ProxyConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Keeping previous configuration: {}", e);
                return false;
            }
        };

        let mut updated = (*state.config).clone();
        match updated.update_from(&new_config) {
            Ok(changes) if changes.has_changes() => {
                info!("Configuration reloaded: {}", changes.summary().join(", "));
                if changes.requires_restart() {
                    warn!("Some changed settings take effect after restart");
                }
                state.config = Arc::new(updated);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Keeping previous configuration: {}", e);
                false
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
