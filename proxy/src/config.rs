use directory::config::DirectoryConfig;
use directory::settings::{DeploymentContext, InstanceSettings};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("{0} must be greater than 0")]
    ZeroDuration(&'static str),

    #[error("Proxy path prefix cannot be empty")]
    EmptyProxyPrefix,

    #[error("At least one permission plugin id is required")]
    NoPermissionPlugins,
}

/// Bridge process configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for plugin routes and proxied requests
    pub listener: Listener,
    /// Admin listener for health and readiness probes
    pub admin_listener: Listener,
    /// What the host hands to the plugin: instance settings and deployment context
    pub plugin: PluginConfig,
    /// Host platform calls and caches
    #[serde(default)]
    pub directory: DirectoryConfig,
    /// External service calls
    #[serde(default)]
    pub oncall: OnCallConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.directory.user_ttl_secs == 0 {
            return Err(ValidationError::ZeroDuration("directory.user_ttl_secs"));
        }
        if self.directory.plugin_settings_ttl_secs == 0 {
            return Err(ValidationError::ZeroDuration("directory.plugin_settings_ttl_secs"));
        }
        if self.directory.permission_plugin_ids.is_empty() {
            return Err(ValidationError::NoPermissionPlugins);
        }
        if self.oncall.health_timeout_ms == 0 {
            return Err(ValidationError::ZeroDuration("oncall.health_timeout_ms"));
        }
        if self.oncall.proxy_path_prefix.trim_matches('/').is_empty() {
            return Err(ValidationError::EmptyProxyPrefix);
        }
        if self.sync.interval_secs == Some(0) {
            return Err(ValidationError::ZeroDuration("sync.interval_secs"));
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PluginConfig {
    /// Plugin version reported by the host. Empty means unknown.
    #[serde(default)]
    pub version: String,
    /// Version used when the host reports none. Defaults to the crate version.
    #[serde(default)]
    pub build_version: Option<String>,
    /// Persisted instance settings
    #[serde(default)]
    pub json_data: serde_json::Value,
    /// Decrypted instance secrets
    #[serde(default)]
    pub secure_json_data: HashMap<String, String>,
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

impl PluginConfig {
    pub fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            json_data: self.json_data.clone(),
            decrypted_secure_json_data: self.secure_json_data.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub app_url: Option<String>,
    #[serde(default)]
    pub feature_toggles: Vec<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl From<&DeploymentConfig> for DeploymentContext {
    fn from(config: &DeploymentConfig) -> Self {
        DeploymentContext {
            app_url: config.app_url.clone(),
            feature_toggles: config.feature_toggles.iter().cloned().collect(),
            client_secret: config.client_secret.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct OnCallConfig {
    pub health_timeout_ms: u64,
    /// Timeout for install, status, sync and proxied calls
    pub api_timeout_secs: u64,
    /// Path under the external service base URL that proxied requests are mounted on
    pub proxy_path_prefix: String,
}

impl Default for OnCallConfig {
    fn default() -> Self {
        OnCallConfig {
            health_timeout_ms: 500,
            api_timeout_secs: 60,
            proxy_path_prefix: "api/internal/v1/".into(),
        }
    }
}

impl OnCallConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum time between two pushes
    pub cooldown_secs: u64,
    /// Compress pushed snapshots
    pub gzip: bool,
    /// Run a sync in the background at this interval. Disabled when unset.
    pub interval_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            cooldown_secs: 300,
            gzip: true,
            interval_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}
