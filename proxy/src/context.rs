//! Where per-request plugin context comes from.
//!
//! The host normally hands the plugin its instance settings, deployment
//! configuration and the calling user with every request. [`ContextSource`]
//! abstracts that so the bridge can be fed from static configuration.

use async_trait::async_trait;
use directory::settings::{DeploymentContext, InstanceSettings, PluginContext};
use directory::types::CallerIdentity;
use http::HeaderMap;
use parking_lot::RwLock;

use crate::config::PluginConfig;

/// Header carrying the login of the authenticated caller.
pub const USER_HEADER: &str = "x-grafana-user";

#[derive(thiserror::Error, Debug)]
pub enum ContextError {
    #[error("header {0} is not valid UTF-8")]
    InvalidHeader(&'static str),
}

#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Builds the plugin context for a request with the given headers.
    async fn plugin_context(&self, headers: &HeaderMap) -> Result<PluginContext, ContextError>;

    /// Called after install stored new instance settings on the host.
    async fn persist(&self, instance: InstanceSettings) -> Result<(), ContextError>;
}

/// Context source backed by the bridge configuration.
///
/// Instance settings persisted by install replace the configured ones for the
/// lifetime of the process.
pub struct StaticContextSource {
    instance: RwLock<InstanceSettings>,
    plugin_version: String,
    deployment: DeploymentContext,
}

impl StaticContextSource {
    pub fn new(
        instance: InstanceSettings,
        plugin_version: String,
        deployment: DeploymentContext,
    ) -> Self {
        StaticContextSource {
            instance: RwLock::new(instance),
            plugin_version,
            deployment,
        }
    }

    pub fn from_config(config: &PluginConfig) -> Self {
        Self::new(
            config.instance_settings(),
            config.version.clone(),
            DeploymentContext::from(&config.deployment),
        )
    }
}

#[async_trait]
impl ContextSource for StaticContextSource {
    async fn plugin_context(&self, headers: &HeaderMap) -> Result<PluginContext, ContextError> {
        Ok(PluginContext {
            instance: self.instance.read().clone(),
            plugin_version: self.plugin_version.clone(),
            deployment: self.deployment.clone(),
            user: caller_from_headers(headers)?,
        })
    }

    async fn persist(&self, instance: InstanceSettings) -> Result<(), ContextError> {
        *self.instance.write() = instance;
        Ok(())
    }
}

/// A missing or empty user header means an anonymous caller.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Option<CallerIdentity>, ContextError> {
    let Some(value) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    let login = value
        .to_str()
        .map_err(|_| ContextError::InvalidHeader(USER_HEADER))?
        .trim();

    Ok((!login.is_empty()).then(|| CallerIdentity {
        login: login.to_string(),
    }))
}
