use directory::clock::Clock;
use directory::host_client::HostClient;
use directory::identity_cache::IdentityCache;
use directory::plugin_settings_cache::PluginSettingsCache;
use directory::settings::{EffectiveSettings, PluginContext, Resolved, SettingsResolver};
use directory::types::DirectoryUser;
use http::HeaderMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Config;
use crate::context::ContextSource;
use crate::errors::ProxyError;
use crate::headers;
use crate::oncall_client::OnCallClient;
use crate::sync::SyncEngine;

/// Long-lived collaborators shared by every request.
pub struct AppState {
    pub context: Arc<dyn ContextSource>,
    pub resolver: SettingsResolver,
    pub identities: IdentityCache,
    pub host: HostClient,
    pub oncall: OnCallClient,
    pub sync: SyncEngine,
    pub build_version: String,
    pub proxy_path_prefix: String,
    ready: AtomicBool,
}

impl AppState {
    pub fn new(
        config: &Config,
        context: Arc<dyn ContextSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ProxyError::Client)?;
        let build_version = config
            .plugin
            .build_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        let host = HostClient::new(client.clone(), &config.directory);
        let oncall = OnCallClient::new(client, &config.oncall);
        let plugins = PluginSettingsCache::new(config.directory.plugin_settings_ttl(), clock.clone());

        Ok(AppState {
            context,
            resolver: SettingsResolver::new(host.clone(), plugins, build_version.clone()),
            identities: IdentityCache::new(host.clone(), config.directory.user_ttl(), clock.clone()),
            sync: SyncEngine::new(host.clone(), oncall.clone(), clock, &config.sync),
            host,
            oncall,
            build_version,
            proxy_path_prefix: config.oncall.proxy_path_prefix.clone(),
            ready: AtomicBool::new(false),
        })
    }

    /// Builds the plugin context for `headers` and resolves its settings.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<(PluginContext, Resolved), ProxyError> {
        let ctx = self.context.plugin_context(headers).await?;
        let resolved = self.resolver.resolve(&ctx).await?;
        if resolved.error.is_none() {
            self.ready.store(true, Ordering::Relaxed);
        }
        Ok((ctx, resolved))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn user_agent(&self, ctx: &PluginContext) -> String {
        if ctx.plugin_version.is_empty() {
            headers::user_agent(&self.build_version)
        } else {
            headers::user_agent(&ctx.plugin_version)
        }
    }

    /// Resolves the calling user, if any, to an enriched directory record.
    pub async fn caller(
        &self,
        ctx: &PluginContext,
        settings: &EffectiveSettings,
    ) -> Result<Option<DirectoryUser>, ProxyError> {
        match &ctx.user {
            Some(caller) => Ok(Some(
                self.identities.resolve(settings, &caller.login).await?,
            )),
            None => Ok(None),
        }
    }

    /// Full trust headers for a call made on behalf of the caller in `ctx`.
    pub async fn caller_headers(
        &self,
        ctx: &PluginContext,
        settings: &EffectiveSettings,
    ) -> Result<HeaderMap, ProxyError> {
        let user = self.caller(ctx, settings).await?;
        Ok(headers::caller_headers(
            settings,
            user.as_ref(),
            &self.user_agent(ctx),
        )?)
    }
}
