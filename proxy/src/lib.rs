pub mod config;
pub mod context;
pub mod errors;
pub mod headers;
mod install;
pub mod metrics_defs;
pub mod oncall_client;
mod proxy_service;
pub mod state;
mod status;
pub mod sync;
#[cfg(test)]
mod testutils;

use directory::clock::SystemClock;
use http::HeaderMap;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub use errors::ProxyError;

use crate::context::StaticContextSource;
use crate::proxy_service::BridgeService;
use crate::state::AppState;
use crate::sync::SyncError;

/// Runs the bridge until one of its listeners fails.
pub async fn run(config: config::Config) -> Result<(), ProxyError> {
    let context = Arc::new(StaticContextSource::from_config(&config.plugin));
    let state = Arc::new(AppState::new(&config, context, Arc::new(SystemClock))?);

    match state.resolve(&HeaderMap::new()).await {
        Ok((_, resolved)) => match resolved.error {
            None => tracing::info!("plugin settings resolved"),
            Some(e) => tracing::warn!(error = %e, "plugin settings incomplete, install required"),
        },
        Err(e) => tracing::error!(error = %e, "could not resolve plugin settings"),
    }

    if let Some(interval) = config.sync.interval_secs {
        tokio::spawn(periodic_sync(state.clone(), Duration::from_secs(interval)));
    }

    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        BridgeService::new(state.clone()),
    );
    let admin_state = state.clone();
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, ProxyError>::new(move || admin_state.is_ready()),
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}

/// Triggers a non-forced sync on every tick. Runs that would overlap an active
/// run or cool-down are skipped.
async fn periodic_sync(state: Arc<AppState>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let (ctx, settings) = match state.resolve(&HeaderMap::new()).await {
            Ok((ctx, resolved)) => match resolved.strict() {
                Ok(settings) => (ctx, settings),
                Err(e) => {
                    tracing::debug!(error = %e, "skipping periodic sync, settings incomplete");
                    continue;
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "skipping periodic sync");
                continue;
            }
        };

        match state.sync.spawn(settings, state.user_agent(&ctx), false) {
            Ok(()) | Err(SyncError::InProgress { .. }) => {}
            Err(e) => tracing::warn!(error = %e, "periodic sync failed to start"),
        }
    }
}
