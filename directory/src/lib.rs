pub mod clock;
pub mod config;
pub mod host_client;
pub mod identity_cache;
pub mod metrics_defs;
pub mod plugin_settings_cache;
pub mod settings;
pub mod types;

#[cfg(test)]
mod testutils;
