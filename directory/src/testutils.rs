use httpmock::MockServer;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::ManualClock;
use crate::config::DirectoryConfig;
use crate::host_client::HostClient;
use crate::plugin_settings_cache::PluginSettingsCache;
use crate::settings::{
    EffectiveSettings, InstanceSettings, License, PluginContext, SettingsResolver,
};

pub fn host_client() -> HostClient {
    HostClient::new(reqwest::Client::new(), &DirectoryConfig::default())
}

/// Settings pointing the host platform at `server`.
pub fn settings_for(server: &MockServer) -> EffectiveSettings {
    EffectiveSettings {
        oncall_api_url: "http://oncall.invalid".into(),
        oncall_token: "oncall-token".into(),
        stack_id: 5,
        org_id: 100,
        license: Some(License::OpenSource),
        grafana_url: server.base_url(),
        grafana_token: "host-token".into(),
        ..Default::default()
    }
}

pub fn resolver() -> SettingsResolver {
    let cache = PluginSettingsCache::new(Duration::from_secs(60), Arc::new(ManualClock::new()));
    SettingsResolver::new(host_client(), cache, "9.9.9".into())
}

pub fn plugin_context(server: &MockServer) -> PluginContext {
    PluginContext {
        instance: InstanceSettings {
            json_data: json!({
                "onCallApiUrl": "http://oncall.invalid",
                "stackId": 5,
                "orgId": 100,
                "grafanaUrl": server.base_url(),
            }),
            decrypted_secure_json_data: HashMap::from([
                ("onCallApiToken".to_string(), "oncall-token".to_string()),
                ("grafanaToken".to_string(), "host-token".to_string()),
            ]),
        },
        plugin_version: "1.2.3".into(),
        ..Default::default()
    }
}
