use bytes::Bytes;
use directory::clock::ManualClock;
use directory::settings::{EffectiveSettings, License};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use httpmock::prelude::*;
use hyper::Response;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, Listener, OnCallConfig, PluginConfig, SyncConfig};
use crate::context::StaticContextSource;
use crate::errors::ProxyError;
use crate::oncall_client::OnCallClient;
use crate::state::AppState;

pub fn oncall_client() -> OnCallClient {
    OnCallClient::new(reqwest::Client::new(), &OnCallConfig::default())
}

/// Settings pointing both the host platform and the external service at `server`.
pub fn settings_for(server: &MockServer) -> EffectiveSettings {
    EffectiveSettings {
        oncall_api_url: server.base_url(),
        oncall_token: "oncall-token".into(),
        stack_id: 5,
        org_id: 100,
        license: Some(License::OpenSource),
        grafana_url: server.base_url(),
        grafana_token: "host-token".into(),
        ..Default::default()
    }
}

pub fn complete_json_data(server: &MockServer) -> Value {
    json!({
        "onCallApiUrl": server.base_url(),
        "stackId": 5,
        "orgId": 100,
        "license": "OpenSource",
        "grafanaUrl": server.base_url(),
    })
}

pub fn test_config(json_data: Value) -> Config {
    Config {
        listener: Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        },
        admin_listener: Listener {
            host: "127.0.0.1".into(),
            port: 3001,
        },
        plugin: PluginConfig {
            version: "1.2.3".into(),
            build_version: None,
            json_data,
            secure_json_data: HashMap::from([
                ("onCallApiToken".to_string(), "oncall-token".to_string()),
                ("grafanaToken".to_string(), "host-token".to_string()),
            ]),
            deployment: Default::default(),
        },
        directory: Default::default(),
        oncall: OnCallConfig::default(),
        sync: SyncConfig {
            gzip: false,
            ..Default::default()
        },
    }
}

/// Application state whose instance settings carry `json_data`. The server is
/// only used for its address; callers mock the routes they need.
pub fn app_state(_server: &MockServer, json_data: Value) -> AppState {
    let config = test_config(json_data);
    let context = Arc::new(StaticContextSource::from_config(&config.plugin));
    AppState::new(&config, context, Arc::new(ManualClock::new())).unwrap()
}

/// Health, engine status and host org routes all answering successfully.
pub async fn mock_healthy_upstreams(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/internal/v1/health/");
            then.status(200);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/internal/v1/plugin/v2/status");
            then.status(200).json_body(json!({
                "connection_to_grafana": {"url": "", "connected": true, "status_code": 200, "message": ""},
                "license": "Cloud",
                "version": "v1.9.0",
                "currently_undergoing_maintenance_message": "",
                "api_url": "https://oncall.example.com"
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/org");
            then.status(200).json_body(json!({"id": 100, "name": "Main Org."}));
        })
        .await;
}

pub async fn read_body(response: Response<BoxBody<Bytes, ProxyError>>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn read_json(response: Response<BoxBody<Bytes, ProxyError>>) -> Value {
    serde_json::from_slice(&read_body(response).await).unwrap()
}
