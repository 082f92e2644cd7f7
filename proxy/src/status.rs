//! Connection diagnostics for the plugin status route.
//!
//! Each link of the trust chain is reported separately: settings completeness,
//! the external service's URL and token as seen from here, the host URL and
//! token as seen from here, and the host URL as seen by the external service.

use bytes::Bytes;
use directory::identity_cache::IdentityError;
use directory::settings::{EffectiveSettings, PluginContext};
use http::HeaderMap;
use http_body_util::combinators::BoxBody;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use shared::http::make_json_response;

use crate::errors::ProxyError;
use crate::state::AppState;
use crate::sync::SyncError;

const NOT_VALIDATED: &str = "Not validated";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionEntry {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for ConnectionEntry {
    fn default() -> Self {
        ConnectionEntry {
            ok: false,
            error: Some(NOT_VALIDATED.into()),
        }
    }
}

impl ConnectionEntry {
    fn set_valid(&mut self) {
        self.ok = true;
        self.error = None;
    }

    fn set_invalid(&mut self, reason: impl Into<String>) {
        self.ok = false;
        self.error = Some(reason.into());
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PluginConnection {
    pub settings: ConnectionEntry,
    pub service_account_token: ConnectionEntry,
    pub grafana_url_from_plugin: ConnectionEntry,
    pub grafana_url_from_engine: ConnectionEntry,
    pub oncall_api_url: ConnectionEntry,
    pub oncall_token: ConnectionEntry,
}

impl PluginConnection {
    pub fn all_ok(&self) -> bool {
        [
            &self.settings,
            &self.service_account_token,
            &self.grafana_url_from_plugin,
            &self.grafana_url_from_engine,
            &self.oncall_api_url,
            &self.oncall_token,
        ]
        .iter()
        .all(|entry| entry.ok)
    }

    /// Reports the first missing required setting.
    fn validate_settings(&mut self, settings: &EffectiveSettings) -> bool {
        let missing = if settings.stack_id == 0 {
            Some("jsonData.stackId")
        } else if settings.org_id == 0 {
            Some("jsonData.orgId")
        } else if settings.license.is_none() {
            Some("jsonData.license")
        } else if settings.oncall_api_url.is_empty() {
            Some("jsonData.onCallApiUrl")
        } else if settings.grafana_url.is_empty() {
            Some("jsonData.grafanaUrl")
        } else {
            None
        };

        match missing {
            Some(field) => self.settings.set_invalid(format!("{field} is not set")),
            None => self.settings.set_valid(),
        }
        self.settings.ok
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatusReport {
    #[serde(rename = "pluginConnection")]
    pub plugin_connection: PluginConnection,
    pub license: String,
    pub version: String,
    pub currently_undergoing_maintenance_message: String,
    pub api_url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EngineConnection {
    url: String,
    connected: bool,
    status_code: u16,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EngineStatus {
    connection_to_grafana: EngineConnection,
    license: String,
    version: String,
    currently_undergoing_maintenance_message: String,
    api_url: String,
}

/// Validates every link and returns the report. Only failures to build the
/// outbound calls are errors; connectivity problems end up in the report.
pub async fn check_status(
    state: &AppState,
    ctx: &PluginContext,
    settings: &EffectiveSettings,
) -> Result<StatusReport, ProxyError> {
    let mut report = StatusReport::default();
    if !report.plugin_connection.validate_settings(settings) {
        return Ok(report);
    }

    check_host(state, settings, &mut report.plugin_connection).await;
    check_external_service(state, ctx, settings, &mut report).await?;
    Ok(report)
}

async fn check_external_service(
    state: &AppState,
    ctx: &PluginContext,
    settings: &EffectiveSettings,
    report: &mut StatusReport,
) -> Result<(), ProxyError> {
    let connection = &mut report.plugin_connection;

    if let Err(e) = state.oncall.health(settings).await {
        tracing::warn!(error = %e, "external service health check failed");
        connection
            .oncall_api_url
            .set_invalid(format!("Error checking OnCall API health. {e}"));
        return Ok(());
    }

    let headers = match state.caller_headers(ctx, settings).await {
        Ok(headers) => headers,
        Err(ProxyError::Identity(
            e @ (IdentityError::Directory(_) | IdentityError::Enrichment { .. }),
        )) => {
            tracing::warn!(error = %e, "could not resolve caller for status check");
            connection
                .service_account_token
                .set_invalid(format!("Unable to look up caller in Grafana: {e}"));
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let reply = match state.oncall.engine_status(settings, headers).await {
        Ok(reply) => reply,
        Err(e) => {
            connection
                .oncall_api_url
                .set_invalid(format!("Unable to connect to OnCall engine: {e}"));
            return Ok(());
        }
    };

    match reply.status {
        StatusCode::OK => {}
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            connection.oncall_token.set_invalid(format!(
                "Unauthorized/Forbidden while accessing OnCall engine, status code: {}, check token",
                reply.status.as_u16()
            ));
            return Ok(());
        }
        status => {
            connection.oncall_api_url.set_invalid(format!(
                "Unable to connect to OnCall engine, status code: {}",
                status.as_u16()
            ));
            return Ok(());
        }
    }

    connection.oncall_api_url.set_valid();
    connection.oncall_token.set_valid();

    let engine: EngineStatus = match serde_json::from_slice(&reply.body) {
        Ok(engine) => engine,
        Err(e) => {
            connection
                .grafana_url_from_engine
                .set_invalid(format!("Unreadable status from OnCall engine: {e}"));
            return Ok(());
        }
    };

    let from_engine = &engine.connection_to_grafana;
    if from_engine.connected {
        connection.grafana_url_from_engine.set_valid();
    } else {
        connection.grafana_url_from_engine.set_invalid(format!(
            "While contacting Grafana: {} from Engine: {}, received status: {}, additional: {}",
            from_engine.url, settings.oncall_api_url, from_engine.status_code, from_engine.message
        ));
    }

    report.license = engine.license;
    report.version = engine.version;
    report.currently_undergoing_maintenance_message = engine.currently_undergoing_maintenance_message;
    report.api_url = engine.api_url;
    Ok(())
}

async fn check_host(state: &AppState, settings: &EffectiveSettings, connection: &mut PluginConnection) {
    let status = match state.host.check_org(settings).await {
        Ok(status) => status,
        Err(e) => {
            connection
                .grafana_url_from_plugin
                .set_invalid(format!("Grafana {}: {e}", settings.grafana_url));
            return;
        }
    };

    match status {
        StatusCode::OK => {
            connection.grafana_url_from_plugin.set_valid();
            connection.service_account_token.set_valid();
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            connection.grafana_url_from_plugin.set_valid();
            connection.service_account_token.set_invalid(format!(
                "Grafana {}, status code {}",
                settings.grafana_url,
                status.as_u16()
            ));
        }
        status => {
            connection.grafana_url_from_plugin.set_invalid(format!(
                "Grafana {}, status code {}",
                settings.grafana_url,
                status.as_u16()
            ));
        }
    }
}

pub async fn handle_status(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Response<BoxBody<Bytes, ProxyError>>, ProxyError> {
    let (ctx, resolved) = state.resolve(headers).await?;
    let (settings, error) = resolved.lenient();
    if let Some(e) = &error {
        tracing::info!(error = %e, "reporting status for incomplete settings");
    }

    let report = check_status(state, &ctx, &settings).await?;

    if report.plugin_connection.all_ok() {
        match state.sync.spawn(settings, state.user_agent(&ctx), false) {
            Ok(()) => {}
            Err(SyncError::InProgress { .. }) => {
                tracing::debug!("sync already in progress, not triggered by status check");
            }
            Err(e) => tracing::warn!(error = %e, "failed to trigger sync from status check"),
        }
    }

    Ok(make_json_response(StatusCode::OK, &report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{app_state, mock_healthy_upstreams, read_json};
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_default_report_serialization() {
        let json = serde_json::to_value(StatusReport::default()).unwrap();
        assert_eq!(
            json["pluginConnection"]["oncall_token"],
            json!({"ok": false, "error": "Not validated"})
        );
        assert_eq!(json["license"], "");
    }

    #[tokio::test]
    async fn test_incomplete_settings_stop_validation() {
        let server = MockServer::start_async().await;
        let state = app_state(&server, json!({"onCallApiUrl": server.base_url(), "orgId": 100}));

        let (ctx, resolved) = state.resolve(&HeaderMap::new()).await.unwrap();
        let (settings, _) = resolved.lenient();
        let report = check_status(&state, &ctx, &settings).await.unwrap();

        let connection = &report.plugin_connection;
        assert_eq!(
            connection.settings.error.as_deref(),
            Some("jsonData.stackId is not set")
        );
        assert_eq!(connection.oncall_api_url, ConnectionEntry::default());
        assert!(!connection.all_ok());
    }

    #[tokio::test]
    async fn test_everything_healthy() {
        let server = MockServer::start_async().await;
        mock_healthy_upstreams(&server).await;
        let state = app_state(&server, crate::testutils::complete_json_data(&server));

        let (ctx, resolved) = state.resolve(&HeaderMap::new()).await.unwrap();
        let settings = resolved.strict().unwrap();
        let report = check_status(&state, &ctx, &settings).await.unwrap();

        assert!(report.plugin_connection.all_ok(), "{report:?}");
        assert_eq!(report.version, "v1.9.0");
        assert_eq!(report.license, "Cloud");
        assert_eq!(report.api_url, "https://oncall.example.com");
    }

    #[tokio::test]
    async fn test_rejected_tokens_are_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/internal/v1/health/");
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/internal/v1/plugin/v2/status");
                then.status(403);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org");
                then.status(401);
            })
            .await;
        let state = app_state(&server, crate::testutils::complete_json_data(&server));

        let (ctx, resolved) = state.resolve(&HeaderMap::new()).await.unwrap();
        let settings = resolved.strict().unwrap();
        let connection = check_status(&state, &ctx, &settings)
            .await
            .unwrap()
            .plugin_connection;

        assert!(!connection.oncall_token.ok);
        assert!(connection.oncall_token.error.unwrap().contains("check token"));
        assert!(connection.grafana_url_from_plugin.ok);
        assert!(!connection.service_account_token.ok);
        assert_eq!(connection.grafana_url_from_engine, ConnectionEntry::default());
    }

    #[tokio::test]
    async fn test_engine_cannot_reach_host() {
        let server = MockServer::start_async().await;
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
                    "connection_to_grafana": {
                        "url": "http://grafana.internal",
                        "connected": false,
                        "status_code": 502,
                        "message": "bad gateway"
                    }
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org");
                then.status(200);
            })
            .await;
        let state = app_state(&server, crate::testutils::complete_json_data(&server));

        let (ctx, resolved) = state.resolve(&HeaderMap::new()).await.unwrap();
        let settings = resolved.strict().unwrap();
        let connection = check_status(&state, &ctx, &settings)
            .await
            .unwrap()
            .plugin_connection;

        assert!(connection.oncall_api_url.ok);
        assert!(connection.grafana_url_from_plugin.ok);
        let error = connection.grafana_url_from_engine.error.unwrap();
        assert!(error.contains("http://grafana.internal"));
        assert!(error.contains("502"));
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_reported() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/internal/v1/health/");
                then.status(200);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org/users");
                then.status(503);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org");
                then.status(200);
            })
            .await;
        let state = app_state(&server, crate::testutils::complete_json_data(&server));
        let mut headers = HeaderMap::new();
        headers.insert(crate::context::USER_HEADER, http::HeaderValue::from_static("alice"));

        let response = handle_status(&state, &headers).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        let connection = &body["pluginConnection"];
        assert_eq!(connection["grafana_url_from_plugin"], json!({"ok": true}));
        assert_eq!(connection["service_account_token"]["ok"], false);
        let error = connection["service_account_token"]["error"].as_str().unwrap();
        assert!(error.starts_with("Unable to look up caller in Grafana"), "{error}");
        // Engine status is never queried without a caller identity
        assert_eq!(
            connection["oncall_api_url"],
            json!({"ok": false, "error": "Not validated"})
        );
    }

    #[tokio::test]
    async fn test_handle_status_with_unhealthy_service() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/internal/v1/health/");
                then.status(500);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/org");
                then.status(200);
            })
            .await;
        let state = app_state(&server, crate::testutils::complete_json_data(&server));

        let response = handle_status(&state, &HeaderMap::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["pluginConnection"]["oncall_api_url"]["ok"], false);
        assert_eq!(body["pluginConnection"]["grafana_url_from_plugin"]["ok"], true);
    }
}
