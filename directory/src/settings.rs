//! Resolution of the effective plugin settings for one request.
//!
//! Settings are assembled from the persisted instance configuration, the
//! deployment configuration and the sibling plugin snapshot. Resolution keeps
//! going after a step fails so that diagnostic callers still see whatever could
//! be determined; strict callers reject any error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::LazyLock;

use crate::host_client::HostClient;
use crate::metrics_defs::SETTINGS_RESOLUTION_FAILURES;
use crate::plugin_settings_cache::PluginSettingsCache;
use crate::types::CallerIdentity;
use shared::counter;

pub const ONCALL_PLUGIN_ID: &str = "grafana-oncall-app";
pub const INCIDENT_PLUGIN_ID: &str = "grafana-incident-app";
pub const LABELS_PLUGIN_ID: &str = "grafana-labels-app";

pub const RBAC_FEATURE_TOGGLE: &str = "accessControlOnCall";
pub const EXTERNAL_SERVICE_ACCOUNTS_FEATURE_TOGGLE: &str = "externalServiceAccounts";

const ONCALL_TOKEN_SECRET: &str = "onCallApiToken";
const HOST_TOKEN_SECRET: &str = "grafanaToken";

static OSS_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+\.\d+\.\d+|dev-oss)$").expect("open source version pattern is valid")
});

static CLOUD_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(v\d+\.\d+\.\d+|r\d+-v\d+\.\d+\.\d+|github-actions-[a-zA-Z0-9-]+)$")
        .expect("cloud version pattern is valid")
});

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid plugin instance json data: {0}")]
    InvalidJsonData(String),
    #[error("cannot determine license from plugin version {0:?}")]
    UnknownLicense(String),
    #[error("host platform URL is not configured")]
    MissingHostUrl,
    #[error("external service accounts are enabled but no client secret is available")]
    MissingClientSecret,
}

impl SettingsError {
    pub fn reason(&self) -> &'static str {
        match self {
            SettingsError::InvalidJsonData(_) => "invalid_json_data",
            SettingsError::UnknownLicense(_) => "unknown_license",
            SettingsError::MissingHostUrl => "missing_host_url",
            SettingsError::MissingClientSecret => "missing_client_secret",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum License {
    Cloud,
    OpenSource,
    /// A license value persisted by an operator that is neither of the known ones
    Custom(String),
}

impl License {
    pub fn as_str(&self) -> &str {
        match self {
            License::Cloud => "Cloud",
            License::OpenSource => "OpenSource",
            License::Custom(value) => value,
        }
    }
}

impl From<String> for License {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Cloud" => License::Cloud,
            "OpenSource" => License::OpenSource,
            _ => License::Custom(value),
        }
    }
}

impl From<License> for String {
    fn from(license: License) -> Self {
        match license {
            License::Custom(value) => value,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Infers the license from a plugin version string.
///
/// The open source pattern is checked first.
pub fn infer_license(version: &str) -> Option<License> {
    if OSS_VERSION.is_match(version) {
        Some(License::OpenSource)
    } else if CLOUD_VERSION.is_match(version) {
        Some(License::Cloud)
    } else {
        None
    }
}

/// Persisted, non-secret part of the plugin instance configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceJsonData {
    #[serde(default)]
    pub on_call_api_url: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub stack_id: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub org_id: i64,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub grafana_url: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Per-instance configuration as handed to the plugin by the host.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceSettings {
    pub json_data: serde_json::Value,
    pub decrypted_secure_json_data: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeploymentContext {
    pub app_url: Option<String>,
    pub feature_toggles: HashSet<String>,
    pub client_secret: Option<String>,
}

impl DeploymentContext {
    pub fn feature_enabled(&self, toggle: &str) -> bool {
        self.feature_toggles.contains(toggle)
    }
}

/// Everything the host provides alongside one inbound request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PluginContext {
    pub instance: InstanceSettings,
    pub plugin_version: String,
    pub deployment: DeploymentContext,
    pub user: Option<CallerIdentity>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectiveSettings {
    pub oncall_api_url: String,
    pub oncall_token: String,
    pub stack_id: i64,
    pub org_id: i64,
    pub license: Option<License>,
    pub grafana_url: String,
    pub grafana_token: String,
    pub rbac_enabled: bool,
    pub incident_enabled: bool,
    pub incident_backend_url: String,
    pub labels_enabled: bool,
    pub external_service_account_enabled: bool,
}

impl EffectiveSettings {
    /// The instance configuration that reproduces these settings when persisted.
    pub fn to_instance_settings(&self) -> InstanceSettings {
        let json_data = InstanceJsonData {
            on_call_api_url: self.oncall_api_url.clone(),
            stack_id: self.stack_id,
            org_id: self.org_id,
            license: self
                .license
                .as_ref()
                .map(|l| l.as_str().to_string())
                .unwrap_or_default(),
            grafana_url: self.grafana_url.clone(),
        };

        let mut secrets = HashMap::from([(
            ONCALL_TOKEN_SECRET.to_string(),
            self.oncall_token.clone(),
        )]);
        if !self.grafana_token.is_empty() {
            secrets.insert(HOST_TOKEN_SECRET.to_string(), self.grafana_token.clone());
        }

        InstanceSettings {
            // Serializing a struct of strings and integers cannot fail
            json_data: serde_json::to_value(json_data).unwrap_or_default(),
            decrypted_secure_json_data: secrets,
        }
    }

    /// Body of the host call that stores these settings for the plugin.
    pub fn write_back(&self) -> PluginSettingsWriteBack {
        let instance = self.to_instance_settings();
        PluginSettingsWriteBack {
            json_data: instance.json_data,
            secure_json_data: instance.decrypted_secure_json_data,
            enabled: true,
            pinned: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSettingsWriteBack {
    pub json_data: serde_json::Value,
    pub secure_json_data: HashMap<String, String>,
    pub enabled: bool,
    pub pinned: bool,
}

/// Outcome of a resolution: the best-effort settings and the first failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub settings: EffectiveSettings,
    pub error: Option<SettingsError>,
}

impl Resolved {
    pub fn strict(self) -> Result<EffectiveSettings, SettingsError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.settings),
        }
    }

    pub fn lenient(self) -> (EffectiveSettings, Option<SettingsError>) {
        (self.settings, self.error)
    }
}

pub struct SettingsResolver {
    host: HostClient,
    plugins: PluginSettingsCache,
    build_version: String,
}

impl SettingsResolver {
    pub fn new(host: HostClient, plugins: PluginSettingsCache, build_version: String) -> Self {
        SettingsResolver {
            host,
            plugins,
            build_version,
        }
    }

    /// Resolves the settings for `ctx`.
    ///
    /// Only an unparseable instance configuration is a hard error. Every other
    /// failure is reported through [`Resolved::error`].
    pub async fn resolve(&self, ctx: &PluginContext) -> Result<Resolved, SettingsError> {
        let json_data = parse_json_data(&ctx.instance.json_data)?;
        let mut error = None;

        let mut settings = EffectiveSettings {
            oncall_api_url: json_data.on_call_api_url,
            stack_id: json_data.stack_id,
            org_id: json_data.org_id,
            license: (!json_data.license.is_empty()).then(|| License::from(json_data.license)),
            grafana_url: json_data.grafana_url,
            ..Default::default()
        };

        if settings.license.is_none() {
            let version = if ctx.plugin_version.is_empty() {
                self.build_version.as_str()
            } else {
                ctx.plugin_version.as_str()
            };
            match infer_license(version) {
                Some(license) => settings.license = Some(license),
                None => keep_first(&mut error, SettingsError::UnknownLicense(version.into())),
            }
        }

        settings.oncall_token = secret(&ctx.instance, ONCALL_TOKEN_SECRET);

        if settings.grafana_url.is_empty() {
            match ctx.deployment.app_url.as_deref().filter(|u| !u.is_empty()) {
                Some(app_url) => {
                    tracing::info!(app_url, "using deployment app URL as host platform URL");
                    settings.grafana_url = app_url.to_string();
                }
                None => keep_first(&mut error, SettingsError::MissingHostUrl),
            }
        }

        settings.rbac_enabled = ctx.deployment.feature_enabled(RBAC_FEATURE_TOGGLE);
        settings.external_service_account_enabled = ctx
            .deployment
            .feature_enabled(EXTERNAL_SERVICE_ACCOUNTS_FEATURE_TOGGLE);

        if settings.external_service_account_enabled {
            match ctx.deployment.client_secret.as_deref().filter(|s| !s.is_empty()) {
                Some(client_secret) => settings.grafana_token = client_secret.to_string(),
                None => keep_first(&mut error, SettingsError::MissingClientSecret),
            }
        } else {
            settings.grafana_token = secret(&ctx.instance, HOST_TOKEN_SECRET);
        }

        if !settings.grafana_url.is_empty() {
            let siblings = self.plugins.get(&self.host, &settings).await;
            if let Some(incident) = &siblings.incident {
                settings.incident_enabled = incident.enabled;
                settings.incident_backend_url = incident.backend_url.clone().unwrap_or_default();
            }
            if let Some(labels) = &siblings.labels {
                settings.labels_enabled = labels.enabled;
            }
        }

        if let Some(err) = &error {
            tracing::debug!(error = %err, "plugin settings resolved with an error");
            counter!(SETTINGS_RESOLUTION_FAILURES, "reason" => err.reason()).increment(1);
        }

        Ok(Resolved { settings, error })
    }
}

fn parse_json_data(value: &serde_json::Value) -> Result<InstanceJsonData, SettingsError> {
    if value.is_null() {
        return Ok(InstanceJsonData::default());
    }
    InstanceJsonData::deserialize(value).map_err(|e| {
        counter!(SETTINGS_RESOLUTION_FAILURES, "reason" => "invalid_json_data").increment(1);
        SettingsError::InvalidJsonData(e.to_string())
    })
}

fn secret(instance: &InstanceSettings, key: &str) -> String {
    instance
        .decrypted_secure_json_data
        .get(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn keep_first(slot: &mut Option<SettingsError>, err: SettingsError) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{plugin_context, resolver};
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_infer_license() {
        assert_eq!(infer_license("1.2.3"), Some(License::OpenSource));
        assert_eq!(infer_license("dev-oss"), Some(License::OpenSource));
        assert_eq!(infer_license("v1.2.3"), Some(License::Cloud));
        assert_eq!(infer_license("r123-v1.2.3"), Some(License::Cloud));
        assert_eq!(infer_license("github-actions-abc-123"), Some(License::Cloud));
        assert_eq!(infer_license("invalid-version"), None);
        assert_eq!(infer_license(""), None);
        assert_eq!(infer_license("1.2"), None);
    }

    #[test]
    fn test_license_string_round_trip() {
        let license: License = serde_json::from_value(json!("ExistingLicense")).unwrap();
        assert_eq!(license, License::Custom("ExistingLicense".into()));
        assert_eq!(serde_json::to_value(&license).unwrap(), json!("ExistingLicense"));
        assert_eq!(License::from("Cloud".to_string()), License::Cloud);
    }

    #[tokio::test]
    async fn test_license_inferred_from_version() {
        let server = MockServer::start_async().await;
        let resolver = resolver();

        let cases = [
            ("1.2.3", Some(License::OpenSource)),
            ("v1.2.3", Some(License::Cloud)),
        ];
        for (version, expected) in cases {
            let mut ctx = plugin_context(&server);
            ctx.plugin_version = version.into();
            let resolved = resolver.resolve(&ctx).await.unwrap();
            assert_eq!(resolved.error, None, "version {version}");
            assert_eq!(resolved.settings.license, expected, "version {version}");
        }
    }

    #[tokio::test]
    async fn test_unknown_version_is_an_error() {
        let server = MockServer::start_async().await;
        let resolver = resolver();
        let mut ctx = plugin_context(&server);
        ctx.plugin_version = "invalid-version".into();

        let (settings, error) = resolver.resolve(&ctx).await.unwrap().lenient();
        assert_eq!(error, Some(SettingsError::UnknownLicense("invalid-version".into())));
        assert_eq!(settings.license, None);
        // Later steps still ran
        assert_eq!(settings.oncall_token, "oncall-token");
        assert_eq!(settings.grafana_token, "host-token");
    }

    #[tokio::test]
    async fn test_persisted_license_is_preserved() {
        let server = MockServer::start_async().await;
        let resolver = resolver();
        let mut ctx = plugin_context(&server);
        ctx.plugin_version = "invalid-version".into();
        ctx.instance.json_data["license"] = json!("ExistingLicense");

        let settings = resolver.resolve(&ctx).await.unwrap().strict().unwrap();
        assert_eq!(settings.license, Some(License::Custom("ExistingLicense".into())));
    }

    #[tokio::test]
    async fn test_empty_version_falls_back_to_build_version() {
        let server = MockServer::start_async().await;
        let resolver = resolver();
        let mut ctx = plugin_context(&server);
        ctx.plugin_version = String::new();

        // The test resolver is built with version "9.9.9"
        let settings = resolver.resolve(&ctx).await.unwrap().strict().unwrap();
        assert_eq!(settings.license, Some(License::OpenSource));
    }

    #[tokio::test]
    async fn test_invalid_json_data_is_hard_error() {
        let server = MockServer::start_async().await;
        let resolver = resolver();
        let mut ctx = plugin_context(&server);
        ctx.instance.json_data = json!({"stackId": "not-a-number"});

        let err = resolver.resolve(&ctx).await.unwrap_err();
        assert!(matches!(err, SettingsError::InvalidJsonData(_)));
    }

    #[tokio::test]
    async fn test_host_url_falls_back_to_app_url() {
        let server = MockServer::start_async().await;
        let resolver = resolver();
        let mut ctx = plugin_context(&server);
        ctx.instance.json_data["grafanaUrl"] = json!("");
        ctx.deployment.app_url = Some(server.base_url());

        let settings = resolver.resolve(&ctx).await.unwrap().strict().unwrap();
        assert_eq!(settings.grafana_url, server.base_url());

        ctx.deployment.app_url = None;
        let resolved = resolver.resolve(&ctx).await.unwrap();
        assert_eq!(resolved.error, Some(SettingsError::MissingHostUrl));
    }

    #[tokio::test]
    async fn test_feature_toggles() {
        let server = MockServer::start_async().await;
        let resolver = resolver();
        let mut ctx = plugin_context(&server);
        ctx.deployment.feature_toggles = HashSet::from([
            RBAC_FEATURE_TOGGLE.to_string(),
            EXTERNAL_SERVICE_ACCOUNTS_FEATURE_TOGGLE.to_string(),
        ]);
        ctx.deployment.client_secret = Some("client-secret".into());

        let settings = resolver.resolve(&ctx).await.unwrap().strict().unwrap();
        assert!(settings.rbac_enabled);
        assert!(settings.external_service_account_enabled);
        assert_eq!(settings.grafana_token, "client-secret");

        ctx.deployment.client_secret = None;
        let resolved = resolver.resolve(&ctx).await.unwrap();
        assert_eq!(resolved.error, Some(SettingsError::MissingClientSecret));
    }

    #[tokio::test]
    async fn test_tokens_are_trimmed() {
        let server = MockServer::start_async().await;
        let resolver = resolver();
        let mut ctx = plugin_context(&server);
        ctx.instance
            .decrypted_secure_json_data
            .insert("onCallApiToken".into(), "  padded-token\n".into());

        let settings = resolver.resolve(&ctx).await.unwrap().strict().unwrap();
        assert_eq!(settings.oncall_token, "padded-token");
    }

    #[tokio::test]
    async fn test_sibling_plugins_applied() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/plugins/grafana-incident-app/settings");
                then.status(200).json_body(json!({
                    "enabled": true,
                    "jsonData": {"backendUrl": "https://incident.example.com"}
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/plugins/grafana-labels-app/settings");
                then.status(200).json_body(json!({"enabled": true}));
            })
            .await;

        let resolver = resolver();
        let settings = resolver
            .resolve(&plugin_context(&server))
            .await
            .unwrap()
            .strict()
            .unwrap();
        assert!(settings.incident_enabled);
        assert_eq!(settings.incident_backend_url, "https://incident.example.com");
        assert!(settings.labels_enabled);
    }

    #[test]
    fn test_write_back_shape() {
        let settings = EffectiveSettings {
            oncall_api_url: "https://oncall.example.com".into(),
            oncall_token: "oncall-token".into(),
            stack_id: 5,
            org_id: 100,
            license: Some(License::Cloud),
            grafana_url: "https://grafana.example.com".into(),
            grafana_token: "host-token".into(),
            ..Default::default()
        };

        let body = serde_json::to_value(settings.write_back()).unwrap();
        assert_eq!(
            body,
            json!({
                "jsonData": {
                    "onCallApiUrl": "https://oncall.example.com",
                    "stackId": 5,
                    "orgId": 100,
                    "license": "Cloud",
                    "grafanaUrl": "https://grafana.example.com"
                },
                "secureJsonData": {
                    "onCallApiToken": "oncall-token",
                    "grafanaToken": "host-token"
                },
                "enabled": true,
                "pinned": true
            })
        );
    }
}
