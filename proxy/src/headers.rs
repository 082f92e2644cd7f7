// Trust headers attached to every call to the external service, and the
// sanitizing applied to inbound headers before they are forwarded.

use directory::settings::EffectiveSettings;
use directory::types::DirectoryUser;
use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, SET_COOKIE, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use serde::Serialize;
use shared::http::filter_hop_by_hop;

use crate::context::USER_HEADER;

pub static INSTANCE_CONTEXT: HeaderName = HeaderName::from_static("x-instance-context");
pub static GRAFANA_CONTEXT: HeaderName = HeaderName::from_static("x-grafana-context");
pub static USER_CONTEXT: HeaderName = HeaderName::from_static("x-oncall-user-context");

#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    #[error("value for header {0} is not a valid header value")]
    InvalidValue(&'static str),
    #[error("could not encode header {name}: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
struct InstanceContext<'a> {
    stack_id: &'a str,
    org_id: &'a str,
    grafana_token: &'a str,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "PascalCase")]
struct GrafanaContext<'a> {
    #[serde(rename = "UserID")]
    user_id: i64,
    is_anonymous: bool,
    name: &'a str,
    login: &'a str,
    email: &'a str,
    role: &'a str,
}

pub fn user_agent(plugin_version: &str) -> String {
    format!("GrafanaOnCall/{plugin_version}")
}

/// Headers identifying this plugin instance: service token, instance context
/// and user agent. Used alone for calls made on behalf of no one.
pub fn service_headers(
    settings: &EffectiveSettings,
    user_agent: &str,
) -> Result<HeaderMap, HeaderError> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header_value("authorization", &settings.oncall_token)?);

    let stack_id = settings.stack_id.to_string();
    let org_id = settings.org_id.to_string();
    let instance = InstanceContext {
        stack_id: &stack_id,
        org_id: &org_id,
        grafana_token: &settings.grafana_token,
    };
    headers.insert(
        INSTANCE_CONTEXT.clone(),
        json_header("x-instance-context", &instance)?,
    );

    headers.insert(USER_AGENT, header_value("user-agent", user_agent)?);
    Ok(headers)
}

/// Service headers plus the caller context. `None` marks an anonymous caller,
/// which carries no user identity header.
pub fn caller_headers(
    settings: &EffectiveSettings,
    user: Option<&DirectoryUser>,
    user_agent: &str,
) -> Result<HeaderMap, HeaderError> {
    let mut headers = service_headers(settings, user_agent)?;

    let context = match user {
        Some(user) => GrafanaContext {
            user_id: user.id,
            is_anonymous: false,
            name: &user.name,
            login: &user.login,
            email: &user.email,
            role: &user.role,
        },
        None => GrafanaContext {
            is_anonymous: true,
            ..Default::default()
        },
    };
    headers.insert(
        GRAFANA_CONTEXT.clone(),
        json_header("x-grafana-context", &context)?,
    );

    if let Some(user) = user {
        headers.insert(
            USER_CONTEXT.clone(),
            json_header("x-oncall-user-context", user)?,
        );
    }
    Ok(headers)
}

/// Removes inbound headers that must not reach the external service.
/// Identity and trust headers only ever come from the bridge itself.
pub fn sanitize_inbound(headers: &mut HeaderMap, version: Version) {
    filter_hop_by_hop(headers, version);
    for name in [COOKIE, SET_COOKIE, HOST, CONTENT_TYPE, CONTENT_LENGTH] {
        headers.remove(name);
    }
    for name in [&INSTANCE_CONTEXT, &GRAFANA_CONTEXT, &USER_CONTEXT] {
        headers.remove(name);
    }
    headers.remove(USER_HEADER);
}

/// Only methods that carry a body get a JSON content type.
pub fn is_bodied(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

pub fn json_content_type() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

fn header_value(name: &'static str, value: &str) -> Result<HeaderValue, HeaderError> {
    HeaderValue::from_str(value).map_err(|_| HeaderError::InvalidValue(name))
}

fn json_header<T: Serialize>(name: &'static str, value: &T) -> Result<HeaderValue, HeaderError> {
    let encoded = serde_json::to_string(value).map_err(|source| HeaderError::Encode { name, source })?;
    header_value(name, &encoded)
}
