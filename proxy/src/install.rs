use bytes::Bytes;
use directory::settings::License;
use http::HeaderMap;
use http_body_util::combinators::BoxBody;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::http::make_json_response;

use crate::errors::ProxyError;
use crate::oncall_client::Reply;
use crate::state::AppState;
use crate::sync::SyncError;

/// Error code reported to the frontend when provisioning fails.
const INSTALL_FAILED_CODE: u32 = 1000;

/// What the external service hands back after provisioning this instance.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Provisioning {
    error: String,
    stack_id: i64,
    org_id: i64,
    on_call_token: String,
    license: String,
}

#[derive(Serialize)]
struct InstallFailure<'a> {
    code: u32,
    message: &'a str,
    details: serde_json::Value,
}

/// Provisions this instance with the external service, stores the returned
/// identity and token on the host and triggers a forced sync.
pub async fn handle_install(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Response<BoxBody<Bytes, ProxyError>>, ProxyError> {
    let (ctx, resolved) = state.resolve(headers).await?;
    let mut settings = resolved.strict()?;

    let caller_headers = state.caller_headers(&ctx, &settings).await?;
    let reply = state.oncall.install(&settings, caller_headers).await?;

    let provisioning = match parse_provisioning(&reply) {
        Some(provisioning) => provisioning,
        None => {
            tracing::warn!(status = %reply.status, "external service refused install");
            return Ok(install_failure(&reply));
        }
    };

    settings.stack_id = provisioning.stack_id;
    settings.org_id = provisioning.org_id;
    settings.oncall_token = provisioning.on_call_token;
    if !provisioning.license.is_empty() {
        settings.license = Some(License::from(provisioning.license));
    }

    state.host.save_plugin_settings(&settings).await?;
    state.context.persist(settings.to_instance_settings()).await?;
    tracing::info!(
        stack_id = settings.stack_id,
        org_id = settings.org_id,
        "plugin installed"
    );

    match state.sync.spawn(settings, state.user_agent(&ctx), true) {
        Ok(()) => {}
        Err(SyncError::InProgress { .. }) => {
            tracing::info!("sync already in progress, skipping post-install sync");
        }
        Err(e) => tracing::warn!(error = %e, "failed to start post-install sync"),
    }

    Ok(make_json_response(StatusCode::OK, &json!({})))
}

/// Provisioning data from a successful reply. `None` for anything else.
fn parse_provisioning(reply: &Reply) -> Option<Provisioning> {
    if reply.status != StatusCode::OK {
        return None;
    }
    let provisioning: Provisioning = serde_json::from_slice(&reply.body).ok()?;
    provisioning.error.is_empty().then_some(provisioning)
}

fn install_failure(reply: &Reply) -> Response<BoxBody<Bytes, ProxyError>> {
    // Upstream payload is passed through as-is; non-JSON bodies become a string
    let details = serde_json::from_slice(&reply.body).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&reply.body).into_owned())
    });

    make_json_response(
        StatusCode::BAD_REQUEST,
        &InstallFailure {
            code: INSTALL_FAILED_CODE,
            message: "Install failed",
            details,
        },
    )
}
