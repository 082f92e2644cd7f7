use bytes::Bytes;
use directory::settings::EffectiveSettings;
use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response};
use serde_json::json;
use shared::http::{filter_hop_by_hop, join_path, make_error_response_with_message, make_json_response};
use shared::{gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::ProxyError;
use crate::headers::{is_bodied, json_content_type, sanitize_inbound};
use crate::install::handle_install;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::oncall_client::OnCallError;
use crate::state::AppState;
use crate::status::handle_status;
use crate::sync::SyncError;

const INSTALL_ROUTE: &str = "/plugin/install";
const STATUS_ROUTE: &str = "/plugin/status";
const SYNC_ROUTE: &str = "/plugin/sync";

type ResponseBody = BoxBody<Bytes, ProxyError>;

/// Serves the plugin routes and proxies everything else to the external service.
pub struct BridgeService {
    state: Arc<AppState>,
}

impl BridgeService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl HyperService<Request<Incoming>> for BridgeService {
    type Response = Response<ResponseBody>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let state = self.state.clone();

        Box::pin(async move {
            let start = Instant::now();
            gauge!(REQUESTS_INFLIGHT).increment(1.0);

            let (parts, body) = req.into_parts();
            let route = route_name(parts.uri.path());
            let result = match body.collect().await {
                Ok(collected) => dispatch(&state, parts, collected.to_bytes()).await,
                Err(e) => Err(ProxyError::RequestBody(e)),
            };
            let response = result.unwrap_or_else(|e| error_response(&e));

            gauge!(REQUESTS_INFLIGHT).decrement(1.0);
            histogram!(
                REQUEST_DURATION,
                "route" => route,
                "status" => response.status().as_str().to_owned()
            )
            .record(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

fn route_name(path: &str) -> &'static str {
    match path {
        INSTALL_ROUTE => "install",
        STATUS_ROUTE => "status",
        SYNC_ROUTE => "sync",
        _ => "proxy",
    }
}

#[derive(Debug, PartialEq)]
enum Route {
    Install,
    Status,
    Sync,
    WrongMethod,
    Forward,
}

impl Route {
    fn of(parts: &Parts) -> Self {
        match (parts.uri.path(), &parts.method) {
            (INSTALL_ROUTE, &Method::POST) => Route::Install,
            (STATUS_ROUTE, &Method::GET) => Route::Status,
            (SYNC_ROUTE, &Method::POST) => Route::Sync,
            (INSTALL_ROUTE | STATUS_ROUTE | SYNC_ROUTE, _) => Route::WrongMethod,
            _ => Route::Forward,
        }
    }
}

async fn dispatch(
    state: &AppState,
    parts: Parts,
    body: Bytes,
) -> Result<Response<ResponseBody>, ProxyError> {
    match Route::of(&parts) {
        Route::Install => handle_install(state, &parts.headers).await,
        Route::Status => handle_status(state, &parts.headers).await,
        Route::Sync => handle_sync(state, &parts).await,
        Route::WrongMethod => Err(ProxyError::MethodNotAllowed),
        Route::Forward => forward(state, parts, body).await,
    }
}

fn error_response(err: &ProxyError) -> Response<ResponseBody> {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    } else {
        tracing::debug!(error = %err, "request rejected");
    }

    let mut response = make_error_response_with_message(status, &err.to_string());
    if let ProxyError::Sync(SyncError::InProgress { retry_after }) = err {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
    }
    response
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    (retry_after.as_secs_f64().ceil() as u64).max(1)
}

#[derive(Debug, Default, PartialEq)]
struct SyncParams {
    wait: bool,
    force: bool,
}

impl SyncParams {
    fn from_query(query: Option<&str>) -> Self {
        let mut params = SyncParams::default();
        let Some(query) = query else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "wait" => params.wait = parse_flag(&value),
                "force" => params.force = parse_flag(&value),
                _ => {}
            }
        }
        params
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

async fn handle_sync(state: &AppState, parts: &Parts) -> Result<Response<ResponseBody>, ProxyError> {
    let params = SyncParams::from_query(parts.uri.query());
    let (ctx, resolved) = state.resolve(&parts.headers).await?;
    let settings = resolved.strict()?;
    let user_agent = state.user_agent(&ctx);

    if params.wait {
        let outcome = state.sync.sync(&settings, &user_agent, params.force).await?;
        tracing::debug!(?outcome, "sync finished");
    } else {
        state.sync.spawn(settings, user_agent, params.force)?;
    }
    Ok(make_json_response(StatusCode::OK, &json!({})))
}

async fn forward(
    state: &AppState,
    parts: Parts,
    body: Bytes,
) -> Result<Response<ResponseBody>, ProxyError> {
    let (ctx, resolved) = state.resolve(&parts.headers).await?;
    let settings = resolved.strict()?;
    let trust = state.caller_headers(&ctx, &settings).await?;

    let request = build_forward_request(
        &settings,
        &state.proxy_path_prefix,
        parts,
        body,
        trust,
        state.oncall.api_timeout(),
    )?;
    tracing::debug!(method = %request.method(), url = %request.url(), "proxying request");

    let response = state.oncall.execute("proxy", request).await?;
    Ok(stream_response(response))
}

/// Rewrites an inbound request into one for the external service.
///
/// The path is mounted under `prefix`, the query string is kept verbatim and
/// the trust headers replace any inbound headers of the same name.
fn build_forward_request(
    settings: &EffectiveSettings,
    prefix: &str,
    parts: Parts,
    body: Bytes,
    trust: HeaderMap,
    timeout: Duration,
) -> Result<reqwest::Request, ProxyError> {
    let mut url = join_path(
        &settings.oncall_api_url,
        &format!("{prefix}/{}", parts.uri.path()),
    )
    .map_err(OnCallError::from)?;
    url.set_query(parts.uri.query());

    let mut headers = parts.headers;
    sanitize_inbound(&mut headers, parts.version);
    for (name, value) in &trust {
        headers.insert(name.clone(), value.clone());
    }
    let bodied = is_bodied(&parts.method);
    if bodied {
        headers.insert(CONTENT_TYPE, json_content_type());
    }

    let mut request = reqwest::Request::new(parts.method, url);
    *request.headers_mut() = headers;
    *request.timeout_mut() = Some(timeout);
    if bodied || !body.is_empty() {
        *request.body_mut() = Some(reqwest::Body::from(body));
    }
    Ok(request)
}

fn stream_response(response: reqwest::Response) -> Response<ResponseBody> {
    let version = response.version();
    let response: http::Response<reqwest::Body> = response.into();
    let (mut parts, body) = response.into_parts();
    filter_hop_by_hop(&mut parts.headers, version);
    Response::from_parts(parts, body.map_err(ProxyError::ResponseBody).boxed())
}
