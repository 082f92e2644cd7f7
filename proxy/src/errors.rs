use directory::host_client::HostError;
use directory::identity_cache::IdentityError;
use directory::settings::SettingsError;
use hyper::StatusCode;
use std::io;

use crate::context::ContextError;
use crate::headers::HeaderError;
use crate::oncall_client::OnCallError;
use crate::sync::SyncError;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request context error: {0}")]
    Context(#[from] ContextError),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("host platform error: {0}")]
    Host(#[from] HostError),
    #[error("external service error: {0}")]
    OnCall(#[from] OnCallError),
    #[error("{0}")]
    Sync(#[from] SyncError),
    #[error("header error: {0}")]
    Header(#[from] HeaderError),
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] hyper::Error),
    #[error("failed to stream response body: {0}")]
    ResponseBody(#[source] reqwest::Error),
    #[error("method not allowed")]
    MethodNotAllowed,
}

impl ProxyError {
    /// Status returned to the caller when a request fails with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Context(_) | ProxyError::RequestBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::Identity(IdentityError::UserNotFound(_)) => StatusCode::BAD_REQUEST,
            ProxyError::Identity(_) | ProxyError::Host(_) | ProxyError::OnCall(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::Sync(SyncError::InProgress { .. }) => StatusCode::CONFLICT,
            ProxyError::Sync(SyncError::Collect(_) | SyncError::Push(_)) => StatusCode::BAD_GATEWAY,
            ProxyError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Io(_)
            | ProxyError::Client(_)
            | ProxyError::Settings(_)
            | ProxyError::Sync(SyncError::Headers(_))
            | ProxyError::Header(_)
            | ProxyError::ResponseBody(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
