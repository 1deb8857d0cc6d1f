//! Error types for the mirror

use std::sync::Arc;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use http::Method;

use crate::method::allow_header;
use crate::upstream::UpstreamResponse;

/// Result type for mirror operations
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Error types for mirror operations
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// The request path is not a manifest path
    #[error("not a manifest path: {0}")]
    InvalidPath(String),

    /// The request method is not supported for manifests
    #[error("method not allowed: {0}")]
    MethodNotSupported(Method),

    /// The upstream registry is misconfigured
    #[error("invalid upstream configuration: {0}")]
    Configuration(String),

    /// Fetching the manifest from upstream failed
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Outcome of a failed upstream fetch.
///
/// Every caller waiting on the same fetch receives a clone of the same error, so this type
/// is cheap to clone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// Upstream answered with a non-success status
    #[error("upstream responded with {}", .0.status())]
    Upstream(UpstreamResponse),

    /// Upstream answered successfully, but the response can't be cached
    #[error("upstream response is not cacheable")]
    Uncacheable(UpstreamResponse),

    /// Upstream could not be reached
    #[error("upstream unreachable: {0}")]
    Unreachable(Arc<str>),

    /// Upstream did not answer in time
    #[error("upstream timed out")]
    Timeout,
}

impl From<hyperdriver::client::Error> for FetchError {
    fn from(error: hyperdriver::client::Error) -> Self {
        match error {
            hyperdriver::client::Error::RequestTimeout => FetchError::Timeout,
            error => FetchError::Unreachable(error.to_string().into()),
        }
    }
}

impl MirrorError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            MirrorError::InvalidPath(_) => StatusCode::NOT_FOUND,
            MirrorError::MethodNotSupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            MirrorError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MirrorError::Fetch(FetchError::Upstream(response))
            | MirrorError::Fetch(FetchError::Uncacheable(response)) => response.status(),
            MirrorError::Fetch(FetchError::Unreachable(_)) => StatusCode::BAD_GATEWAY,
            MirrorError::Fetch(FetchError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            MirrorError::InvalidPath(_) => "NOT_FOUND",
            MirrorError::MethodNotSupported(_) => "UNSUPPORTED",
            MirrorError::Configuration(_) | MirrorError::Fetch(_) => "UNKNOWN",
        }
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for MirrorError {
    fn into_response(self) -> Response {
        // Upstream answers go back to the client untouched.
        let error = match self {
            MirrorError::Fetch(
                FetchError::Upstream(response) | FetchError::Uncacheable(response),
            ) => return response.into_response(),
            error => error,
        };

        let status = error.status_code();
        let code = error.error_code();
        let message = error.to_string();

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        let mut response = (status, axum::Json(body)).into_response();
        if matches!(error, MirrorError::MethodNotSupported(_)) {
            response.headers_mut().insert(header::ALLOW, allow_header());
        }
        response
    }
}
