//! Manifest requests
//!
//! Each request moves through path validation, method validation, a cache lookup and, on a
//! miss, a coalesced upstream fetch. Requests rejected by either validation step never reach
//! the cache or upstream.

use axum::Router;
use axum::extract::{OriginalUri, State};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::any;

use crate::cache::ManifestCache;
use crate::error::{FetchError, MirrorResult};
use crate::method::ManifestMethod;
use crate::path::parse_manifest_path;
use crate::upstream::Upstream;

/// Router for manifest operations
pub(crate) fn router() -> Router<ManifestHandler> {
    Router::new()
        .route("/v2/", any(handle_manifest))
        .route("/v2/{*path}", any(handle_manifest))
}

#[tracing::instrument(skip_all, fields(method = %method, path = %uri.0.path()))]
async fn handle_manifest(
    State(handler): State<ManifestHandler>,
    method: Method,
    uri: OriginalUri,
) -> Response {
    match handler.serve(&method, uri.0.path()).await {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!("rejecting request: {error}");
            error.into_response()
        }
    }
}

/// Serves manifests from the cache, filling it from upstream.
#[derive(Debug, Clone)]
pub struct ManifestHandler {
    cache: ManifestCache,
    upstream: Upstream,
}

impl ManifestHandler {
    /// Serve manifests from `upstream` through `cache`.
    pub fn new(cache: ManifestCache, upstream: Upstream) -> Self {
        Self { cache, upstream }
    }

    /// The cache backing this handler
    pub fn cache(&self) -> &ManifestCache {
        &self.cache
    }

    /// Handle a request for `path`.
    ///
    /// Returns an error for requests rejected before any upstream contact, and for upstream
    /// transport failures. Upstream error responses are passed through as `Ok` responses.
    pub async fn serve(&self, method: &Method, path: &str) -> MirrorResult<Response> {
        let key = parse_manifest_path(path)?;
        let method = ManifestMethod::from_method(method)?;

        if let Some(manifest) = self.cache.lookup(&key) {
            tracing::debug!(%key, "cache hit");
            return Ok(manifest.respond(method));
        }

        tracing::debug!(%key, "cache miss");

        // Fills always GET, so the cached entry has a body to serve later GETs from.
        let upstream = self.upstream.clone();
        let fill = key.clone();
        let outcome = self
            .cache
            .fetch_or_join(&key, move || async move {
                upstream.fetch(&fill, ManifestMethod::Get).await
            })
            .await;

        match outcome {
            Ok(manifest) => Ok(manifest.respond(method)),
            Err(FetchError::Upstream(response) | FetchError::Uncacheable(response)) => {
                tracing::debug!(%key, status = %response.status(), "passing upstream response through");
                Ok(response.respond(method))
            }
            Err(error) => Err(error.into()),
        }
    }
}
