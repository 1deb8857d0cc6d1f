//! Cached manifests
//!
//! The cache maps a [`ManifestKey`] to the last successful upstream response for it. Concurrent
//! misses for the same key are coalesced into a single upstream fetch.

use std::future::Future;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use echocache::{CacheMap, Lookup};

use crate::error::FetchError;
use crate::method::ManifestMethod;
use crate::path::ManifestKey;
use crate::upstream::{DOCKER_CONTENT_DIGEST, UpstreamResponse};

/// A successful upstream manifest response, as served from cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedManifest {
    content_type: HeaderValue,
    digest: HeaderValue,
    body: Bytes,
    cached_at: DateTime<Utc>,
}

impl CachedManifest {
    /// Media type of the manifest
    pub fn content_type(&self) -> &HeaderValue {
        &self.content_type
    }

    /// Digest of the manifest, as reported by upstream
    pub fn digest(&self) -> &HeaderValue {
        &self.digest
    }

    /// Manifest bytes, exactly as received
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Cached responses are always `200 OK`
    pub fn status(&self) -> StatusCode {
        StatusCode::OK
    }

    /// When the manifest was fetched
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Serve this manifest, with or without its body.
    ///
    /// `GET` and `HEAD` responses carry identical status and headers.
    pub fn respond(&self, method: ManifestMethod) -> Response {
        let headers = [
            (header::CONTENT_TYPE, self.content_type.clone()),
            (DOCKER_CONTENT_DIGEST, self.digest.clone()),
            (header::CONTENT_LENGTH, HeaderValue::from(self.body.len())),
        ];

        match method {
            ManifestMethod::Get => (self.status(), headers, self.body.clone()).into_response(),
            ManifestMethod::Head => (self.status(), headers).into_response(),
        }
    }
}

impl TryFrom<UpstreamResponse> for CachedManifest {
    type Error = FetchError;

    /// Only successful, digest-carrying, unencoded responses are cacheable.
    fn try_from(response: UpstreamResponse) -> Result<Self, Self::Error> {
        if !response.status().is_success() {
            return Err(FetchError::Upstream(response));
        }

        let Some(digest) = response.digest().cloned() else {
            tracing::warn!("upstream response has no digest, not caching");
            return Err(FetchError::Uncacheable(response));
        };

        if !response.is_identity_encoded() {
            tracing::warn!("upstream response is content-encoded, not caching");
            return Err(FetchError::Uncacheable(response));
        }

        let content_type = match response.content_type() {
            Some(content_type) => content_type.clone(),
            None => HeaderValue::from_static(detect_manifest_type(response.body())),
        };

        let (_, _, body) = response.into_parts();
        Ok(CachedManifest {
            content_type,
            digest,
            body,
            cached_at: Utc::now(),
        })
    }
}

/// Classify an upstream response as a cacheable manifest or a failure to pass through.
pub fn classify(response: UpstreamResponse) -> Result<CachedManifest, FetchError> {
    CachedManifest::try_from(response)
}

/// Detect manifest type from content, for upstreams which don't send one.
fn detect_manifest_type(data: &[u8]) -> &'static str {
    const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

    let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) else {
        return OCI_MANIFEST;
    };

    match json.get("mediaType").and_then(|v| v.as_str()) {
        Some("application/vnd.oci.image.index.v1+json") => {
            return "application/vnd.oci.image.index.v1+json";
        }
        Some("application/vnd.docker.distribution.manifest.v2+json") => {
            return "application/vnd.docker.distribution.manifest.v2+json";
        }
        Some("application/vnd.docker.distribution.manifest.list.v2+json") => {
            return "application/vnd.docker.distribution.manifest.list.v2+json";
        }
        _ => {}
    }

    match json.get("schemaVersion").and_then(|v| v.as_u64()) {
        Some(1) => "application/vnd.docker.distribution.manifest.v1+json",
        Some(2) if json.get("manifests").is_some() => "application/vnd.oci.image.index.v1+json",
        _ => OCI_MANIFEST,
    }
}

/// Shared cache of manifests, safe to use from many requests at once.
///
/// Cloning yields a handle to the same cache. Entries are never evicted unless
/// [`ManifestCache::evict`] or [`ManifestCache::clear`] is called.
#[derive(Debug, Clone, Default)]
pub struct ManifestCache {
    entries: CacheMap<ManifestKey, CachedManifest, FetchError>,
}

impl ManifestCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached manifest for `key`, if any. Never waits.
    pub fn lookup(&self, key: &ManifestKey) -> Option<Arc<CachedManifest>> {
        self.entries.get(key)
    }

    /// Return the cached manifest for `key`, or fetch it.
    ///
    /// Only one fetch runs per key at a time: callers arriving while a fetch is in flight
    /// wait for it and receive the same outcome. Successful fetches are cached, failures are
    /// not.
    pub async fn fetch_or_join<F, Fut>(
        &self,
        key: &ManifestKey,
        fetcher: F,
    ) -> Result<Arc<CachedManifest>, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UpstreamResponse, FetchError>> + Send + 'static,
    {
        let handle = self.entries.handle(key.clone(), move || {
            let fetch = fetcher();
            async move { classify(fetch.await?) }
        });

        match handle.lookup() {
            Lookup::Cached => tracing::trace!(%key, "served from cache"),
            Lookup::Joined => tracing::trace!(%key, "joined inflight fetch"),
            Lookup::Owner => tracing::trace!(%key, "fetching from upstream"),
        }

        handle.await
    }

    /// Insert a manifest, replacing any cached one for the same key.
    pub fn insert(&self, key: ManifestKey, manifest: CachedManifest) -> Arc<CachedManifest> {
        self.entries.insert(key, manifest)
    }

    /// Remove the cached manifest for `key`.
    pub fn evict(&self, key: &ManifestKey) -> Option<Arc<CachedManifest>> {
        self.entries.remove(key)
    }

    /// Remove every cached manifest.
    pub fn clear(&self) {
        self.entries.clear()
    }

    /// Number of cached manifests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of fetches currently in flight
    pub fn inflight(&self) -> usize {
        self.entries.inflight()
    }
}
