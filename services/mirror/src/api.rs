//! Mirror builder and router

use axum::Router;
use axum::http::{HeaderName, HeaderValue};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::cache::ManifestCache;
use crate::config::MirrorConfig;
use crate::error::MirrorResult;
use crate::manifest::ManifestHandler;
use crate::upstream::Upstream;

const API_VERSION_HEADER: &str = "docker-distribution-api-version";
const API_VERSION: &str = "registry/2.0";

/// Mirror builder for configuring and creating the manifest mirror service
#[derive(Debug)]
pub struct MirrorBuilder {
    upstream: Upstream,
    cache: Option<ManifestCache>,
}

impl MirrorBuilder {
    /// Create a new mirror builder for `upstream`
    pub fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            cache: None,
        }
    }

    /// Create a mirror builder from configuration.
    ///
    /// Fails if the upstream URL is not usable.
    pub fn from_config(config: &MirrorConfig) -> MirrorResult<Self> {
        let upstream = Upstream::new(&config.upstream.url, &config.upstream.options)?;
        Ok(Self::new(upstream))
    }

    /// Use an existing cache, e.g. to share it or inspect it
    pub fn cache(mut self, cache: ManifestCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the manifest handler on its own
    pub fn handler(self) -> ManifestHandler {
        ManifestHandler::new(self.cache.unwrap_or_default(), self.upstream)
    }

    /// Build the mirror service
    ///
    /// Returns a Router, handling everything under `/v2/`, that can be served with any
    /// tower-compatible server. Anything which is not a manifest path is `404 Not Found`,
    /// whatever the method.
    pub fn build(self) -> Router {
        crate::manifest::router()
            .with_state(self.handler())
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static(API_VERSION_HEADER),
                HeaderValue::from_static(API_VERSION),
            ))
    }
}
