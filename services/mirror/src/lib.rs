//! # Manifest Mirror
//!
//! A pull-only caching mirror for OCI / Docker registry manifests. Clients issue `GET` or
//! `HEAD` requests for `/v2/<repository>/manifests/<reference>`; the mirror answers from an
//! in-memory cache and fills the cache from a single upstream registry on a miss.
//!
//! ## Features
//!
//! - Successful manifests are cached forever, byte for byte, with their content type and digest
//! - Concurrent misses for the same manifest share a single upstream request
//! - Upstream error responses are passed through and never cached
//! - Requests with malformed paths or unsupported methods never reach upstream
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use mirror::{MirrorBuilder, Upstream, UpstreamOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let upstream = Upstream::new("https://registry-1.docker.io", &UpstreamOptions::default())?;
//! let mirror = MirrorBuilder::new(upstream).build();
//!
//! // Use the mirror service with axum or any tower-compatible server
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, mirror).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod cache;
mod config;
mod error;
mod manifest;
mod method;
pub mod mock;
mod path;
mod retry;
mod upstream;

pub use api::MirrorBuilder;
pub use cache::{CachedManifest, ManifestCache, classify};
pub use config::{MirrorConfig, UpstreamConfig};
pub use error::{FetchError, MirrorError, MirrorResult};
pub use manifest::ManifestHandler;
pub use method::{ALLOWED_METHODS, ManifestMethod, allow_header};
pub use path::{ManifestKey, parse_manifest_path};
pub use retry::Attempts;
pub use upstream::{
    DOCKER_CONTENT_DIGEST, MANIFEST_MEDIA_TYPES, Upstream, UpstreamOptions, UpstreamResponse,
};
