//! Forwarding manifest requests to the upstream registry
//!
//! The forwarder only ever substitutes the scheme and host of a request: the path and method
//! go upstream unchanged, and the response body comes back exactly as upstream produced it.
//! Digests are computed over those exact bytes, so the forwarder asks for `identity` encoding
//! and never decodes a body.

use std::time::Duration;

use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::uri::{Authority, Scheme};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use hyperdriver::client::SharedClientService;
use hyperdriver::service::SharedService;
use serde::Deserialize;
use tower::ServiceExt as _;

use crate::config::seconds;
use crate::error::{FetchError, MirrorError, MirrorResult};
use crate::method::ManifestMethod;
use crate::path::ManifestKey;
use crate::retry::Attempts;

/// Header carrying the digest of a manifest body.
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

/// Manifest media types requested from upstream by default.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.docker.distribution.manifest.v2+json",
];

const USER_AGENT: &str = concat!("manifest-mirror/", env!("CARGO_PKG_VERSION"));

/// Upstream response headers the mirror keeps.
const PRESERVED_HEADERS: [HeaderName; 3] = [
    header::CONTENT_TYPE,
    DOCKER_CONTENT_DIGEST,
    header::CONTENT_ENCODING,
];

/// Tuning for the connection to upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamOptions {
    /// Time allowed for a whole request, in seconds
    #[serde(deserialize_with = "seconds::deserialize")]
    pub timeout: Duration,

    /// Time allowed to establish a connection, in seconds
    #[serde(deserialize_with = "seconds::deserialize")]
    pub connect_timeout: Duration,

    /// How many times a request which failed to reach upstream is retried
    pub retries: usize,

    /// Media types sent in the `Accept` header
    pub accept: Vec<String>,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retries: Attempts::default().remaining(),
            accept: MANIFEST_MEDIA_TYPES.iter().map(|&s| s.to_owned()).collect(),
        }
    }
}

/// The status, relevant headers and body of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl UpstreamResponse {
    /// Create a response from its parts
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Upstream status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The preserved upstream headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The raw response body, empty for `HEAD` requests
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The `Content-Type` sent by upstream
    pub fn content_type(&self) -> Option<&HeaderValue> {
        self.headers.get(header::CONTENT_TYPE)
    }

    /// The `Docker-Content-Digest` sent by upstream, if it is not empty
    pub fn digest(&self) -> Option<&HeaderValue> {
        self.headers
            .get(DOCKER_CONTENT_DIGEST)
            .filter(|value| !value.is_empty())
    }

    /// Whether the body was sent without any content encoding
    pub fn is_identity_encoded(&self) -> bool {
        self.headers
            .get_all(header::CONTENT_ENCODING)
            .iter()
            .all(|value| value.as_bytes().eq_ignore_ascii_case(b"identity"))
    }

    /// Split into status, headers and body
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }

    /// Replay this response to a client, with or without its body.
    pub fn respond(&self, method: ManifestMethod) -> Response {
        let body = if method.includes_body() {
            axum::body::Body::from(self.body.clone())
        } else {
            axum::body::Body::empty()
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        if !response.headers().contains_key(header::CONTENT_LENGTH) {
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        }
        response
    }
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        self.respond(ManifestMethod::Get)
    }
}

/// The upstream registry, reachable at a fixed scheme and host.
#[derive(Debug, Clone)]
pub struct Upstream {
    scheme: Scheme,
    authority: Authority,
    accept: HeaderValue,
    timeout: Duration,
    service: SharedClientService<Body, Body>,
}

impl Upstream {
    /// Connect to the upstream at `base` over HTTP or HTTPS.
    ///
    /// `base` must be an absolute URL with a scheme and a host, and no path.
    pub fn new(base: &str, options: &UpstreamOptions) -> MirrorResult<Self> {
        parse_base(base)?;

        let mut builder = hyperdriver::Client::build_tcp_http();
        let tcp = builder.transport();
        tcp.config_mut().connect_timeout = Some(options.connect_timeout);

        let client = builder
            .with_default_tls()
            .with_timeout(options.timeout)
            .build_service();

        Self::with_service(base, options, client)
    }

    /// Reach the upstream at `base` through the provided service.
    pub fn with_service<S>(base: &str, options: &UpstreamOptions, service: S) -> MirrorResult<Self>
    where
        S: tower::Service<
                http::Request<Body>,
                Response = http::Response<Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let (scheme, authority) = parse_base(base)?;
        let accept = HeaderValue::from_str(&options.accept.join(", ")).map_err(|_| {
            MirrorError::Configuration(format!("invalid accept media types: {:?}", options.accept))
        })?;

        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(tower::retry::RetryLayer::new(Attempts::new(options.retries)))
            .service(service);

        Ok(Self {
            scheme,
            authority,
            accept,
            timeout: options.timeout,
            service,
        })
    }

    /// The upstream host and port
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Build the upstream request for a manifest.
    pub fn request(
        &self,
        key: &ManifestKey,
        method: ManifestMethod,
    ) -> Result<http::Request<Body>, FetchError> {
        let uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(key.path())
            .build()
            .map_err(|error| FetchError::Unreachable(format!("invalid upstream uri: {error}").into()))?;

        let mut request = http::Request::new(Body::empty());
        *request.method_mut() = method.as_method();
        *request.uri_mut() = uri;

        let headers = request.headers_mut();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        if !self.accept.is_empty() {
            headers.insert(header::ACCEPT, self.accept.clone());
        }

        Ok(request)
    }

    /// Fetch a manifest from upstream.
    ///
    /// Any HTTP response is returned as `Ok`, whatever its status. Only failures to get a
    /// response at all are errors.
    #[tracing::instrument(skip(self), fields(upstream = %self.authority))]
    pub async fn fetch(
        &self,
        key: &ManifestKey,
        method: ManifestMethod,
    ) -> Result<UpstreamResponse, FetchError> {
        let request = self.request(key, method)?;

        // Headers and body share one deadline, so a slow body can't extend the request.
        let deadline = tokio::time::Instant::now() + self.timeout;

        let response = tokio::time::timeout_at(deadline, self.service.clone().oneshot(request))
            .await
            .map_err(|_| {
                tracing::warn!("upstream request timed out");
                FetchError::Timeout
            })?
            .map_err(|error| {
                tracing::warn!("upstream request failed: {error}");
                FetchError::from(error)
            })?;

        let (parts, body) = response.into_parts();

        let mut headers = HeaderMap::new();
        for name in PRESERVED_HEADERS {
            for value in parts.headers.get_all(&name) {
                headers.append(name.clone(), value.clone());
            }
        }

        let body = match method {
            ManifestMethod::Get => {
                let collected = tokio::time::timeout_at(deadline, body.collect())
                    .await
                    .map_err(|_| FetchError::Timeout)?
                    .map_err(|error| {
                        tracing::warn!("reading upstream body failed: {error}");
                        FetchError::Unreachable(format!("reading response body: {error}").into())
                    })?;
                collected.to_bytes()
            }
            ManifestMethod::Head => {
                if let Some(length) = parts.headers.get(header::CONTENT_LENGTH) {
                    headers.insert(header::CONTENT_LENGTH, length.clone());
                }
                Bytes::new()
            }
        };

        tracing::debug!(status = %parts.status, bytes = body.len(), "upstream responded");
        Ok(UpstreamResponse::new(parts.status, headers, body))
    }
}

fn parse_base(base: &str) -> MirrorResult<(Scheme, Authority)> {
    let invalid = |reason: &str| MirrorError::Configuration(format!("{reason}: {base:?}"));

    let uri: Uri = base.parse().map_err(|_| invalid("not a valid URL"))?;
    let scheme = uri
        .scheme()
        .cloned()
        .ok_or_else(|| invalid("upstream URL missing scheme"))?;
    if scheme != Scheme::HTTP && scheme != Scheme::HTTPS {
        return Err(invalid("unsupported upstream scheme"));
    }

    let authority = uri
        .authority()
        .cloned()
        .filter(|authority| !authority.host().is_empty())
        .ok_or_else(|| invalid("upstream URL missing host"))?;

    if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
        return Err(invalid("upstream URL must not have a path or query"));
    }

    Ok((scheme, authority))
}
