//! Integration tests for the manifest mirror

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use bytes::Bytes;
use mirror::mock::MockUpstream;
use mirror::{ManifestCache, ManifestKey, MirrorBuilder, Upstream, UpstreamOptions};
use tower::ServiceExt;

const ALPINE: &str = "/v2/library/alpine/manifests/latest";
const ALPINE_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
const ALPINE_BODY: &[u8] = br#"{"schemaVersion":2}"#;

fn alpine() -> MockUpstream {
    MockUpstream::new().manifest(ALPINE, ALPINE_TYPE, "sha256:c0ffee", ALPINE_BODY)
}

/// Helper to create a mirror in front of a mock upstream
fn test_mirror(mock: &MockUpstream) -> (axum::Router, ManifestCache) {
    let upstream =
        Upstream::with_service("http://upstream.test", &UpstreamOptions::default(), mock.clone())
            .unwrap();
    let cache = ManifestCache::new();
    let app = MirrorBuilder::new(upstream).cache(cache.clone()).build();
    (app, cache)
}

async fn send(app: &axum::Router, method: Method, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn body(response: axum::response::Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_v2_root_is_not_found() {
    let mock = alpine();
    let (app, cache) = test_mirror(&mock);

    for method in [Method::GET, Method::HEAD, Method::POST, Method::DELETE] {
        let response = send(&app, method.clone(), "/v2/").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method}");
        assert!(response.headers().get(header::ALLOW).is_none(), "{method}");
        assert_eq!(
            response.headers().get("docker-distribution-api-version").unwrap(),
            "registry/2.0"
        );
    }

    assert_eq!(mock.calls(), 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_miss_then_hit() {
    let mock = alpine();
    let (app, cache) = test_mirror(&mock);

    let response = send(&app, Method::GET, ALPINE).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), ALPINE_TYPE);
    assert_eq!(
        response.headers().get("docker-content-digest").unwrap(),
        "sha256:c0ffee"
    );
    assert_eq!(&body(response).await[..], ALPINE_BODY);
    assert_eq!(mock.calls(), 1);
    assert_eq!(cache.len(), 1);

    let requests = mock.requests();
    let request = &requests[0];
    assert_eq!(request.method(), Method::GET);
    assert_eq!(request.path(), ALPINE);
    assert_eq!(request.headers().get(header::ACCEPT_ENCODING).unwrap(), "identity");

    let response = send(&app, Method::GET, ALPINE).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("docker-content-digest").unwrap(),
        "sha256:c0ffee"
    );
    assert_eq!(&body(response).await[..], ALPINE_BODY);
    assert_eq!(mock.calls(), 1, "hit must not contact upstream");
}

#[tokio::test]
async fn test_head_matches_get() {
    let mock = alpine();
    let (app, _) = test_mirror(&mock);

    let get = send(&app, Method::GET, ALPINE).await;
    let head = send(&app, Method::HEAD, ALPINE).await;

    assert_eq!(head.status(), get.status());
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::HeaderName::from_static("docker-content-digest"),
    ] {
        assert_eq!(head.headers().get(&name), get.headers().get(&name), "{name}");
    }
    assert_eq!(
        head.headers().get(header::CONTENT_LENGTH).unwrap(),
        &HeaderValue::from(ALPINE_BODY.len())
    );
    assert!(body(head).await.is_empty());
    assert_eq!(mock.calls(), 1);
}

#[tokio::test]
async fn test_head_miss_fills_cache() {
    let mock = alpine();
    let (app, cache) = test_mirror(&mock);

    let response = send(&app, Method::HEAD, ALPINE).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body(response).await.is_empty());

    let response = send(&app, Method::GET, ALPINE).await;
    assert_eq!(&body(response).await[..], ALPINE_BODY);

    assert_eq!(mock.calls(), 1);
    assert!(cache.lookup(&ManifestKey::new("library/alpine", "latest")).is_some());
}

#[tokio::test]
async fn test_malformed_paths_never_reach_upstream() {
    let mock = alpine();
    let (app, cache) = test_mirror(&mock);

    for path in [
        "/v2/library/alpine/manifests/",
        "/v2/manifests/latest",
        "/v2/library/alpine/blobs/sha256:c0ffee",
        "/v2/library//alpine/manifests/latest",
        "/v2/library/alpine/manifests/latest/extra",
        "/v3/library/alpine/manifests/latest",
    ] {
        let response = send(&app, Method::GET, path).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
    }

    assert_eq!(mock.calls(), 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_unsupported_methods() {
    let mock = alpine();
    let (app, cache) = test_mirror(&mock);

    for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
        let response = send(&app, method.clone(), ALPINE).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method}");
        assert_eq!(response.headers().get(header::ALLOW).unwrap(), "GET, HEAD");

        let body: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(body["errors"][0]["code"], "UNSUPPORTED");
    }

    assert_eq!(mock.calls(), 0);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_path_checked_before_method() {
    let mock = alpine();
    let (app, _) = test_mirror(&mock);

    let response = send(&app, Method::DELETE, "/v2/library/alpine/manifests/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(mock.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_coalesce() {
    let mock = alpine();
    let (app, cache) = test_mirror(&mock);

    mock.hold();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let response = send(&app, Method::GET, ALPINE).await;
            (response.status(), body(response).await)
        }));
    }

    // Let every request reach the cache before upstream answers.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.inflight(), 1);
    mock.release();

    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], ALPINE_BODY);
    }

    assert_eq!(mock.calls(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.inflight(), 0);
}

#[tokio::test]
async fn test_upstream_errors_pass_through() {
    for status in [
        StatusCode::NOT_FOUND,
        StatusCode::UNAUTHORIZED,
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::SERVICE_UNAVAILABLE,
    ] {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let error = format!(r#"{{"errors":[{{"code":"X","message":"{status}"}}]}}"#);
        let mock = MockUpstream::new().respond(ALPINE, status, headers, error.clone());
        let (app, cache) = test_mirror(&mock);

        let response = send(&app, Method::GET, ALPINE).await;
        assert_eq!(response.status(), status);
        assert_eq!(&body(response).await[..], error.as_bytes());
        assert!(cache.is_empty());

        let response = send(&app, Method::GET, ALPINE).await;
        assert_eq!(response.status(), status);
        assert_eq!(mock.calls(), 2, "{status} must not be cached");
    }
}

#[tokio::test]
async fn test_unknown_manifest_is_not_cached() {
    let mock = MockUpstream::new();
    let (app, cache) = test_mirror(&mock);

    let response = send(&app, Method::GET, ALPINE).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(body["errors"][0]["code"], "MANIFEST_UNKNOWN");

    let response = send(&app, Method::HEAD, ALPINE).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(mock.calls(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_missing_digest_is_not_cached() {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(ALPINE_TYPE));
    let mock = MockUpstream::new().respond(ALPINE, StatusCode::OK, headers, ALPINE_BODY);
    let (app, cache) = test_mirror(&mock);

    for _ in 0..2 {
        let response = send(&app, Method::GET, ALPINE).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body(response).await[..], ALPINE_BODY);
    }

    assert_eq!(mock.calls(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_upstream_timeout() {
    let mock = MockUpstream::new().timeout(ALPINE);
    let (app, cache) = test_mirror(&mock);

    let response = send(&app, Method::GET, ALPINE).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
    assert_eq!(body["errors"][0]["code"], "UNKNOWN");

    assert_eq!(mock.calls(), 1, "timeouts are not retried");
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_upstream_unreachable() {
    let options = UpstreamOptions {
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
        retries: 0,
        ..UpstreamOptions::default()
    };
    let upstream = Upstream::new("http://127.0.0.1:1", &options).unwrap();
    let app = MirrorBuilder::new(upstream).build();

    let response = send(&app, Method::GET, ALPINE).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_real_upstream_over_http() {
    let registry = axum::Router::new().route(
        "/v2/library/alpine/manifests/latest",
        axum::routing::get(|| async {
            (
                [
                    (header::CONTENT_TYPE, ALPINE_TYPE),
                    (
                        header::HeaderName::from_static("docker-content-digest"),
                        "sha256:c0ffee",
                    ),
                ],
                ALPINE_BODY,
            )
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, registry).await });

    let upstream = Upstream::new(&format!("http://{addr}"), &UpstreamOptions::default()).unwrap();
    let cache = ManifestCache::new();
    let app = MirrorBuilder::new(upstream).cache(cache.clone()).build();

    let response = send(&app, Method::GET, ALPINE).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("docker-content-digest").unwrap(),
        "sha256:c0ffee"
    );
    assert_eq!(&body(response).await[..], ALPINE_BODY);
    assert_eq!(cache.len(), 1);

    let response = send(&app, Method::GET, "/v2/library/busybox/manifests/latest").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(cache.len(), 1);
}
