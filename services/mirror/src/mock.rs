//! An in-process stand-in for an upstream registry.
//!
//! [`MockUpstream`] is a tower service which can be handed to
//! [`Upstream::with_service`](crate::Upstream::with_service). It records every request it
//! receives, so tests can assert how often (and how) upstream was contacted.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::upstream::DOCKER_CONTENT_DIGEST;

#[derive(Debug, Clone)]
enum MockReply {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Timeout,
}

/// A request received by the mock upstream.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
}

impl RecordedRequest {
    /// Request method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[derive(Debug, Default)]
struct MockState {
    replies: HashMap<String, MockReply>,
    requests: Vec<RecordedRequest>,
    gate: Option<Arc<Semaphore>>,
}

/// Mock upstream registry.
///
/// Paths without a configured reply answer `404` with an OCI `MANIFEST_UNKNOWN` error.
#[derive(Debug, Default, Clone)]
pub struct MockUpstream {
    state: Arc<Mutex<MockState>>,
}

impl MockUpstream {
    /// Create a mock with no configured replies
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to `path` with the given status, headers and body.
    pub fn respond(
        self,
        path: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        self.state.lock().replies.insert(
            path.to_owned(),
            MockReply::Respond {
                status,
                headers,
                body: body.into(),
            },
        );
        self
    }

    /// Reply to `path` with a manifest.
    pub fn manifest(
        self,
        path: &str,
        content_type: &'static str,
        digest: &'static str,
        body: impl Into<Bytes>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        headers.insert(DOCKER_CONTENT_DIGEST, HeaderValue::from_static(digest));
        self.respond(path, StatusCode::OK, headers, body)
    }

    /// Fail requests to `path` with a request timeout.
    pub fn timeout(self, path: &str) -> Self {
        self.state
            .lock()
            .replies
            .insert(path.to_owned(), MockReply::Timeout);
        self
    }

    /// Hold every reply until [`MockUpstream::release`] is called.
    pub fn hold(&self) {
        self.state.lock().gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let held replies (and all future ones) through.
    pub fn release(&self) {
        if let Some(gate) = self.state.lock().gate.take() {
            gate.close();
        }
    }

    /// Number of requests received so far
    pub fn calls(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockUpstream {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();

        let (reply, gate) = {
            let mut state = self.state.lock();
            state.requests.push(RecordedRequest {
                method: method.clone(),
                path: path.clone(),
                headers: req.headers().clone(),
            });
            (state.replies.get(&path).cloned(), state.gate.clone())
        };

        Box::pin(async move {
            if let Some(gate) = gate {
                // Closing the semaphore is the release signal.
                let _ = gate.acquire().await;
            }

            let (status, headers, body) = match reply {
                Some(MockReply::Respond {
                    status,
                    headers,
                    body,
                }) => (status, headers, body),
                Some(MockReply::Timeout) => {
                    return Err(hyperdriver::client::Error::RequestTimeout);
                }
                None => {
                    let mut headers = HeaderMap::new();
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                    let body = serde_json::json!({
                        "errors": [{"code": "MANIFEST_UNKNOWN", "message": "manifest unknown"}]
                    });
                    (
                        StatusCode::NOT_FOUND,
                        headers,
                        Bytes::from(body.to_string()),
                    )
                }
            };

            let body = if method == Method::HEAD {
                hyperdriver::Body::empty()
            } else {
                hyperdriver::Body::from(body)
            };

            let mut response = http::Response::new(body);
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        })
    }
}
