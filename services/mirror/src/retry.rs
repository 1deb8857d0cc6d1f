//! Bounded retries for upstream transport failures

use http::{Request, Response};
use hyperdriver::Body;
use tower::retry::Policy;

/// A policy for retrying requests which failed to reach upstream, a fixed number of times.
///
/// Only transport errors are retried. Any HTTP response, including server errors, belongs to
/// the client and is returned as-is. Timeouts are not retried either, since the client has
/// already waited the full timeout once.
#[derive(Debug, Clone)]
pub struct Attempts(usize);

impl Attempts {
    /// Create a new attempts policy
    pub fn new(n: usize) -> Self {
        Self(n)
    }

    /// Retries remaining
    pub fn remaining(&self) -> usize {
        self.0
    }
}

impl Default for Attempts {
    fn default() -> Self {
        Self(2)
    }
}

impl From<usize> for Attempts {
    fn from(n: usize) -> Self {
        Self(n)
    }
}

impl Policy<Request<Body>, Response<Body>, hyperdriver::client::Error> for Attempts {
    type Future = std::future::Ready<()>;

    fn retry(
        &mut self,
        req: &mut Request<Body>,
        result: &mut Result<Response<Body>, hyperdriver::client::Error>,
    ) -> Option<Self::Future> {
        match result {
            Ok(_) => None,
            Err(hyperdriver::client::Error::RequestTimeout) => None,
            Err(error) if self.0 > 0 => {
                tracing::debug!("retrying request to {} due to error: {error}", req.uri());
                self.0 -= 1;
                Some(std::future::ready(()))
            }
            Err(_) => None,
        }
    }

    fn clone_request(&mut self, req: &Request<Body>) -> Option<Request<Body>> {
        try_clone_request(req)
    }
}

fn try_clone_request(req: &Request<Body>) -> Option<Request<Body>> {
    let body = req.body().try_clone()?;

    let mut next = Request::builder()
        .method(req.method().clone())
        .uri(req.uri().clone())
        .version(req.version())
        .body(body)
        .ok()?;

    *next.extensions_mut() = req.extensions().clone();
    *next.headers_mut() = req.headers().clone();

    Some(next)
}
