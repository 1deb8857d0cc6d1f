//! Request methods accepted for manifests

use axum::http::{HeaderValue, Method};

use crate::error::{MirrorError, MirrorResult};

/// Value of the `Allow` header sent with `405 Method Not Allowed`.
pub const ALLOWED_METHODS: &str = "GET, HEAD";

/// `Allow` header listing the supported methods, always in the same order.
pub fn allow_header() -> HeaderValue {
    HeaderValue::from_static(ALLOWED_METHODS)
}

/// The read-only methods a pull-only mirror serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestMethod {
    /// Fetch the manifest with its body
    Get,

    /// Fetch only the manifest headers
    Head,
}

impl ManifestMethod {
    /// Accept `GET` and `HEAD`; anything else is not supported.
    pub fn from_method(method: &Method) -> MirrorResult<Self> {
        match *method {
            Method::GET => Ok(ManifestMethod::Get),
            Method::HEAD => Ok(ManifestMethod::Head),
            _ => Err(MirrorError::MethodNotSupported(method.clone())),
        }
    }

    /// The equivalent HTTP method
    pub fn as_method(&self) -> Method {
        match self {
            ManifestMethod::Get => Method::GET,
            ManifestMethod::Head => Method::HEAD,
        }
    }

    /// Whether responses to this method carry a body
    pub fn includes_body(&self) -> bool {
        matches!(self, ManifestMethod::Get)
    }
}

impl TryFrom<&Method> for ManifestMethod {
    type Error = MirrorError;

    fn try_from(method: &Method) -> Result<Self, Self::Error> {
        Self::from_method(method)
    }
}
