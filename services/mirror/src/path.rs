//! Manifest request paths

use std::fmt;

use crate::error::{MirrorError, MirrorResult};

const PREFIX: &str = "/v2/";
const SEPARATOR: &str = "/manifests/";

/// Identifies a manifest: a repository and a tag or digest within it.
///
/// Keys are compared exactly as they appeared in the request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    repository: String,
    reference: String,
}

impl ManifestKey {
    /// Create a key from its parts, without validation.
    pub fn new(repository: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            reference: reference.into(),
        }
    }

    /// Repository name, e.g. `library/alpine`
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag or digest, e.g. `latest` or `sha256:...`
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// The request path for this manifest.
    pub fn path(&self) -> String {
        format!("{PREFIX}{}{SEPARATOR}{}", self.repository, self.reference)
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.reference)
    }
}

/// Parse a path of the form `/v2/<repository>/manifests/<reference>`.
///
/// The repository is one or more non-empty `/`-separated segments, the reference a single
/// non-empty segment. If the repository itself contains a `manifests` segment, the last
/// `/manifests/` separates the reference.
pub fn parse_manifest_path(path: &str) -> MirrorResult<ManifestKey> {
    let invalid = || MirrorError::InvalidPath(path.to_owned());

    let rest = path.strip_prefix(PREFIX).ok_or_else(invalid)?;
    let (repository, reference) = rest.rsplit_once(SEPARATOR).ok_or_else(invalid)?;

    if reference.is_empty() || reference.contains('/') {
        return Err(invalid());
    }

    if repository.split('/').any(str::is_empty) {
        return Err(invalid());
    }

    Ok(ManifestKey::new(repository, reference))
}
