//! Mirror configuration

use std::net::SocketAddr;

use serde::Deserialize;

use crate::upstream::UpstreamOptions;

/// Configuration for the upstream registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream registry, e.g. `https://registry-1.docker.io`
    pub url: String,

    /// Connection tuning
    #[serde(flatten)]
    pub options: UpstreamOptions,
}

impl UpstreamConfig {
    /// Configure an upstream with default options.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: UpstreamOptions::default(),
        }
    }
}

/// Configuration for a mirror server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MirrorConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// The upstream registry
    pub upstream: UpstreamConfig,
}

impl MirrorConfig {
    /// Mirror `upstream`, listening on the default address.
    pub fn new(upstream: UpstreamConfig) -> Self {
        Self {
            listen: default_listen(),
            upstream,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

/// Deserialize a [`Duration`](std::time::Duration) from a whole number of seconds.
pub(crate) mod seconds {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::upstream::MANIFEST_MEDIA_TYPES;

    #[test]
    fn test_defaults() {
        let config: MirrorConfig = serde_json::from_value(json!({
            "upstream": { "url": "https://registry-1.docker.io" }
        }))
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.upstream.url, "https://registry-1.docker.io");
        assert_eq!(config.upstream.options, UpstreamOptions::default());
        assert_eq!(config.upstream.options.accept.len(), MANIFEST_MEDIA_TYPES.len());
        assert_eq!(config.upstream.options.retries, 2);
    }

    #[test]
    fn test_overrides() {
        let config: MirrorConfig = serde_json::from_value(json!({
            "listen": "0.0.0.0:8080",
            "upstream": {
                "url": "http://localhost:5001",
                "timeout": 5,
                "connect_timeout": 1,
                "retries": 0,
                "accept": ["application/vnd.oci.image.manifest.v1+json"]
            }
        }))
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        let options = &config.upstream.options;
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert_eq!(options.connect_timeout, Duration::from_secs(1));
        assert_eq!(options.retries, 0);
        assert_eq!(options.accept, ["application/vnd.oci.image.manifest.v1+json"]);
    }

    #[test]
    fn test_upstream_is_required() {
        assert!(serde_json::from_value::<MirrorConfig>(json!({})).is_err());
    }
}
