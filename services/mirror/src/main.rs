//! mirror-server: serve a manifest mirror for one upstream registry

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use mirror::{MirrorBuilder, MirrorConfig, UpstreamConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mirror-server", version, about = "Pull-only caching mirror for registry manifests", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, env = "MIRROR_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration file
    #[arg(long, env = "MIRROR_LISTEN")]
    listen: Option<SocketAddr>,

    /// Upstream registry URL, e.g. <https://registry-1.docker.io>
    #[arg(long, env = "MIRROR_UPSTREAM")]
    upstream: Option<String>,
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("no upstream registry configured, pass --upstream or a configuration file")]
    MissingUpstream,
}

fn parse_config(text: &str) -> Result<MirrorConfig, toml_edit::de::Error> {
    toml_edit::de::from_str(text)
}

impl Cli {
    fn load(&self) -> Result<MirrorConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                parse_config(&text).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => {
                let url = self.upstream.clone().ok_or(ConfigError::MissingUpstream)?;
                MirrorConfig::new(UpstreamConfig::new(url))
            }
        };

        if let Some(url) = &self.upstream {
            config.upstream.url = url.clone();
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        Ok(config)
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("unable to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().load()?;
    let app = MirrorBuilder::from_config(&config)?.build();

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(
        upstream = %config.upstream.url,
        "manifest mirror listening on http://{}",
        config.listen
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
