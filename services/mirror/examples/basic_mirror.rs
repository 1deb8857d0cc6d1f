//! Basic manifest mirror example
//!
//! Run with: cargo run -p mirror --example basic_mirror

use mirror::{MirrorBuilder, Upstream, UpstreamOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Mirror Docker Hub
    let upstream = Upstream::new("https://registry-1.docker.io", &UpstreamOptions::default())?;

    // Build the mirror service
    let app = MirrorBuilder::new(upstream).build();

    // Bind to address
    let addr = "127.0.0.1:5000";
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Manifest mirror listening on http://{}", addr);
    tracing::info!(
        "Try: curl -I http://{}/v2/library/alpine/manifests/latest",
        addr
    );

    // Serve the mirror
    axum::serve(listener, app).await?;

    Ok(())
}
