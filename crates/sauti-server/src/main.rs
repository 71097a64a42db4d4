//! Sauti Server - HTTP control surface for resilient speech streaming

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod error;
mod state;

use sauti_core::StreamConfig;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sauti_server=debug,sauti_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Sauti streaming server");

    // Load configuration: sauti.toml if present, overridden by SAUTI__* env
    // vars (e.g. SAUTI__RETRY__MAX_ATTEMPTS=5).
    let config: StreamConfig = config::Config::builder()
        .add_source(config::File::with_name("sauti").required(false))
        .add_source(config::Environment::with_prefix("SAUTI").separator("__"))
        .build()?
        .try_deserialize()?;
    info!(
        endpoint = %config.synthesis.endpoint,
        output_dir = %config.audio.output_dir.display(),
        "configuration loaded"
    );

    let addr = config.server.bind_addr();
    let state = AppState::new(config);

    // Build router
    let app = api::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
