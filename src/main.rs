use axum::Router;
use tokio::net::TcpListener;

use anyhow::anyhow;

use orato::{ServerConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // Load configuration
    let config = ServerConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    let address = config.address();
    println!("Starting server on {address}");

    // Create application state
    let app_state = AppState::new(config);

    // Reclaim idle sessions for the lifetime of the process
    tokio::spawn(app_state.registry.clone().run_sweeper());

    // Versioned API: session lifecycle + websocket attach
    let api_routes = routes::api::create_api_router().merge(routes::ws::create_ws_router());

    // Public health check route at the root
    let public_routes =
        Router::new().route("/", axum::routing::get(orato::handlers::api::health_check));

    // Combine all routes
    let app = public_routes
        .nest("/api/v1", api_routes)
        .with_state(app_state);

    // Create listener
    let listener = TcpListener::bind(&address).await?;

    println!("Server listening on {address}");

    // Start server
    axum::serve(listener, app).await?;

    Ok(())
}
