mod config;
mod db;
mod gateway;
mod routes;
mod state;
mod ws;

use std::sync::Arc;
use tokio::net::TcpListener;

use config::{Config, generate_config_template};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "huddle_relay=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "huddle_relay=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("Huddle relay v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize the SQLite message store and user directory
    let db = db::init_db(&config.data_dir)?;

    // Build application state. The registry and gateway are created here
    // and injected everywhere — connection tasks never reach for globals.
    let app_state = state::AppState {
        db: db.clone(),
        connections: Arc::new(ws::registry::ConnectionRegistry::new()),
        gateway: Arc::new(gateway::SqliteGateway::new(db)),
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
