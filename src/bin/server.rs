//! Tabsync Relay Server
//!
//! Relays sync messages between the clients of each topic and keeps a
//! durable server replica per topic so new clients can bootstrap from it.
//!
//! # Configuration
//!
//! Uses the same config file and environment variables as the CLI:
//! - `TABSYNC_PORT`: Port to listen on (default: 8048)
//! - `TABSYNC_DATA_DIR`: Data directory; topics live under `<DATA_DIR>/topics`
//! - `TABSYNC_REQUEST_TIMEOUT`: Server replica request timeout in seconds (default: 1)
//! - `TABSYNC_CONFIG`: Path to config file (default: ~/.config/tabsync/config.yaml)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint
//! - `GET /{topic}`: WebSocket upgrade joining a topic

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tabsync::config::Config;
use tabsync::server::{router, LoggingHooks, RelayHub, RelayOptions, TopicStorage};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabsync=info,tabsync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load(None) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    // Ensure topics directory exists
    let topics_dir = config.topics_dir();
    if let Err(e) = std::fs::create_dir_all(&topics_dir) {
        tracing::error!("Failed to create data directory: {}", e);
        std::process::exit(1);
    }
    tracing::info!("Data directory: {}", topics_dir.display());
    if let Some(path) = &config.config_file {
        tracing::info!("Config file: {}", path.display());
    }

    let options = RelayOptions {
        request_timeout: config.request_timeout(Duration::from_secs(1)),
    };
    let hub = RelayHub::new(TopicStorage::new(topics_dir), Arc::new(LoggingHooks), options);
    let app = router(hub).layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port.value));
    tracing::info!("Starting server on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
