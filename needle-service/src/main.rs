use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod chat;
mod config;
mod db;
mod error;
mod gateway;
mod service;
mod staging;

use crate::chat::ChatClient;
use crate::config::{RuntimeConfig, load_static_config};
use crate::db::Database;
use crate::gateway::{HttpIndexingGateway, IndexingGateway};
use crate::service::NeedleService;
use crate::staging::FileStaging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("Starting Needle service v{}", env!("CARGO_PKG_VERSION"));

    // Static configuration first: it says where the database lives
    let static_config = load_static_config()?;

    info!(
        host = %static_config.server.host,
        port = static_config.server.port,
        endpoint = %static_config.gateway.endpoint,
        "Static configuration loaded"
    );

    std::fs::create_dir_all(&static_config.storage.data_dir)?;

    let db_path = static_config.storage.data_dir.join("needle.db");
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    // Static + dynamic with DB overrides
    let runtime_config = Arc::new(RuntimeConfig::load(static_config, &db)?);
    info!("Runtime configuration loaded with DB settings");

    let static_config = &runtime_config.static_config;
    let gateway: Arc<dyn IndexingGateway> =
        Arc::new(HttpIndexingGateway::new(static_config.gateway.clone())?);
    let chat = Arc::new(ChatClient::new(static_config.chat.clone())?);
    let staging = Arc::new(FileStaging::new(static_config.storage.staging_dir()));

    let service = Arc::new(NeedleService::new(
        runtime_config.clone(),
        db,
        gateway,
        staging,
        chat,
    ));

    if let Err(e) = service.recover_interrupted_tasks() {
        warn!(error = %e, "Interrupted task recovery failed");
    }

    let app = api::router(service);

    let addr = format!(
        "{}:{}",
        runtime_config.static_config.server.host, runtime_config.static_config.server.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("needle_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
