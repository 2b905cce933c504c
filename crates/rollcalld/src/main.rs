use anyhow::{Context, Result};
use rollcall_store::{Database, TemplateCipher};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod service;
mod socket_extractor;
mod worker;

use config::{BusKind, Config};
use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};
use service::{AttendanceService, ServiceSettings};
use socket_extractor::SocketExtractor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env().context("failed to load configuration")?;
    let settings = ServiceSettings::from_config(&config).context("invalid configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        extractor = %config.extractor_socket.display(),
        embedding_dim = settings.embedding_dim,
        threshold = settings.policy.threshold,
        margin = settings.policy.margin,
        liveness_min_score = settings.liveness.min_score,
        "configuration loaded"
    );

    if let Some(dir) = config.db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let db = Database::open(&config.db_path).context("failed to open database")?;
    let cipher = TemplateCipher::load_or_create(&config.template_key_path)
        .context("failed to load template key")?;

    let extractor = SocketExtractor::new(&config.extractor_socket, config.extractor_timeout());
    let handle = worker::spawn_worker(Box::new(extractor), config.extractor_timeout())?;

    let service = AttendanceService::new(db, cipher, handle, settings)
        .context("failed to load identities and templates")?;
    let status = service.status()?;
    tracing::info!(
        identities = status.identities,
        templates = status.templates,
        "stores loaded"
    );

    let interface = AttendanceInterface::new(Arc::new(service));
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, interface)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
