use anyhow::{Context, Result};
use presence_core::{CosineMatcher, OnnxExtractor};
use presence_store::Store;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod service;

use config::{BusKind, Config};
use dbus_interface::{PresenceInterface, BUS_NAME, OBJECT_PATH};
use service::AttendanceService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("opening database {}", config.db_path.display()))?;

    let extractor = OnnxExtractor::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(extractor, config.engine_queue)
        .context("spawning engine thread")?;
    tracing::info!(model = engine.model_version(), "models loaded");

    let matcher = CosineMatcher::new(config.distance_threshold);
    tracing::info!(threshold = matcher.threshold(), "cosine matcher ready");
    let service = AttendanceService::new(store, engine, matcher, config.extract_timeout());

    let stale = service.check_gallery_model().await?;
    if stale > 0 {
        tracing::warn!(
            stale,
            model = service.model_version(),
            "enrolled identities from another embedding model will never match; re-enroll them"
        );
    }

    let iface = PresenceInterface::new(Arc::new(service));
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
