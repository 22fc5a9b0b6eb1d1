use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vigil_core::{EuclideanMatcher, FramePipeline, Gallery, ImageFrameDecoder};

mod config;
mod dbus_interface;
mod embedder;
mod service;
mod session;
mod store;
#[cfg(test)]
mod testing;

use config::Config;
use dbus_interface::VigilInterface;
use embedder::CommandEmbedder;
use service::VigilService;
use store::GalleryStore;

const BUS_NAME: &str = "org.freedesktop.Vigil1";
const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::from_env();
    config
        .liveness
        .validate()
        .context("invalid liveness configuration")?;

    let store = GalleryStore::open(&config.db_path, config.embedding_dim)
        .await
        .with_context(|| format!("failed to open gallery at {}", config.db_path.display()))?;
    let entries = store.load_all().await.context("failed to load gallery")?;
    let gallery = Arc::new(Gallery::from_entries(config.embedding_dim, entries)?);
    tracing::info!(
        path = %config.db_path.display(),
        entries = gallery.len(),
        dim = config.embedding_dim,
        "gallery loaded"
    );

    let embedder = CommandEmbedder::spawn(&config.embedder_cmd, config.embedder_timeout())
        .with_context(|| format!("failed to start embedder `{}`", config.embedder_cmd))?;

    let pipeline = FramePipeline::new(
        gallery,
        EuclideanMatcher::new(config.match_tolerance),
        Arc::new(ImageFrameDecoder),
        Arc::new(embedder),
    );

    let service = Arc::new(VigilService::new(
        pipeline,
        store,
        config.liveness.clone(),
        config.max_sessions,
        config.frame_timeout(),
        config.match_tolerance,
    ));

    let builder = if config.session_bus {
        tracing::warn!("serving on the session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VigilInterface { service })?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus_name = BUS_NAME, "vigild ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    Ok(())
}
