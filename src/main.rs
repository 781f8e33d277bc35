mod api;
mod app_state;
mod camera;
mod config;
mod core;
mod detection;
mod location;
mod scan;
mod upload;
mod web;

use std::sync::Arc;

use api::client::CashUpApi;
use app_state::{AppState, Collaborators};
use camera::ffmpeg_backend::FfmpegBackend;
use config::AppConfig;
use location::FixedLocation;
use scan::decoder::QrDecoder;
use tracing::{error, info, warn};
use tracing_appender::rolling;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    if std::env::args().any(|arg| arg == "--probe-cameras") {
        let cameras = camera::discovery::probe_cameras().await?;
        println!("{}", serde_json::to_string_pretty(&cameras)?);
        return Ok(());
    }

    tokio::fs::create_dir_all("logs").await?;
    let file_appender = rolling::daily("logs", "cashup-kiosk.log");
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = AppConfig::from_env()?;
    tokio::fs::create_dir_all("static").await?;

    let api = Arc::new(CashUpApi::new(config.api_base_url.clone(), config.api_timeout)?);
    let collaborators = Collaborators {
        decoder: Arc::new(QrDecoder::default()),
        scoring: api.clone(),
        redemption: api,
        location: Arc::new(FixedLocation::new(config.kiosk_coords)),
    };
    let state = AppState::new(config.clone(), Arc::new(FfmpegBackend::new()), collaborators);
    let app = web::routes::build_router(state.clone());

    if state.session().await.is_none() {
        warn!("no USER_ID/FESTIVAL_ID configured; uploads wait for PUT /session");
    }
    if !state.status().await.secure_context {
        warn!(
            "{} is not a secure origin; camera paths are disabled",
            config.public_origin
        );
    }

    info!("{} listening on {}", config.app_name, config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("failed to listen for shutdown signal: {err}");
            }
            shutdown_state.teardown().await;
        })
        .await?;

    Ok(())
}
