use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::services::ServeDir;

use crate::{app_state::AppState, camera::traits::CameraBackend};

use super::handlers;

pub fn build_router<B: CameraBackend + 'static>(state: Arc<AppState<B>>) -> Router {
    let camera_routes = Router::new()
        .route("/start", post(handlers::camera_start::<B>))
        .route("/stop", post(handlers::camera_stop::<B>))
        .route("/stream", get(handlers::camera_stream::<B>));

    let photo_routes = Router::new()
        .route("/capture", post(handlers::photos_capture::<B>))
        .route("/upload", post(handlers::photos_upload::<B>))
        .route("/submit", post(handlers::photos_submit::<B>))
        .route("/overlay", get(handlers::photos_overlay::<B>))
        .route("/annotated", get(handlers::photos_annotated::<B>));

    let scan_routes = Router::new()
        .route("/start", post(handlers::scan_start::<B>))
        .route("/stop", post(handlers::scan_stop::<B>))
        .route("/pause", post(handlers::scan_pause::<B>))
        .route("/resume", post(handlers::scan_resume::<B>))
        .route("/manual", post(handlers::scan_manual::<B>))
        .route("/last", get(handlers::scan_last::<B>));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status::<B>))
        .route("/cameras", get(handlers::cameras))
        .route(
            "/session",
            put(handlers::put_session::<B>).delete(handlers::delete_session::<B>),
        )
        .nest("/camera", camera_routes)
        .nest("/photos", photo_routes)
        .nest("/scan", scan_routes)
        .nest_service("/static", ServeDir::new("static"))
        .with_state(state)
}
