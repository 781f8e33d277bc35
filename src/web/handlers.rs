use std::{convert::Infallible, sync::Arc};

use anyhow::Context;
use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Redirect, Response},
};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{info, warn};

use crate::{
    api::client::UserSession,
    app_state::{AppState, KioskStatus, Redemption},
    camera::{capture::CAPTURE_MIME, discovery, traits::CameraBackend},
    core::{
        errors::{AppError, Fallback, PipelineError},
        state::CameraStatus,
    },
    detection::overlay::{OverlayBox, project},
    location::Coordinates,
    scan::session::{ScanEvent, ScanStatus},
    upload::coordinator::{StagedCapture, UploadResult},
};

const STREAM_BOUNDARY: &str = "cashupframe";

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    lat: Option<f64>,
    lng: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct OverlayQuery {
    width: f64,
    height: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayResponse {
    boxes: Vec<OverlayBox>,
    count: usize,
    max_confidence: f64,
    message: String,
    preview_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ManualCodeRequest {
    code: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanLastResponse {
    last_scanned: Option<ScanEvent>,
    last_redemption: Option<Redemption>,
}

fn camera_error(err: PipelineError) -> AppError {
    AppError::pipeline(err, Fallback::FileUpload)
}

fn scan_error(err: PipelineError) -> AppError {
    AppError::pipeline(err, Fallback::ManualCode)
}

fn no_store(content_type: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers
}

pub async fn root() -> Redirect {
    Redirect::to("/static/index.html")
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn status<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<KioskStatus> {
    Json(state.status().await)
}

pub async fn cameras() -> Result<Json<Vec<discovery::CameraProbeInfo>>, AppError> {
    let list = discovery::probe_cameras()
        .await
        .context("camera probe failed")?;
    Ok(Json(list))
}

pub async fn camera_start<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<CameraStatus>, AppError> {
    let status = state.start_camera().await.map_err(camera_error)?;
    info!("camera start requested");
    Ok(Json(status))
}

pub async fn camera_stop<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<CameraStatus> {
    info!("camera stop requested");
    Json(state.stop_camera().await)
}

/// MJPEG preview of the open camera stream. Ends when the track ends.
pub async fn camera_stream<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Response, AppError> {
    let frames = state.preview_frames().await.ok_or_else(|| {
        AppError::new(StatusCode::CONFLICT, "camera is not started")
    })?;

    let parts = WatchStream::new(frames)
        .filter_map(|frame| frame)
        .map(|frame| {
            let mut part = BytesMut::with_capacity(frame.len() + 96);
            part.put_slice(
                format!(
                    "--{STREAM_BOUNDARY}\r\nContent-Type: {CAPTURE_MIME}\r\nContent-Length: {}\r\n\r\n",
                    frame.len()
                )
                .as_bytes(),
            );
            part.put_slice(&frame);
            part.put_slice(b"\r\n");
            Ok::<Bytes, Infallible>(part.freeze())
        });

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&format!(
        "multipart/x-mixed-replace; boundary={STREAM_BOUNDARY}"
    ))
    .map_err(|err| AppError::internal(format!("invalid stream header: {err}")))?;
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((StatusCode::OK, headers, Body::from_stream(parts)).into_response())
}

pub async fn photos_capture<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<StagedCapture>, AppError> {
    let staged = state.capture().await.map_err(camera_error)?;
    Ok(Json(staged))
}

/// File-picker path: the raw image file is the request body.
pub async fn photos_upload<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    body: Bytes,
) -> Result<Json<StagedCapture>, AppError> {
    if body.is_empty() {
        return Err(AppError::new(StatusCode::BAD_REQUEST, "image body is empty"));
    }
    let staged = state
        .stage_upload(body)
        .await
        .map_err(|err| AppError::pipeline(err, Fallback::FileUpload))?;
    Ok(Json(staged))
}

pub async fn photos_submit<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Query(query): Query<SubmitQuery>,
) -> Result<Json<UploadResult>, AppError> {
    let coords = match (query.lat, query.lng) {
        (Some(latitude), Some(longitude)) => Some(Coordinates {
            latitude,
            longitude,
        }),
        _ => None,
    };
    let result = state
        .submit_photo(coords)
        .await
        .ok_or_else(|| AppError::new(StatusCode::UNAUTHORIZED, "no user session"))?
        .map_err(camera_error)?;
    Ok(Json(result))
}

pub async fn photos_overlay<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Query(query): Query<OverlayQuery>,
) -> Result<Json<OverlayResponse>, AppError> {
    let valid = |v: f64| v.is_finite() && v > 0.0;
    if !valid(query.width) || !valid(query.height) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "width and height must be positive",
        ));
    }
    let result = state
        .last_result()
        .await
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "no scored photo yet"))?;

    Ok(Json(OverlayResponse {
        boxes: project(&result.detections.detections, query.width, query.height),
        count: result.count,
        max_confidence: result.max_confidence,
        message: result.message,
        preview_url: result.preview_url,
    }))
}

pub async fn photos_annotated<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Response, AppError> {
    let result = state
        .last_result()
        .await
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "no scored photo yet"))?;
    let quality = state.config.jpeg_quality;
    let jpeg = tokio::task::spawn_blocking(move || result.annotated(quality))
        .await
        .map_err(|err| AppError::internal(format!("annotation task failed: {err}")))?
        .map_err(|err| {
            warn!("annotating photo failed: {err}");
            AppError::internal(err.to_string())
        })?;

    Ok((StatusCode::OK, no_store(CAPTURE_MIME), jpeg).into_response())
}

pub async fn scan_start<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Result<Json<ScanStatus>, AppError> {
    let status = state.start_scan().await.map_err(scan_error)?;
    info!("code scanning requested");
    Ok(Json(status))
}

pub async fn scan_stop<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<ScanStatus> {
    Json(state.stop_scan().await)
}

pub async fn scan_pause<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<ScanStatus> {
    Json(state.pause_scan().await)
}

pub async fn scan_resume<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<ScanStatus> {
    Json(state.resume_scan().await)
}

pub async fn scan_manual<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Json(payload): Json<ManualCodeRequest>,
) -> Result<(StatusCode, Json<ScanEvent>), AppError> {
    let event = state
        .submit_manual_code(&payload.code)
        .await
        .ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "bin code is empty"))?;
    info!("manual bin code {} entered", event.code);
    Ok((StatusCode::ACCEPTED, Json(event)))
}

pub async fn scan_last<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> Json<ScanLastResponse> {
    let status = state.status().await;
    Json(ScanLastResponse {
        last_scanned: status.scan.last_scanned,
        last_redemption: status.last_redemption,
    })
}

pub async fn put_session<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
    Json(session): Json<UserSession>,
) -> Result<Json<UserSession>, AppError> {
    if session.user_id.trim().is_empty() || session.festival_id.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "userId and festivalId are required",
        ));
    }
    state.set_session(Some(session.clone())).await;
    Ok(Json(session))
}

pub async fn delete_session<B: CameraBackend + 'static>(
    State(state): State<Arc<AppState<B>>>,
) -> StatusCode {
    state.set_session(None).await;
    StatusCode::NO_CONTENT
}
