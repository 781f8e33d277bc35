use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use image::{ExtendedColorType, codecs::jpeg::JpegEncoder};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

use crate::{
    api::client::{PhotoSubmission, ScoringEndpoint, UserSession},
    camera::{
        capture::{CapturedImage, FrameCapturer},
        session::{DeviceCameraSession, torn_down},
        traits::{CameraBackend, CameraConstraints},
    },
    core::errors::PipelineError,
    detection::{
        normalize::{DetectionSet, normalize, parse_yolo_raw},
        overlay::{BOX_COLOR, draw_boxes, project},
    },
    location::{Coordinates, LocationProvider, locate},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub photo_id: Option<i64>,
    pub preview_url: Option<String>,
    pub message: String,
    pub source_width: u32,
    pub source_height: u32,
    pub detections: DetectionSet,
    pub count: usize,
    pub max_confidence: f64,
    pub has_trash: Option<bool>,
    pub trash_count: Option<u32>,
    pub server_max_confidence: Option<f64>,
    #[serde(skip)]
    pub image: CapturedImage,
}

impl UploadResult {
    /// The scored still as JPEG with the detection boxes burned in.
    pub fn annotated(&self, quality: u8) -> Result<Vec<u8>, PipelineError> {
        let mut rgb = self.image.to_rgb()?;
        let (width, height) = rgb.dimensions();
        let boxes = project(
            &self.detections.detections,
            f64::from(width),
            f64::from(height),
        );
        let thickness = (width.min(height) / 200).max(2);
        draw_boxes(&mut rgb, &boxes, BOX_COLOR, thickness);

        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
            .map_err(|err| PipelineError::CaptureFailed(format!("jpeg encode failed: {err}")))?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedCapture {
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub submitting: bool,
    pub staged: Option<StagedCapture>,
    pub last_result: Option<UploadResult>,
}

#[derive(Clone)]
struct Staged {
    generation: u64,
    image: CapturedImage,
}

#[derive(Default)]
struct UploadState {
    staged: Option<Staged>,
    last_result: Option<UploadResult>,
    generations: u64,
}

impl UploadState {
    fn put(&mut self, image: CapturedImage) -> u64 {
        self.generations += 1;
        self.staged = Some(Staged {
            generation: self.generations,
            image,
        });
        self.generations
    }
}

/// Holds the in-flight flag for the lifetime of one submission.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UploadCoordinator<B: CameraBackend> {
    camera: Arc<Mutex<DeviceCameraSession<B>>>,
    constraints: CameraConstraints,
    capturer: FrameCapturer,
    endpoint: Arc<dyn ScoringEndpoint>,
    location: Arc<dyn LocationProvider>,
    location_timeout: Duration,
    teardown: watch::Receiver<bool>,
    submitting: AtomicBool,
    state: Mutex<UploadState>,
}

fn staged_summary(image: &CapturedImage) -> StagedCapture {
    StagedCapture {
        pixel_width: image.pixel_width(),
        pixel_height: image.pixel_height(),
        bytes: image.payload().len(),
    }
}

impl<B: CameraBackend> UploadCoordinator<B> {
    pub fn new(
        camera: Arc<Mutex<DeviceCameraSession<B>>>,
        constraints: CameraConstraints,
        capturer: FrameCapturer,
        endpoint: Arc<dyn ScoringEndpoint>,
        location: Arc<dyn LocationProvider>,
        location_timeout: Duration,
        teardown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            camera,
            constraints,
            capturer,
            endpoint,
            location,
            location_timeout,
            teardown,
            submitting: AtomicBool::new(false),
            state: Mutex::new(UploadState::default()),
        }
    }

    async fn snapshot(&self) -> Result<CapturedImage, PipelineError> {
        let mut camera = self.camera.lock().await;
        let stream = camera.acquire(&self.constraints).await?;
        self.capturer.capture(stream).await
    }

    /// Takes a still from the live camera, acquiring it first if needed, and
    /// stages it for the next submission in place of any earlier still.
    pub async fn capture(&self) -> Result<StagedCapture, PipelineError> {
        let image = self.snapshot().await?;
        Ok(self.stage(image).await)
    }

    /// Stages an image from outside the camera path (file picker).
    pub async fn stage(&self, image: CapturedImage) -> StagedCapture {
        let summary = staged_summary(&image);
        self.state.lock().await.put(image);
        info!(
            "staged {}x{} capture ({} bytes)",
            summary.pixel_width, summary.pixel_height, summary.bytes
        );
        summary
    }

    /// Sends the staged still (capturing one if nothing is staged) for
    /// scoring. Only one submission runs at a time; a failed submission
    /// leaves the previous result and the staged still in place.
    pub async fn submit(
        &self,
        session: &UserSession,
        coords: Option<Coordinates>,
    ) -> Result<UploadResult, PipelineError> {
        let _in_flight =
            InFlight::enter(&self.submitting).ok_or(PipelineError::SubmissionInProgress)?;

        let staged = self.state.lock().await.staged.clone();
        let (generation, image) = match staged {
            Some(Staged { generation, image }) => (generation, image),
            None => {
                let image = self.snapshot().await?;
                let generation = self.state.lock().await.put(image.clone());
                (generation, image)
            }
        };

        let coords = match coords {
            Some(coords) => Some(coords),
            None => locate(self.location.as_ref(), self.location_timeout).await,
        };
        let submission = PhotoSubmission {
            image: image.clone(),
            coords,
        };

        let response = tokio::select! {
            _ = torn_down(self.teardown.clone()) => return Err(PipelineError::Cancelled),
            response = self.endpoint.submit_photo(session, &submission) => response,
        };
        let response = response.inspect_err(|err| warn!("photo submission failed: {err}"))?;

        let raw = parse_yolo_raw(&response.photo.yolo_raw);
        let detections = normalize(&raw, image.pixel_width(), image.pixel_height());
        let result = UploadResult {
            photo_id: response.photo.id,
            preview_url: response.photo.image_url,
            message: response.message,
            source_width: image.pixel_width(),
            source_height: image.pixel_height(),
            count: detections.count(),
            max_confidence: detections.max_confidence(),
            detections,
            has_trash: response.photo.has_trash,
            trash_count: response.photo.trash_count,
            server_max_confidence: response.photo.max_trash_confidence,
            image,
        };
        info!(
            "photo {:?} scored: {} detections, max confidence {:.2}",
            result.photo_id, result.count, result.max_confidence
        );

        let mut state = self.state.lock().await;
        // A still staged while this one was in flight stays for the next submit.
        if state.staged.as_ref().is_some_and(|s| s.generation == generation) {
            state.staged = None;
        }
        state.last_result = Some(result.clone());
        Ok(result)
    }

    pub async fn last_result(&self) -> Option<UploadResult> {
        self.state.lock().await.last_result.clone()
    }

    /// Drops the staged still and the last result, e.g. when the user changes.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.staged = None;
        state.last_result = None;
    }

    pub async fn status(&self) -> UploadStatus {
        let state = self.state.lock().await;
        UploadStatus {
            submitting: self.submitting.load(Ordering::Acquire),
            staged: state.staged.as_ref().map(|s| staged_summary(&s.image)),
            last_result: state.last_result.clone(),
        }
    }
}
