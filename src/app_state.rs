use std::{
    sync::{Arc, Weak},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tracing::{info, warn};

use crate::{
    api::client::{BinRedemption, BinScanResponse, ScoringEndpoint, UserSession},
    camera::{
        capture::{CapturedImage, FrameCapturer},
        context::MediaContext,
        ffmpeg_backend::FfmpegBackend,
        session::{DeviceCameraSession, torn_down},
        traits::{CameraBackend, CameraConstraints},
    },
    config::AppConfig,
    core::{errors::PipelineError, state::CameraStatus},
    location::{Coordinates, LocationProvider, locate},
    scan::{
        decoder::CodeDecoder,
        session::{CodeScanSession, ScanEvent, ScanStatus},
    },
    upload::coordinator::{StagedCapture, UploadCoordinator, UploadResult, UploadStatus},
};

/// External collaborators the kiosk talks to.
pub struct Collaborators {
    pub decoder: Arc<dyn CodeDecoder>,
    pub scoring: Arc<dyn ScoringEndpoint>,
    pub redemption: Arc<dyn BinRedemption>,
    pub location: Arc<dyn LocationProvider>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RedemptionOutcome {
    Redeemed(BinScanResponse),
    Failed { message: String },
    NoSession,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Redemption {
    pub code: String,
    pub scanned_at_ms: u64,
    pub finished_at_ms: u64,
    pub outcome: RedemptionOutcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KioskStatus {
    pub camera: CameraStatus,
    pub scan: ScanStatus,
    pub upload: UploadStatus,
    pub session: Option<UserSession>,
    pub last_redemption: Option<Redemption>,
    pub secure_context: bool,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Application context shared by every handler. The camera preview, the
/// code scanner and the upload path share one device lease, so only one of
/// them holds the camera at a time.
pub struct AppState<B: CameraBackend = FfmpegBackend> {
    pub config: AppConfig,
    constraints: CameraConstraints,
    context: MediaContext,
    camera: Arc<Mutex<DeviceCameraSession<B>>>,
    scan: Mutex<CodeScanSession<B>>,
    uploads: UploadCoordinator<B>,
    redemption: Arc<dyn BinRedemption>,
    location: Arc<dyn LocationProvider>,
    session: Mutex<Option<UserSession>>,
    last_redemption: Mutex<Option<Redemption>>,
    teardown: watch::Sender<bool>,
}

impl<B: CameraBackend + 'static> AppState<B> {
    pub fn new(config: AppConfig, backend: Arc<B>, collaborators: Collaborators) -> Arc<Self> {
        let constraints = CameraConstraints {
            facing: config.camera_facing,
            device: config.camera_device.clone(),
            width: config.camera_width,
            height: config.camera_height,
            input_format: config.camera_input_format.clone(),
        };
        let context = MediaContext::new(config.public_origin.clone());
        let lease = Arc::new(Semaphore::new(1));
        let (teardown, teardown_rx) = watch::channel(false);

        let device_session = || {
            DeviceCameraSession::new(
                backend.clone(),
                context.clone(),
                lease.clone(),
                config.camera_acquire_timeout,
                teardown_rx.clone(),
            )
        };
        let camera = Arc::new(Mutex::new(device_session()));
        let (scan, events) = CodeScanSession::new(
            device_session(),
            collaborators.decoder,
            config.scan_debounce,
        );
        let uploads = UploadCoordinator::new(
            camera.clone(),
            constraints.clone(),
            FrameCapturer::new(config.jpeg_quality, config.capture_timeout),
            collaborators.scoring,
            collaborators.location.clone(),
            config.geolocation_timeout,
            teardown_rx.clone(),
        );

        let session = match (&config.user_id, &config.festival_id) {
            (Some(user_id), Some(festival_id)) => Some(UserSession {
                user_id: user_id.clone(),
                festival_id: festival_id.clone(),
                token: config.api_token.clone(),
            }),
            _ => None,
        };

        let state = Arc::new(Self {
            config,
            constraints,
            context,
            camera,
            scan: Mutex::new(scan),
            uploads,
            redemption: collaborators.redemption,
            location: collaborators.location,
            session: Mutex::new(session),
            last_redemption: Mutex::new(None),
            teardown,
        });
        tokio::spawn(relay_scans(Arc::downgrade(&state), events, teardown_rx));
        state
    }

    pub async fn status(&self) -> KioskStatus {
        let camera = self.camera.lock().await.status();
        let scan = self.scan.lock().await.status().await;
        KioskStatus {
            camera,
            scan,
            upload: self.uploads.status().await,
            session: self.session().await,
            last_redemption: self.last_redemption().await,
            secure_context: self.context.is_secure(),
        }
    }

    /// Opens the preview stream, stopping the scanner first if it holds the
    /// device.
    pub async fn start_camera(&self) -> Result<CameraStatus, PipelineError> {
        self.scan.lock().await.stop().await;
        let mut camera = self.camera.lock().await;
        camera.acquire(&self.constraints).await?;
        Ok(camera.status())
    }

    pub async fn stop_camera(&self) -> CameraStatus {
        let mut camera = self.camera.lock().await;
        camera.release();
        camera.status()
    }

    /// Frames of the open preview stream, if any.
    pub async fn preview_frames(&self) -> Option<watch::Receiver<Option<Bytes>>> {
        let camera = self.camera.lock().await;
        camera.stream().map(|stream| stream.frames())
    }

    pub async fn start_scan(&self) -> Result<ScanStatus, PipelineError> {
        self.camera.lock().await.release();
        let mut scan = self.scan.lock().await;
        scan.start(&self.constraints).await?;
        Ok(scan.status().await)
    }

    pub async fn stop_scan(&self) -> ScanStatus {
        let mut scan = self.scan.lock().await;
        scan.stop().await;
        scan.status().await
    }

    pub async fn pause_scan(&self) -> ScanStatus {
        let scan = self.scan.lock().await;
        scan.pause().await;
        scan.status().await
    }

    pub async fn resume_scan(&self) -> ScanStatus {
        let scan = self.scan.lock().await;
        scan.resume().await;
        scan.status().await
    }

    pub async fn submit_manual_code(&self, raw: &str) -> Option<ScanEvent> {
        self.scan.lock().await.submit_manual(raw).await
    }

    pub async fn last_redemption(&self) -> Option<Redemption> {
        self.last_redemption.lock().await.clone()
    }

    pub async fn capture(&self) -> Result<StagedCapture, PipelineError> {
        self.scan.lock().await.stop().await;
        self.uploads.capture().await
    }

    pub async fn stage_upload(&self, encoded: Bytes) -> Result<StagedCapture, PipelineError> {
        let quality = self.config.jpeg_quality;
        let image = tokio::task::spawn_blocking(move || {
            CapturedImage::from_encoded(&encoded, quality)
        })
        .await
        .map_err(|err| PipelineError::CaptureFailed(format!("decoder task failed: {err}")))??;
        Ok(self.uploads.stage(image).await)
    }

    /// Submits the staged still. Fails with `None` when no user session is set.
    pub async fn submit_photo(
        &self,
        coords: Option<Coordinates>,
    ) -> Option<Result<UploadResult, PipelineError>> {
        let session = self.session.lock().await.clone()?;
        if self.uploads.status().await.staged.is_none() {
            self.scan.lock().await.stop().await;
        }
        Some(self.uploads.submit(&session, coords).await)
    }

    pub async fn last_result(&self) -> Option<UploadResult> {
        self.uploads.last_result().await
    }

    pub async fn session(&self) -> Option<UserSession> {
        self.session.lock().await.clone()
    }

    /// Replaces the user session. Results belonging to the previous user are
    /// dropped.
    pub async fn set_session(&self, session: Option<UserSession>) {
        let mut current = self.session.lock().await;
        if *current != session {
            self.uploads.reset().await;
            *self.last_redemption.lock().await = None;
        }
        match &session {
            Some(s) => info!("session set for user {} at festival {}", s.user_id, s.festival_id),
            None => info!("session cleared"),
        }
        *current = session;
    }

    /// Stops scanning, releases the camera and abandons pending work.
    pub async fn teardown(&self) {
        self.teardown.send_replace(true);
        self.scan.lock().await.stop().await;
        self.camera.lock().await.release();
        info!("kiosk torn down");
    }

    async fn redeem(&self, event: ScanEvent) {
        let session = self.session.lock().await.clone();
        let outcome = match session {
            None => {
                warn!("bin code {} scanned without a user session", event.code);
                RedemptionOutcome::NoSession
            }
            Some(session) => {
                let coords = locate(self.location.as_ref(), self.config.geolocation_timeout).await;
                match self.redemption.redeem_bin(&session, &event.code, coords).await {
                    Ok(reply) => {
                        info!(
                            "bin {} redeemed: {} photos activated",
                            event.code, reply.activated
                        );
                        RedemptionOutcome::Redeemed(reply)
                    }
                    Err(err) => {
                        warn!("bin {} redemption failed: {err}", event.code);
                        RedemptionOutcome::Failed {
                            message: err.to_string(),
                        }
                    }
                }
            }
        };

        *self.last_redemption.lock().await = Some(Redemption {
            code: event.code,
            scanned_at_ms: event.timestamp_ms,
            finished_at_ms: now_ms(),
            outcome,
        });
    }
}

/// Forwards scan events to the redemption endpoint until teardown or until
/// the state is gone.
async fn relay_scans<B: CameraBackend + 'static>(
    state: Weak<AppState<B>>,
    mut events: mpsc::Receiver<ScanEvent>,
    teardown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = torn_down(teardown.clone()) => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        let Some(state) = state.upgrade() else { break };
        state.redeem(event).await;
    }
    info!("scan relay stopped");
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex;
    use url::Url;

    use crate::{
        api::client::{
            BinRedemption, BinScanResponse, PhotoSubmission, ScoringEndpoint, UploadResponse,
            UploadedPhoto, UserSession,
        },
        camera::{
            session::testing::{MockBackend, jpeg_frame},
            traits::FacingMode,
        },
        config::AppConfig,
        core::errors::PipelineError,
        location::{Coordinates, FixedLocation},
        scan::decoder::CodeDecoder,
    };

    use super::{AppState, Collaborators};

    pub struct AcceptingDecoder;

    impl CodeDecoder for AcceptingDecoder {
        fn prepare(&self, _frame: &[u8]) -> Result<(), PipelineError> {
            Ok(())
        }

        fn decode(&self, _frame: &[u8]) -> Option<String> {
            None
        }
    }

    /// Scores every photo with one detection and redeems every bin.
    #[derive(Default)]
    pub struct FakeApi {
        pub uploads: AtomicUsize,
        pub redeemed: Mutex<Vec<(String, Option<Coordinates>)>>,
        pub reject_bins: bool,
    }

    #[async_trait]
    impl ScoringEndpoint for FakeApi {
        async fn submit_photo(
            &self,
            _session: &UserSession,
            _submission: &PhotoSubmission,
        ) -> Result<UploadResponse, PipelineError> {
            let id = self.uploads.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            Ok(UploadResponse {
                photo: UploadedPhoto {
                    id: Some(id),
                    image_url: Some(format!("/uploads/{id}.jpg")),
                    status: None,
                    points: None,
                    has_trash: Some(true),
                    trash_count: Some(1),
                    max_trash_confidence: Some(0.9),
                    yolo_raw: json!([{"name": "can", "confidence": 0.9, "xyxy": [0, 0, 32, 24]}]),
                },
                message: "uploaded".to_string(),
            })
        }
    }

    #[async_trait]
    impl BinRedemption for FakeApi {
        async fn redeem_bin(
            &self,
            _session: &UserSession,
            code: &str,
            coords: Option<Coordinates>,
        ) -> Result<BinScanResponse, PipelineError> {
            self.redeemed.lock().await.push((code.to_string(), coords));
            if self.reject_bins {
                return Err(PipelineError::Rejected {
                    status: 404,
                    message: "존재하지 않는 쓰레기통이에요.".to_string(),
                });
            }
            Ok(BinScanResponse {
                activated: 1,
                converted_count: 1,
                bin_name: Some(format!("Bin {code}")),
            })
        }
    }

    pub fn config(origin: &str) -> AppConfig {
        AppConfig {
            app_name: "Cash-Up Kiosk".to_string(),
            bind_addr: "127.0.0.1:8080".parse().expect("socket addr"),
            public_origin: Url::parse(origin).expect("origin"),
            api_base_url: Url::parse("http://localhost:8000").expect("api url"),
            api_token: None,
            api_timeout: Duration::from_secs(5),
            user_id: Some("user-1".to_string()),
            festival_id: Some("fest-1".to_string()),
            camera_device: None,
            camera_input_format: "mjpeg".to_string(),
            camera_facing: FacingMode::Environment,
            camera_width: 64,
            camera_height: 48,
            camera_acquire_timeout: Duration::from_secs(1),
            capture_timeout: Duration::from_secs(1),
            jpeg_quality: 85,
            scan_debounce: Duration::from_millis(400),
            geolocation_timeout: Duration::from_millis(100),
            kiosk_coords: Some((35.1, 129.0)),
        }
    }

    pub fn state_with(config: AppConfig, api: Arc<FakeApi>) -> Arc<AppState<MockBackend>> {
        let location = Arc::new(FixedLocation::new(config.kiosk_coords));
        AppState::new(
            config,
            Arc::new(MockBackend::with_frame(jpeg_frame(64, 48))),
            Collaborators {
                decoder: Arc::new(AcceptingDecoder),
                scoring: api.clone(),
                redemption: api,
                location,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use crate::{
        api::client::UserSession,
        camera::session::testing::MockBackend,
        core::{
            errors::PipelineError,
            state::{CameraPhase, ScanPhase},
        },
    };

    use super::{
        AppState, RedemptionOutcome,
        testing::{FakeApi, config, state_with},
    };

    async fn wait_for_redemption(state: &AppState<MockBackend>) {
        for _ in 0..100 {
            if state.last_redemption().await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("redemption never finished");
    }

    #[tokio::test]
    async fn scanner_and_preview_take_turns_on_the_device() {
        let state = state_with(config("http://localhost"), Arc::new(FakeApi::default()));

        let camera = state.start_camera().await.expect("preview starts");
        assert_eq!(camera.phase, CameraPhase::Ready);

        let scan = state.start_scan().await.expect("scanner takes the device");
        assert_eq!(scan.phase, ScanPhase::Active);
        assert_eq!(state.status().await.camera.phase, CameraPhase::Idle);

        state.start_camera().await.expect("preview takes it back");
        assert_eq!(state.status().await.scan.phase, ScanPhase::Stopped);
    }

    #[tokio::test]
    async fn manual_code_is_redeemed_with_kiosk_location() {
        let api = Arc::new(FakeApi::default());
        let state = state_with(config("http://localhost"), api.clone());

        let event = state.submit_manual_code(" trash-bin-3 ").await.expect("valid code");
        assert_eq!(event.code, "TRASH_BIN_03");
        wait_for_redemption(&state).await;

        let redemption = state.last_redemption().await.expect("recorded");
        assert!(matches!(redemption.outcome, RedemptionOutcome::Redeemed(ref r) if r.activated == 1));
        let redeemed = api.redeemed.lock().await;
        assert_eq!(redeemed[0].0, "TRASH_BIN_03");
        assert!(redeemed[0].1.is_some());
    }

    #[tokio::test]
    async fn rejected_redemption_keeps_the_server_message() {
        let api = Arc::new(FakeApi {
            reject_bins: true,
            ..FakeApi::default()
        });
        let state = state_with(config("http://localhost"), api);

        state.submit_manual_code("7").await.expect("valid code");
        wait_for_redemption(&state).await;

        match state.last_redemption().await.expect("recorded").outcome {
            RedemptionOutcome::Failed { message } => assert_eq!(message, "존재하지 않는 쓰레기통이에요."),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_without_session_is_refused() {
        let state = state_with(config("http://localhost"), Arc::new(FakeApi::default()));
        state.set_session(None).await;
        assert!(state.submit_photo(None).await.is_none());
    }

    #[tokio::test]
    async fn changing_user_drops_previous_results() {
        let state = state_with(config("http://localhost"), Arc::new(FakeApi::default()));
        state.capture().await.expect("capture");
        state
            .submit_photo(None)
            .await
            .expect("session present")
            .expect("submit");
        assert!(state.last_result().await.is_some());

        state
            .set_session(Some(UserSession {
                user_id: "user-2".to_string(),
                festival_id: "fest-1".to_string(),
                token: None,
            }))
            .await;
        assert!(state.last_result().await.is_none());
    }

    #[tokio::test]
    async fn insecure_origin_blocks_every_camera_path() {
        let state = state_with(config("http://kiosk.example"), Arc::new(FakeApi::default()));
        assert_eq!(state.start_camera().await.expect_err("blocked"), PipelineError::UnsupportedContext);
        assert_eq!(state.start_scan().await.expect_err("blocked"), PipelineError::UnsupportedContext);
        assert_eq!(state.capture().await.expect_err("blocked"), PipelineError::UnsupportedContext);
        assert!(!state.status().await.secure_context);
    }

    #[tokio::test]
    async fn teardown_releases_the_device_and_refuses_new_work() {
        let state = state_with(config("http://localhost"), Arc::new(FakeApi::default()));
        state.start_scan().await.expect("scan starts");

        state.teardown().await;
        let status = state.status().await;
        assert_eq!(status.scan.phase, ScanPhase::Stopped);
        assert_eq!(status.camera.phase, CameraPhase::Idle);
        assert_eq!(state.start_camera().await.expect_err("torn down"), PipelineError::Cancelled);
    }
}
