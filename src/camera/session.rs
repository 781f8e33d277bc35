use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    time::timeout,
};
use tracing::{info, warn};

use crate::core::{
    errors::PipelineError,
    state::{CameraPhase, CameraStatus},
};

use super::{
    context::MediaContext,
    discovery,
    traits::{CameraBackend, CameraConstraints, CameraDeviceInfo, VideoTrack},
};

/// An open hardware stream. Dropping the handle stops the track and gives
/// the device lease back.
pub struct StreamHandle {
    id: u64,
    device: CameraDeviceInfo,
    track: Box<dyn VideoTrack>,
    _lease: OwnedSemaphorePermit,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &CameraDeviceInfo {
        &self.device
    }

    pub fn frames(&self) -> watch::Receiver<Option<Bytes>> {
        self.track.frames()
    }

    pub fn is_live(&self) -> bool {
        self.track.is_live()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.track.stop();
    }
}

/// Resolves once `teardown` flips to true. A dropped sender never resolves.
pub async fn torn_down(mut teardown: watch::Receiver<bool>) {
    if teardown.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub struct DeviceCameraSession<B: CameraBackend> {
    backend: Arc<B>,
    context: MediaContext,
    lease: Arc<Semaphore>,
    acquire_timeout: Duration,
    teardown: watch::Receiver<bool>,
    phase: CameraPhase,
    stream: Option<StreamHandle>,
    next_id: u64,
}

impl<B: CameraBackend> DeviceCameraSession<B> {
    /// `lease` is shared by every session that may touch the same device;
    /// `teardown` flips to true when the owning component goes away.
    pub fn new(
        backend: Arc<B>,
        context: MediaContext,
        lease: Arc<Semaphore>,
        acquire_timeout: Duration,
        teardown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            backend,
            context,
            lease,
            acquire_timeout,
            teardown,
            phase: CameraPhase::Idle,
            stream: None,
            next_id: 1,
        }
    }

    pub async fn acquire(
        &mut self,
        constraints: &CameraConstraints,
    ) -> Result<&StreamHandle, PipelineError> {
        match self.stream.take() {
            Some(handle) if handle.is_live() => return Ok(self.stream.insert(handle)),
            // A dead stream still holds the lease; dropping it here frees it.
            _ => {}
        }

        match self.open(constraints).await {
            Ok(handle) => {
                info!(
                    "camera stream {} ready on {}",
                    handle.id, handle.device.path
                );
                self.phase = CameraPhase::Ready;
                Ok(self.stream.insert(handle))
            }
            Err(err) => {
                warn!("camera acquisition failed: {err}");
                self.phase = CameraPhase::Error(err.to_string());
                Err(err)
            }
        }
    }

    async fn open(&mut self, constraints: &CameraConstraints) -> Result<StreamHandle, PipelineError> {
        if !self.context.is_secure() {
            return Err(PipelineError::UnsupportedContext);
        }
        if *self.teardown.borrow() {
            return Err(PipelineError::Cancelled);
        }

        self.phase = CameraPhase::Acquiring;
        let lease = self.lease.clone().try_acquire_owned().map_err(|_| {
            PipelineError::DeviceUnavailable("camera is held by another session".to_string())
        })?;

        let devices = match self.backend.enumerate().await {
            Ok(devices) => devices,
            Err(err) => {
                warn!("camera enumeration failed: {err:#}");
                Vec::new()
            }
        };
        let device = discovery::select_device(&devices, constraints).ok_or_else(|| {
            PipelineError::DeviceUnavailable("no video input devices found".to_string())
        })?;

        let opened = tokio::select! {
            _ = torn_down(self.teardown.clone()) => return Err(PipelineError::Cancelled),
            opened = timeout(self.acquire_timeout, self.backend.open_track(&device, constraints)) => opened,
        };
        let track = opened.map_err(|_| PipelineError::Timeout)??;

        let id = self.next_id;
        self.next_id += 1;
        Ok(StreamHandle {
            id,
            device,
            track,
            _lease: lease,
        })
    }

    /// Stops the stream, if any, and returns to Idle. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(handle) = self.stream.take() {
            info!("camera stream {} released", handle.id);
        }
        self.phase = CameraPhase::Idle;
    }

    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.as_ref()
    }

    pub fn phase(&self) -> &CameraPhase {
        &self.phase
    }

    pub fn status(&self) -> CameraStatus {
        CameraStatus {
            phase: self.phase.clone(),
            device: self.stream.as_ref().map(|s| s.device.path.clone()),
        }
    }
}

impl<B: CameraBackend> Drop for DeviceCameraSession<B> {
    fn drop(&mut self) {
        self.release();
    }
}


#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::{Semaphore, watch};
    use url::Url;

    use crate::{
        camera::context::MediaContext,
        core::{errors::PipelineError, state::CameraPhase},
    };

    use super::{
        DeviceCameraSession,
        testing::{MockBackend, constraints, jpeg_frame},
    };

    fn session(
        backend: Arc<MockBackend>,
        origin: &str,
    ) -> (DeviceCameraSession<MockBackend>, watch::Sender<bool>) {
        let (teardown_tx, teardown_rx) = watch::channel(false);
        let session = DeviceCameraSession::new(
            backend,
            MediaContext::new(Url::parse(origin).expect("origin should parse")),
            Arc::new(Semaphore::new(1)),
            Duration::from_secs(2),
            teardown_rx,
        );
        (session, teardown_tx)
    }

    #[tokio::test]
    async fn insecure_context_fails_without_touching_the_device() {
        let backend = Arc::new(MockBackend::with_frame(jpeg_frame(8, 8)));
        let (mut session, _teardown) = session(backend.clone(), "http://192.168.1.5:8080");

        let err = session
            .acquire(&constraints())
            .await
            .err()
            .expect("insecure origin should fail");
        assert_eq!(err, PipelineError::UnsupportedContext);
        assert_eq!(backend.opened(), 0);
        assert!(matches!(session.phase(), CameraPhase::Error(_)));
    }

    #[tokio::test]
    async fn acquire_then_release_is_idempotent() {
        let backend = Arc::new(MockBackend::with_frame(jpeg_frame(8, 8)));
        let (mut session, _teardown) = session(backend.clone(), "http://localhost:8080");

        let first_id = session.acquire(&constraints()).await.expect("acquire").id();
        let second_id = session.acquire(&constraints()).await.expect("reacquire").id();
        assert_eq!(first_id, second_id, "a live stream is reused");
        assert_eq!(backend.opened(), 1);
        assert_eq!(session.phase(), &CameraPhase::Ready);

        session.release();
        session.release();
        assert_eq!(session.phase(), &CameraPhase::Idle);
        assert!(!backend.is_live(), "release must stop the track");
    }

    #[tokio::test]
    async fn permission_error_moves_to_error_and_a_new_acquire_retries() {
        let backend = Arc::new(MockBackend::failing(PipelineError::PermissionDenied(
            "denied".to_string(),
        )));
        let (mut session, _teardown) = session(backend.clone(), "https://kiosk.example.org");

        let err = session.acquire(&constraints()).await.err().expect("should fail");
        assert!(matches!(err, PipelineError::PermissionDenied(_)));
        assert!(matches!(session.phase(), CameraPhase::Error(_)));

        let _ = session.acquire(&constraints()).await;
        assert_eq!(backend.opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_device_times_out() {
        let mut backend = MockBackend::with_frame(jpeg_frame(8, 8));
        backend.open_delay = Some(Duration::from_secs(30));
        let (mut session, _teardown) = session(Arc::new(backend), "http://localhost");

        let err = session.acquire(&constraints()).await.err().expect("should time out");
        assert_eq!(err, PipelineError::Timeout);
    }

    #[tokio::test]
    async fn lease_blocks_a_second_session_on_the_same_device() {
        let backend = Arc::new(MockBackend::with_frame(jpeg_frame(8, 8)));
        let lease = Arc::new(Semaphore::new(1));
        let (_tx, rx) = watch::channel(false);
        let context = MediaContext::new(Url::parse("http://localhost").expect("origin"));
        let mut first = DeviceCameraSession::new(
            backend.clone(),
            context.clone(),
            lease.clone(),
            Duration::from_secs(1),
            rx.clone(),
        );
        let mut second =
            DeviceCameraSession::new(backend, context, lease, Duration::from_secs(1), rx);

        first.acquire(&constraints()).await.expect("first acquire");
        let err = second.acquire(&constraints()).await.err().expect("device is leased");
        assert!(matches!(err, PipelineError::DeviceUnavailable(_)));

        first.release();
        second
            .acquire(&constraints())
            .await
            .expect("lease is returned on release");
    }

    #[tokio::test]
    async fn teardown_abandons_a_pending_acquisition() {
        let mut backend = MockBackend::with_frame(jpeg_frame(8, 8));
        backend.open_delay = Some(Duration::from_secs(60));
        let (mut session, teardown) = session(Arc::new(backend), "http://localhost");

        let pending = tokio::spawn(async move {
            let result = session.acquire(&constraints()).await.map(|_| ());
            (result, session.phase().clone())
        });
        tokio::task::yield_now().await;
        teardown.send(true).expect("session still listening");

        let (result, phase) = pending.await.expect("task should finish");
        assert_eq!(result, Err(PipelineError::Cancelled));
        assert!(matches!(phase, CameraPhase::Error(_)));
    }
}
