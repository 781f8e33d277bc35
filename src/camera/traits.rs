use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;

use crate::core::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    Environment,
    User,
    Any,
}

#[derive(Debug, Clone)]
pub struct CameraConstraints {
    pub facing: FacingMode,
    /// Pins a specific device path instead of choosing by facing mode.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub input_format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraDeviceInfo {
    pub path: String,
    pub name: String,
    pub facing: Option<FacingMode>,
    pub formats: Vec<String>,
}

/// A live video track. The newest encoded (JPEG) frame is published on a
/// watch channel; the channel closes when the track ends.
pub trait VideoTrack: Send + Sync {
    fn frames(&self) -> watch::Receiver<Option<Bytes>>;
    fn is_live(&self) -> bool;
    fn stop(&mut self);
}

#[async_trait]
pub trait CameraBackend: Send + Sync {
    async fn enumerate(&self) -> anyhow::Result<Vec<CameraDeviceInfo>>;

    /// Opens the device and resolves once the first frame has arrived.
    async fn open_track(
        &self,
        device: &CameraDeviceInfo,
        constraints: &CameraConstraints,
    ) -> Result<Box<dyn VideoTrack>, PipelineError>;
}
