use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CameraPhase {
    Idle,
    Acquiring,
    Ready,
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub phase: CameraPhase,
    pub device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ScanPhase {
    Starting,
    Active,
    Paused,
    Stopped,
    Error(String),
}

impl ScanPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Paused)
    }
}
