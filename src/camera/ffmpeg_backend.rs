use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    io::AsyncReadExt,
    process::{ChildStderr, ChildStdout, Command},
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::core::errors::PipelineError;

use super::{
    discovery,
    jpeg::MjpegSplitter,
    traits::{CameraBackend, CameraConstraints, CameraDeviceInfo, VideoTrack},
};

#[derive(Debug, Clone, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CameraBackend for FfmpegBackend {
    async fn enumerate(&self) -> anyhow::Result<Vec<CameraDeviceInfo>> {
        Ok(discovery::flatten(discovery::probe_cameras().await?))
    }

    async fn open_track(
        &self,
        device: &CameraDeviceInfo,
        constraints: &CameraConstraints,
    ) -> Result<Box<dyn VideoTrack>, PipelineError> {
        let video_size = format!("{}x{}", constraints.width, constraints.height);
        let mut child = Command::new("ffmpeg")
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-f",
                "v4l2",
                "-input_format",
                &constraints.input_format,
                "-video_size",
                &video_size,
                "-i",
                &device.path,
                "-f",
                "mpjpeg",
                "-boundary_tag",
                "cashup",
                "pipe:1",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                PipelineError::DeviceUnavailable(format!("failed to spawn ffmpeg: {err}"))
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(PipelineError::DeviceUnavailable(
                "missing ffmpeg pipes".to_string(),
            ));
        };

        let stderr_task = tokio::spawn(collect_stderr(stderr));
        let (frames_tx, mut frames_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let device_path = device.path.clone();
        let reader = tokio::spawn(async move {
            pump_frames(stdout, frames_tx, cancel_rx).await;
            if let Err(err) = child.kill().await {
                debug!("ffmpeg for {device_path} already gone: {err}");
            }
            if let Err(err) = child.wait().await {
                warn!("failed to reap ffmpeg for {device_path}: {err}");
            }
        });

        let first = frames_rx.wait_for(Option::is_some).await.map(|_| ());
        if first.is_err() {
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(classify_ffmpeg_error(&stderr));
        }

        Ok(Box::new(FfmpegTrack {
            frames: frames_rx,
            cancel_tx,
            reader: Some(reader),
        }))
    }
}

struct FfmpegTrack {
    frames: watch::Receiver<Option<Bytes>>,
    cancel_tx: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
}

impl VideoTrack for FfmpegTrack {
    fn frames(&self) -> watch::Receiver<Option<Bytes>> {
        self.frames.clone()
    }

    fn is_live(&self) -> bool {
        self.reader.as_ref().is_some_and(|reader| !reader.is_finished())
    }

    fn stop(&mut self) {
        let _ = self.cancel_tx.send(true);
        self.reader.take();
    }
}

impl Drop for FfmpegTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump_frames(
    mut stdout: ChildStdout,
    frames_tx: watch::Sender<Option<Bytes>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let mut buffer = vec![0_u8; 64 * 1024];
    let mut splitter = MjpegSplitter::new();
    loop {
        tokio::select! {
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    debug!("video track stopped");
                    break;
                }
            }
            read = stdout.read(&mut buffer) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(frame) = splitter.push(&buffer[..n]) {
                            frames_tx.send_replace(Some(frame));
                        }
                    }
                    Err(err) => {
                        warn!("video track read failed: {err}");
                        break;
                    }
                }
            }
        }
    }
}

async fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut text = String::new();
    if let Err(err) = stderr.read_to_string(&mut text).await {
        debug!("could not read ffmpeg stderr: {err}");
    }
    text
}

/// Maps ffmpeg's v4l2 failure text onto the platform error kinds.
pub fn classify_ffmpeg_error(stderr: &str) -> PipelineError {
    let lower = stderr.to_lowercase();
    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("ffmpeg exited before the first frame")
        .trim()
        .to_string();

    if lower.contains("permission denied") || lower.contains("operation not permitted") {
        PipelineError::PermissionDenied(detail)
    } else if lower.contains("device or resource busy") {
        PipelineError::DeviceUnavailable(format!("device busy: {detail}"))
    } else {
        PipelineError::DeviceUnavailable(detail)
    }
}
