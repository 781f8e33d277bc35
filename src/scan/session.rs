use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::Serialize;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    camera::{
        session::DeviceCameraSession,
        traits::{CameraBackend, CameraConstraints},
    },
    core::{errors::PipelineError, state::ScanPhase},
};

use super::{bin_code::normalize_bin_code, decoder::CodeDecoder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEvent {
    pub code: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub last_scanned: Option<ScanEvent>,
}

struct Gate {
    phase: ScanPhase,
    last_scanned: Option<ScanEvent>,
    resume_timer: Option<JoinHandle<()>>,
}

impl Gate {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.resume_timer.take() {
            timer.abort();
        }
    }
}

/// State shared by the session, its decode loop and the debounce timer.
struct Shared {
    gate: Mutex<Gate>,
    events: mpsc::Sender<ScanEvent>,
    debounce: Duration,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Shared {
    fn emit(&self, event: &ScanEvent) {
        if let Err(err) = self.events.try_send(event.clone()) {
            warn!("scan event {} dropped: {err}", event.code);
        }
    }

    /// Emits a camera decode if the session is Active, then pauses for the
    /// debounce interval so a code left in frame is not read again.
    async fn on_decode(self: &Arc<Self>, raw: &str) -> Option<ScanEvent> {
        let code = normalize_bin_code(raw)?;
        let mut gate = self.gate.lock().await;
        if gate.phase != ScanPhase::Active {
            debug!("decode of {code} suppressed while {:?}", gate.phase);
            return None;
        }

        let event = ScanEvent {
            code,
            timestamp_ms: now_ms(),
        };
        self.emit(&event);
        gate.phase = ScanPhase::Paused;
        gate.last_scanned = Some(event.clone());

        let shared = self.clone();
        gate.cancel_timer();
        gate.resume_timer = Some(tokio::spawn(async move {
            sleep(shared.debounce).await;
            let mut gate = shared.gate.lock().await;
            if gate.phase == ScanPhase::Paused {
                gate.phase = ScanPhase::Active;
            }
            gate.resume_timer = None;
        }));
        Some(event)
    }
}

pub struct CodeScanSession<B: CameraBackend> {
    camera: DeviceCameraSession<B>,
    decoder: Arc<dyn CodeDecoder>,
    shared: Arc<Shared>,
    loop_task: Option<JoinHandle<()>>,
    loop_cancel: Option<watch::Sender<bool>>,
}

impl<B: CameraBackend> CodeScanSession<B> {
    /// Returns the session and the receiving end of its decode events.
    pub fn new(
        camera: DeviceCameraSession<B>,
        decoder: Arc<dyn CodeDecoder>,
        debounce: Duration,
    ) -> (Self, mpsc::Receiver<ScanEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        let shared = Arc::new(Shared {
            gate: Mutex::new(Gate {
                phase: ScanPhase::Stopped,
                last_scanned: None,
                resume_timer: None,
            }),
            events: events_tx,
            debounce,
        });
        let session = Self {
            camera,
            decoder,
            shared,
            loop_task: None,
            loop_cancel: None,
        };
        (session, events_rx)
    }

    pub async fn start(&mut self, constraints: &CameraConstraints) -> Result<(), PipelineError> {
        {
            let mut gate = self.shared.gate.lock().await;
            if gate.phase.is_running() {
                return Ok(());
            }
            gate.phase = ScanPhase::Starting;
        }

        match self.launch(constraints).await {
            Ok(()) => {
                info!("code scanning active");
                Ok(())
            }
            Err(err) => {
                warn!("code scanning failed to start: {err}");
                self.halt();
                self.shared.gate.lock().await.phase = ScanPhase::Error(err.to_string());
                Err(err)
            }
        }
    }

    async fn launch(&mut self, constraints: &CameraConstraints) -> Result<(), PipelineError> {
        let frames = self.camera.acquire(constraints).await?.frames();
        let sample = frames.borrow().clone().ok_or_else(|| {
            PipelineError::DecoderInitFailed("stream has not produced a frame".to_string())
        })?;

        let decoder = self.decoder.clone();
        tokio::task::spawn_blocking(move || decoder.prepare(&sample))
            .await
            .map_err(|err| PipelineError::DecoderInitFailed(format!("decoder task failed: {err}")))??;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.shared.gate.lock().await.phase = ScanPhase::Active;
        self.loop_task = Some(tokio::spawn(decode_loop(
            self.shared.clone(),
            self.decoder.clone(),
            frames,
            cancel_rx,
        )));
        self.loop_cancel = Some(cancel_tx);
        Ok(())
    }

    pub async fn pause(&self) {
        let mut gate = self.shared.gate.lock().await;
        gate.cancel_timer();
        if matches!(gate.phase, ScanPhase::Active | ScanPhase::Paused) {
            gate.phase = ScanPhase::Paused;
        }
    }

    pub async fn resume(&self) {
        let mut gate = self.shared.gate.lock().await;
        gate.cancel_timer();
        if gate.phase == ScanPhase::Paused {
            gate.phase = ScanPhase::Active;
        }
    }

    /// Stops decoding and releases the camera. Safe in any phase, any number
    /// of times.
    pub async fn stop(&mut self) {
        {
            let mut gate = self.shared.gate.lock().await;
            gate.cancel_timer();
            gate.phase = ScanPhase::Stopped;
        }
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(cancel) = self.loop_cancel.take() {
            let _ = cancel.send(true);
        }
        if let Some(task) = self.loop_task.take() {
            task.abort();
        }
        self.camera.release();
    }

    /// Manual entry path used when the camera cannot be used. The code goes
    /// out on the same event channel; camera debounce does not apply.
    pub async fn submit_manual(&self, raw: &str) -> Option<ScanEvent> {
        let event = ScanEvent {
            code: normalize_bin_code(raw)?,
            timestamp_ms: now_ms(),
        };
        self.shared.emit(&event);
        self.shared.gate.lock().await.last_scanned = Some(event.clone());
        Some(event)
    }

    pub async fn status(&self) -> ScanStatus {
        let gate = self.shared.gate.lock().await;
        ScanStatus {
            phase: gate.phase.clone(),
            last_scanned: gate.last_scanned.clone(),
        }
    }

    #[cfg(test)]
    async fn inject_decode(&self, raw: &str) -> Option<ScanEvent> {
        self.shared.on_decode(raw).await
    }
}

impl<B: CameraBackend> Drop for CodeScanSession<B> {
    fn drop(&mut self) {
        if let Ok(mut gate) = self.shared.gate.try_lock() {
            gate.cancel_timer();
            gate.phase = ScanPhase::Stopped;
        }
        self.halt();
    }
}

async fn decode_loop(
    shared: Arc<Shared>,
    decoder: Arc<dyn CodeDecoder>,
    mut frames: watch::Receiver<Option<Bytes>>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            changed = frames.changed() => {
                if changed.is_err() {
                    warn!("scan video track ended");
                    let mut gate = shared.gate.lock().await;
                    if gate.phase.is_running() {
                        gate.phase = ScanPhase::Error("video track ended".to_string());
                    }
                    break;
                }
                if shared.gate.lock().await.phase != ScanPhase::Active {
                    continue;
                }
                let Some(frame) = frames.borrow_and_update().clone() else {
                    continue;
                };

                let decoder = decoder.clone();
                match tokio::task::spawn_blocking(move || decoder.decode(&frame)).await {
                    Ok(Some(code)) => {
                        if let Some(event) = shared.on_decode(&code).await {
                            info!("scanned bin code {}", event.code);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!("decode task failed: {err}"),
                }
            }
        }
    }
}
