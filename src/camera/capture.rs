use std::time::Duration;

use bytes::Bytes;
use image::{ExtendedColorType, RgbImage, codecs::jpeg::JpegEncoder};
use tokio::time::timeout;

use crate::core::errors::PipelineError;

use super::session::StreamHandle;

pub const CAPTURE_MIME: &str = "image/jpeg";

/// A still image ready for upload. Immutable once built.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pixel_width: u32,
    pixel_height: u32,
    payload: Bytes,
}

impl CapturedImage {
    /// Decodes any supported still (JPEG, PNG) and re-encodes it as JPEG.
    /// Used both for live frames and for files picked by the user.
    pub fn from_encoded(encoded: &[u8], quality: u8) -> Result<Self, PipelineError> {
        let decoded = image::load_from_memory(encoded)
            .map_err(|err| PipelineError::CaptureFailed(format!("undecodable image: {err}")))?;
        let rgb = decoded.to_rgb8();
        let (pixel_width, pixel_height) = rgb.dimensions();
        if pixel_width == 0 || pixel_height == 0 {
            return Err(PipelineError::CaptureFailed(
                "frame has zero dimensions".to_string(),
            ));
        }

        let mut payload = Vec::new();
        JpegEncoder::new_with_quality(&mut payload, quality)
            .encode(rgb.as_raw(), pixel_width, pixel_height, ExtendedColorType::Rgb8)
            .map_err(|err| PipelineError::CaptureFailed(format!("jpeg encode failed: {err}")))?;

        Ok(Self {
            pixel_width,
            pixel_height,
            payload: Bytes::from(payload),
        })
    }

    pub fn pixel_width(&self) -> u32 {
        self.pixel_width
    }

    pub fn pixel_height(&self) -> u32 {
        self.pixel_height
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn to_rgb(&self) -> Result<RgbImage, PipelineError> {
        image::load_from_memory(&self.payload)
            .map(|decoded| decoded.to_rgb8())
            .map_err(|err| PipelineError::CaptureFailed(format!("undecodable capture: {err}")))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCapturer {
    quality: u8,
    frame_timeout: Duration,
}

impl FrameCapturer {
    pub fn new(quality: u8, frame_timeout: Duration) -> Self {
        Self {
            quality,
            frame_timeout,
        }
    }

    /// Snapshots the newest frame of `stream`. Encoding runs on the blocking
    /// pool; one call yields exactly one image or one error.
    pub async fn capture(&self, stream: &StreamHandle) -> Result<CapturedImage, PipelineError> {
        if !stream.is_live() {
            return Err(PipelineError::CaptureFailed(
                "stream has no active video track".to_string(),
            ));
        }

        let mut frames = stream.frames();
        let waited = timeout(self.frame_timeout, async move {
            frames
                .wait_for(Option::is_some)
                .await
                .map(|frame| frame.clone())
        })
        .await;

        let frame = match waited {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) | Ok(Err(_)) => {
                return Err(PipelineError::CaptureFailed(
                    "video track ended before a frame arrived".to_string(),
                ));
            }
            Err(_) => {
                return Err(PipelineError::CaptureFailed(format!(
                    "no frame within {}ms",
                    self.frame_timeout.as_millis()
                )));
            }
        };

        let quality = self.quality;
        tokio::task::spawn_blocking(move || CapturedImage::from_encoded(&frame, quality))
            .await
            .map_err(|err| PipelineError::CaptureFailed(format!("encoder task failed: {err}")))?
    }
}
