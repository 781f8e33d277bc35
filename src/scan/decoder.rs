use image::{GrayImage, imageops::FilterType};
use rqrr::PreparedImage;

use crate::core::errors::PipelineError;

/// Smallest frame that can hold a version-1 QR symbol.
const MIN_QR_DIM: u32 = 21;

pub trait CodeDecoder: Send + Sync {
    /// Checks that frames like `sample` can be fed to the decoder.
    fn prepare(&self, sample: &[u8]) -> Result<(), PipelineError>;

    /// Returns the first code readable in the encoded frame.
    fn decode(&self, frame: &[u8]) -> Option<String>;
}

/// QR decoding with `rqrr` on a greyscale copy of the frame, downsampled so
/// the long side is at most `max_dim` pixels.
#[derive(Debug, Clone)]
pub struct QrDecoder {
    max_dim: u32,
}

impl QrDecoder {
    pub fn new(max_dim: u32) -> Self {
        Self { max_dim }
    }

    fn greyscale(&self, frame: &[u8]) -> Result<GrayImage, String> {
        let luma = image::load_from_memory(frame)
            .map_err(|err| format!("undecodable frame: {err}"))?
            .to_luma8();
        let (w, h) = luma.dimensions();
        if self.max_dim == 0 || w.max(h) <= self.max_dim {
            return Ok(luma);
        }
        let factor = w.max(h) as f32 / self.max_dim as f32;
        let (nw, nh) = ((w as f32 / factor) as u32, (h as f32 / factor) as u32);
        Ok(image::imageops::resize(&luma, nw.max(1), nh.max(1), FilterType::Nearest))
    }
}

impl Default for QrDecoder {
    fn default() -> Self {
        Self::new(960)
    }
}

impl CodeDecoder for QrDecoder {
    fn prepare(&self, sample: &[u8]) -> Result<(), PipelineError> {
        let luma = self.greyscale(sample).map_err(PipelineError::DecoderInitFailed)?;
        let (w, h) = luma.dimensions();
        if w < MIN_QR_DIM || h < MIN_QR_DIM {
            return Err(PipelineError::DecoderInitFailed(format!(
                "frame {w}x{h} is too small for QR decoding"
            )));
        }
        Ok(())
    }

    fn decode(&self, frame: &[u8]) -> Option<String> {
        let luma = self.greyscale(frame).ok()?;
        let (w, h) = luma.dimensions();
        let mut prepared = PreparedImage::prepare_from_greyscale(w as usize, h as usize, |x, y| {
            luma.get_pixel(x as u32, y as u32)[0]
        });
        prepared
            .detect_grids()
            .into_iter()
            .find_map(|grid| grid.decode().ok().map(|(_, content)| content))
    }
}

#[cfg(test)]
mod tests {
    use crate::{camera::session::testing::jpeg_frame, core::errors::PipelineError};

    use super::{CodeDecoder, QrDecoder};

    #[test]
    fn tiny_frames_fail_decoder_init() {
        let err = QrDecoder::default()
            .prepare(&jpeg_frame(16, 16))
            .expect_err("16px cannot hold a QR code");
        assert!(matches!(err, PipelineError::DecoderInitFailed(_)));
    }

    #[test]
    fn undecodable_frames_fail_decoder_init() {
        let err = QrDecoder::default()
            .prepare(b"\xFF\xD8garbage")
            .expect_err("garbage is not a frame");
        assert!(matches!(err, PipelineError::DecoderInitFailed(_)));
    }

    #[test]
    fn blank_frame_decodes_to_nothing() {
        let decoder = QrDecoder::new(64);
        let frame = jpeg_frame(320, 240);
        decoder.prepare(&frame).expect("a 320x240 frame is usable");
        assert!(decoder.decode(&frame).is_none());
    }
}
