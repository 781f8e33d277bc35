use bytes::{Bytes, BytesMut};
use tracing::debug;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Splits an MJPEG byte stream (multipart or bare concatenation) into frames.
///
/// The buffer either holds noise before the next frame or, while `in_frame`
/// is set, starts with the SOI of a frame whose EOI has not arrived yet.
pub struct MjpegSplitter {
    buffer: BytesMut,
    in_frame: bool,
    /// Bytes of the current frame already searched for an EOI.
    scanned: usize,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            in_frame: false,
            scanned: 0,
        }
    }

    /// Feeds a chunk and returns the newest complete frame, if any. Older
    /// complete frames in the same chunk are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        if self.buffer.len() + chunk.len() > MAX_BUFFER_BYTES {
            debug!("dropping {} buffered bytes of an oversized frame", self.buffer.len());
            self.reset();
        }
        self.buffer.extend_from_slice(chunk);

        let mut newest = None;
        loop {
            if !self.in_frame && !self.seek_frame_start() {
                break;
            }

            // Overlap by one byte so an EOI split across reads is still seen.
            let from = self.scanned.saturating_sub(1).max(JPEG_SOI.len());
            match find_marker(&self.buffer[from..], &JPEG_EOI) {
                Some(offset) => {
                    let end = from + offset + JPEG_EOI.len();
                    newest = Some(self.buffer.split_to(end).freeze());
                    self.in_frame = false;
                    self.scanned = 0;
                }
                None => {
                    self.scanned = self.buffer.len();
                    break;
                }
            }
        }

        newest
    }

    /// Drops noise up to the next SOI. Without one, only a trailing `0xFF`
    /// survives, since it may be the first half of a split marker.
    fn seek_frame_start(&mut self) -> bool {
        match find_marker(&self.buffer, &JPEG_SOI) {
            Some(start) => {
                let _ = self.buffer.split_to(start);
                self.in_frame = true;
                self.scanned = JPEG_SOI.len();
                true
            }
            None => {
                let keep = usize::from(self.buffer.last() == Some(&JPEG_SOI[0]));
                let _ = self.buffer.split_to(self.buffer.len() - keep);
                false
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.in_frame = false;
        self.scanned = 0;
    }
}

impl Default for MjpegSplitter {
    fn default() -> Self {
        Self::new()
    }
}

fn find_marker(buffer: &[u8], marker: &[u8; 2]) -> Option<usize> {
    buffer.windows(2).position(|w| w == marker)
}
