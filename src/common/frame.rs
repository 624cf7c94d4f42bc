use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Deserialize;
use std::sync::Arc;

/// Pixel layouts a capture device may hand us. `Rgb8` is the layout the
/// analysis stage consumes; everything else goes through the converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Planar Y followed by interleaved V/U at half resolution.
    Nv21,
    /// Planar Y, then U, then V, chroma at half resolution.
    I420,
    /// Packed 8-bit RGB.
    Rgb8,
    /// Compressed output some devices report; the converter rejects it.
    Jpeg,
}

impl PixelFormat {
    /// Expected buffer length for an uncompressed frame of this format.
    /// `None` for compressed formats, where the length is data-dependent.
    /// Chroma planes round up at odd dimensions, so a 4:2:0 buffer always
    /// holds a chroma sample for the last row and column.
    pub fn buffer_len(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv21 | PixelFormat::I420 => {
                let (cw, ch) = chroma_dims(width, height);
                Some(pixels + 2 * cw * ch)
            }
            PixelFormat::Rgb8 => Some(pixels * 3),
            PixelFormat::Jpeg => None,
        }
    }
}

/// Chroma plane dimensions for 4:2:0 layouts, rounded up.
pub(crate) fn chroma_dims(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
}

/// One captured image. Immutable once produced; ownership moves
/// stage-to-stage through the pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
    /// Monotonic capture timestamp, nanoseconds since the stream opened.
    timestamp_ns: u64,
    /// Strictly increasing within one capture session; gaps allowed.
    sequence: u64,
    captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Bytes,
        timestamp_ns: u64,
        sequence: u64,
    ) -> Self {
        Self {
            width,
            height,
            format,
            data,
            timestamp_ns,
            sequence,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

/// A frame normalized to RGB, tagged with the sequence number of the
/// source frame it came from. The image is shared read-only so the
/// buffer pool can reclaim it once the last holder lets go.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    image: Arc<RgbImage>,
    sequence: u64,
    timestamp_ns: u64,
    captured_at: DateTime<Utc>,
}

impl ConversionResult {
    pub fn new(
        image: RgbImage,
        sequence: u64,
        timestamp_ns: u64,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
            timestamp_ns,
            captured_at,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// Wall-clock capture time of the source frame, for result
    /// timestamping and end-to-end latency reporting.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn into_image(self) -> Arc<RgbImage> {
        self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_len_matches_yuv_and_rgb_layouts() {
        assert_eq!(PixelFormat::Nv21.buffer_len(4, 4), Some(24));
        assert_eq!(PixelFormat::I420.buffer_len(4, 4), Some(24));
        assert_eq!(PixelFormat::Rgb8.buffer_len(4, 4), Some(48));
        assert_eq!(PixelFormat::Jpeg.buffer_len(4, 4), None);
    }

    #[test]
    fn buffer_len_rounds_chroma_up_at_odd_dimensions() {
        // 3x3: 9 luma + two 2x2 chroma planes.
        assert_eq!(PixelFormat::Nv21.buffer_len(3, 3), Some(17));
        assert_eq!(PixelFormat::I420.buffer_len(3, 3), Some(17));
        // 5x4: 20 luma + two 3x2 chroma planes.
        assert_eq!(PixelFormat::Nv21.buffer_len(5, 4), Some(32));
    }

    #[test]
    fn cloning_conversion_result_shares_image_buffer() {
        let image = RgbImage::from_pixel(8, 8, image::Rgb([9, 9, 9]));
        let a = ConversionResult::new(image, 1, 0, Utc::now());
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.image, &b.image));
    }
}
