use crate::common::frame::chroma_dims;
use crate::common::{ConversionResult, Frame, PixelFormat};
use crate::error::PipelineError;
use image::RgbImage;
use std::sync::{Arc, Mutex, MutexGuard};

/// Recycles RGB buffers between frames so steady-state conversion does
/// not allocate. Checked out by the converter on the capture path and
/// reclaimed by the analysis worker once it is the last holder.
pub struct BufferPool {
    spares: Mutex<Vec<Vec<u8>>>,
    max_spares: usize,
}

impl BufferPool {
    pub fn new(max_spares: usize) -> Arc<Self> {
        Arc::new(Self {
            spares: Mutex::new(Vec::new()),
            max_spares,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.spares.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn checkout(&self, len: usize) -> Vec<u8> {
        let mut buf = self.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Returns an image buffer to the pool if nothing else still holds it.
    pub fn reclaim(&self, image: Arc<RgbImage>) {
        if let Some(image) = Arc::into_inner(image) {
            let mut spares = self.lock();
            if spares.len() < self.max_spares {
                spares.push(image.into_raw());
            }
        }
    }

    pub fn spare_count(&self) -> usize {
        self.lock().len()
    }
}

/// Normalizes captured frames to packed RGB for the analysis stage.
/// Pure per-frame transform over a reusable buffer pool; bounded time
/// proportional to frame size. A conversion failure drops that frame
/// only, the pipeline continues.
pub struct FormatConverter {
    pool: Arc<BufferPool>,
}

impl FormatConverter {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    pub fn convert(&mut self, frame: Frame) -> Result<ConversionResult, PipelineError> {
        let (width, height) = (frame.width(), frame.height());
        let expected = frame
            .format()
            .buffer_len(width, height)
            .ok_or(PipelineError::UnsupportedFormat(frame.format()))?;
        if frame.data().len() < expected {
            // A short buffer means the device metadata lied about the
            // layout; treat it the same as an unknown format.
            return Err(PipelineError::UnsupportedFormat(frame.format()));
        }

        let mut rgb = self.pool.checkout(width as usize * height as usize * 3);
        match frame.format() {
            PixelFormat::Rgb8 => rgb.copy_from_slice(&frame.data()[..expected]),
            PixelFormat::Nv21 => nv21_to_rgb(frame.data(), width, height, &mut rgb),
            PixelFormat::I420 => i420_to_rgb(frame.data(), width, height, &mut rgb),
            PixelFormat::Jpeg => unreachable!("rejected by buffer_len"),
        }

        let image = RgbImage::from_raw(width, height, rgb)
            .ok_or(PipelineError::UnsupportedFormat(frame.format()))?;
        Ok(ConversionResult::new(
            image,
            frame.sequence(),
            frame.timestamp_ns(),
            frame.captured_at(),
        ))
    }
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    // BT.601, full-range luma, matching the NV21 path of the capture
    // stacks this crate models.
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    [
        r.clamp(0.0, 255.0) as u8,
        g.clamp(0.0, 255.0) as u8,
        b.clamp(0.0, 255.0) as u8,
    ]
}

/// Y plane, then interleaved V/U rows at half vertical resolution. The
/// interleaved rows hold one V/U pair per chroma column, so odd widths
/// stride by the rounded-up column count.
fn nv21_to_rgb(data: &[u8], width: u32, height: u32, rgb: &mut [u8]) {
    let (w, h) = (width as usize, height as usize);
    let (cw, _) = chroma_dims(width, height);
    let uv_base = w * h;
    for row in 0..h {
        for col in 0..w {
            let y = data[row * w + col];
            let uv = uv_base + (row / 2) * cw * 2 + (col / 2) * 2;
            let v = data[uv];
            let u = data[uv + 1];
            let px = (row * w + col) * 3;
            rgb[px..px + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
}

/// Y plane, then the U plane, then the V plane, chroma at half
/// resolution in both dimensions (rounded up at odd sizes).
fn i420_to_rgb(data: &[u8], width: u32, height: u32, rgb: &mut [u8]) {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = chroma_dims(width, height);
    let u_base = w * h;
    let v_base = u_base + cw * ch;
    for row in 0..h {
        for col in 0..w {
            let y = data[row * w + col];
            let chroma = (row / 2) * cw + col / 2;
            let u = data[u_base + chroma];
            let v = data[v_base + chroma];
            let px = (row * w + col) * 3;
            rgb[px..px + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
}
