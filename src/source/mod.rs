pub mod synthetic;

pub use synthetic::SyntheticCamera;

use crate::common::{Frame, PixelFormat};
use crate::error::PipelineError;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Capture parameters handed down from the host shell.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Nv21,
        }
    }
}

/// Abstracts the camera device. Opening yields a lazy, infinite,
/// non-restartable frame sequence that ends when the handle's device
/// guard is dropped, or with an error item on device loss.
#[async_trait]
pub trait FrameSource: Send {
    async fn open(&mut self, config: &CaptureConfig) -> Result<CaptureHandle, PipelineError>;
}

/// A running capture session: the frame stream plus the guard that owns
/// the physical device for the session's lifetime.
#[derive(Debug)]
pub struct CaptureHandle {
    session: Uuid,
    frames: mpsc::Receiver<Result<Frame, PipelineError>>,
    _guard: DeviceGuard,
}

impl CaptureHandle {
    pub fn new(
        session: Uuid,
        frames: mpsc::Receiver<Result<Frame, PipelineError>>,
        guard: DeviceGuard,
    ) -> Self {
        Self {
            session,
            frames,
            _guard: guard,
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// `None` once the device worker has shut down.
    pub async fn next_frame(&mut self) -> Option<Result<Frame, PipelineError>> {
        self.frames.recv().await
    }
}

/// Scoped ownership of the capture device. Dropping the guard cancels
/// the device worker, which releases the device on its way out; there is
/// no other release path, so release happens exactly once on every exit.
#[derive(Debug)]
pub struct DeviceGuard {
    session: Uuid,
    cancel: CancellationToken,
}

impl DeviceGuard {
    pub fn new(session: Uuid, cancel: CancellationToken) -> Self {
        Self { session, cancel }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        tracing::debug!(session = %self.session, "releasing capture device");
        self.cancel.cancel();
    }
}
