use super::{CaptureConfig, CaptureHandle, DeviceGuard, FrameSource};
use crate::common::frame::chroma_dims;
use crate::common::{Frame, PixelFormat};
use crate::error::PipelineError;
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const FRAME_CHANNEL_CAPACITY: usize = 4;

/// In-process capture source that synthesizes test frames at the target
/// rate: a dark gradient with a bright square orbiting it, plus a little
/// sensor noise. Models single-owner device semantics (a second `open`
/// while running fails) and supports injected mid-stream device loss for
/// fault testing.
pub struct SyntheticCamera {
    in_use: Arc<AtomicBool>,
    fail_after: Option<u64>,
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self {
            in_use: Arc::new(AtomicBool::new(false)),
            fail_after: None,
        }
    }

    /// Reports `DeviceLost` after producing this many frames.
    pub fn fail_after_frames(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSource for SyntheticCamera {
    async fn open(&mut self, config: &CaptureConfig) -> Result<CaptureHandle, PipelineError> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(PipelineError::DeviceUnavailable(format!(
                "invalid capture config: {}x{} @ {} fps",
                config.width, config.height, config.fps
            )));
        }
        if config.format == PixelFormat::Jpeg {
            return Err(PipelineError::DeviceUnavailable(
                "synthetic camera cannot encode jpeg".into(),
            ));
        }
        if self.in_use.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::DeviceUnavailable(
                "capture device already in use".into(),
            ));
        }

        let session = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        let worker = DeviceWorker {
            config: config.clone(),
            fail_after: self.fail_after,
            in_use: self.in_use.clone(),
            frame_tx,
            session,
        };
        tokio::spawn(worker.run(cancel.clone()));

        tracing::info!(
            %session,
            width = config.width,
            height = config.height,
            fps = config.fps,
            format = ?config.format,
            "synthetic capture device opened"
        );
        Ok(CaptureHandle::new(
            session,
            frame_rx,
            DeviceGuard::new(session, cancel),
        ))
    }
}

struct DeviceWorker {
    config: CaptureConfig,
    fail_after: Option<u64>,
    in_use: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<Result<Frame, PipelineError>>,
    session: Uuid,
}

impl DeviceWorker {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs_f64(1.0 / self.config.fps as f64));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let epoch = Instant::now();
        let mut sequence: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    sequence += 1;
                    if self.fail_after.is_some_and(|limit| sequence > limit) {
                        let _ = self
                            .frame_tx
                            .send(Err(PipelineError::DeviceLost(
                                "synthetic device disconnected".into(),
                            )))
                            .await;
                        break;
                    }
                    let frame = self.render(sequence, epoch.elapsed().as_nanos() as u64);
                    match self.frame_tx.try_send(Ok(frame)) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // The device never waits on a slow reader.
                            tracing::trace!(sequence, "frame channel full, frame dropped at device");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
        }

        self.in_use.store(false, Ordering::Release);
        tracing::debug!(session = %self.session, "synthetic capture device stopped");
    }

    fn render(&self, sequence: u64, timestamp_ns: u64) -> Frame {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut rng = rand::rng();

        // Luma: dim gradient background with a bright square that steps
        // one cell per frame so motion analyzers have something to see.
        let mut luma = vec![0u8; w * h];
        let square = (w / 8).max(2);
        let sx = (sequence as usize * square / 2) % w.saturating_sub(square).max(1);
        let sy = h / 2;
        for row in 0..h {
            for col in 0..w {
                let gradient = ((row + col) % 64) as u8;
                let inside = col >= sx
                    && col < sx + square
                    && row >= sy
                    && row < (sy + square).min(h);
                let noise: u8 = rng.random_range(0..8);
                luma[row * w + col] = if inside {
                    255 - noise
                } else {
                    gradient.saturating_add(noise)
                };
            }
        }

        let data = match self.config.format {
            PixelFormat::Nv21 | PixelFormat::I420 => {
                let (cw, ch) = chroma_dims(self.config.width, self.config.height);
                let mut data = luma;
                // Neutral chroma; the scene is grayscale either way.
                data.resize(w * h + 2 * cw * ch, 128);
                data
            }
            PixelFormat::Rgb8 => luma.iter().flat_map(|&y| [y, y, y]).collect(),
            PixelFormat::Jpeg => unreachable!("rejected at open"),
        };

        Frame::new(
            self.config.width,
            self.config.height,
            self.config.format,
            Bytes::from(data),
            timestamp_ns,
            sequence,
        )
    }
}
