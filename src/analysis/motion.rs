use super::{luma_grid, AnalysisPayload, AnalysisResult, FrameAnalyzer, MotionSummary};
use crate::common::ConversionResult;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::time::Instant;

/// Frame differencing over a coarse luma grid. Keeps the previous
/// frame's grid between calls; the first frame of a stream reports zero
/// motion. A resolution change mid-stream resets the baseline.
pub struct MotionAnalyzer {
    cells: u32,
    cell_change_threshold: f32,
    previous: Option<(u32, u32, Vec<f32>)>,
}

impl MotionAnalyzer {
    pub fn new() -> Self {
        Self {
            cells: 16,
            cell_change_threshold: 12.0,
            previous: None,
        }
    }

    pub fn with_cell_threshold(mut self, threshold: f32) -> Self {
        self.cell_change_threshold = threshold;
        self
    }
}

impl Default for MotionAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameAnalyzer for MotionAnalyzer {
    fn name(&self) -> &'static str {
        "motion"
    }

    async fn analyze(&mut self, input: &ConversionResult) -> Result<AnalysisResult, PipelineError> {
        let start = Instant::now();
        let image = input.image();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(PipelineError::Analysis {
                sequence: input.sequence(),
                cause: "empty image".into(),
            });
        }

        let grid = luma_grid(image, self.cells);
        let total_cells = grid.len();

        let summary = match self.previous.take() {
            Some((pw, ph, previous)) if (pw, ph) == (width, height) => {
                let mut changed_cells = 0;
                let mut accumulated = 0.0f32;
                for (now, then) in grid.iter().zip(&previous) {
                    let delta = (now - then).abs();
                    accumulated += delta;
                    if delta > self.cell_change_threshold {
                        changed_cells += 1;
                    }
                }
                MotionSummary {
                    score: (accumulated / total_cells as f32 / 255.0).clamp(0.0, 1.0),
                    changed_cells,
                    total_cells,
                }
            }
            _ => MotionSummary {
                score: 0.0,
                changed_cells: 0,
                total_cells,
            },
        };
        self.previous = Some((width, height, grid));

        Ok(AnalysisResult {
            sequence: input.sequence(),
            analyzer: self.name(),
            captured_at: input.captured_at(),
            elapsed: start.elapsed(),
            payload: AnalysisPayload::Motion(summary),
        })
    }
}
