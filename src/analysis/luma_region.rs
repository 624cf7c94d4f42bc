use super::{luma_grid, AnalysisPayload, AnalysisResult, DetectedRegion, FrameAnalyzer};
use crate::common::ConversionResult;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::time::Instant;

const MIN_IMAGE_DIM: u32 = 16;

/// Flags grid cells whose mean luma exceeds a threshold. Cheap stand-in
/// for a detector stage: bright UI elements, headlights, overexposed
/// patches all light it up.
pub struct LumaRegionAnalyzer {
    cells: u32,
    threshold: f32,
}

impl LumaRegionAnalyzer {
    pub fn new() -> Self {
        Self {
            cells: 8,
            threshold: 200.0,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_grid(mut self, cells: u32) -> Self {
        self.cells = cells.max(1);
        self
    }
}

impl Default for LumaRegionAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameAnalyzer for LumaRegionAnalyzer {
    fn name(&self) -> &'static str {
        "luma_regions"
    }

    async fn analyze(&mut self, input: &ConversionResult) -> Result<AnalysisResult, PipelineError> {
        let start = Instant::now();
        let image = input.image();
        let (width, height) = image.dimensions();
        if width < MIN_IMAGE_DIM || height < MIN_IMAGE_DIM {
            return Err(PipelineError::Analysis {
                sequence: input.sequence(),
                cause: format!("image too small for region analysis: {width}x{height}"),
            });
        }

        let grid = luma_grid(image, self.cells);
        let cell_w = width / self.cells;
        let cell_h = height / self.cells;
        let headroom = (255.0 - self.threshold).max(1.0);

        let mut regions: Vec<DetectedRegion> = grid
            .iter()
            .enumerate()
            .filter(|(_, &mean)| mean > self.threshold)
            .map(|(index, &mean)| {
                let col = index as u32 % self.cells;
                let row = index as u32 / self.cells;
                DetectedRegion {
                    x: col * cell_w,
                    y: row * cell_h,
                    width: cell_w,
                    height: cell_h,
                    confidence: ((mean - self.threshold) / headroom).clamp(0.0, 1.0),
                    mean_luma: mean,
                }
            })
            .collect();
        regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        Ok(AnalysisResult {
            sequence: input.sequence(),
            analyzer: self.name(),
            captured_at: input.captured_at(),
            elapsed: start.elapsed(),
            payload: AnalysisPayload::Regions(regions),
        })
    }
}
