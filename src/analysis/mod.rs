pub mod luma_region;
pub mod motion;

pub use luma_region::LumaRegionAnalyzer;
pub use motion::MotionAnalyzer;

use crate::common::ConversionResult;
use crate::error::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Which analyzer the pipeline runs, selected from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    LumaRegions,
    Motion,
}

pub fn build_analyzer(kind: AnalyzerKind) -> Box<dyn FrameAnalyzer> {
    match kind {
        AnalyzerKind::LumaRegions => Box::new(LumaRegionAnalyzer::new()),
        AnalyzerKind::Motion => Box::new(MotionAnalyzer::new()),
    }
}

/// A rectangular region flagged by an analyzer, with a confidence score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectedRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
    pub mean_luma: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionSummary {
    /// Mean absolute luma change against the previous frame, 0.0..=1.0.
    pub score: f32,
    pub changed_cells: usize,
    pub total_cells: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisPayload {
    Regions(Vec<DetectedRegion>),
    Motion(MotionSummary),
}

/// Output of one analysis pass; immutable and shared read-only once
/// published.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub sequence: u64,
    pub analyzer: &'static str,
    /// Wall-clock capture time of the frame this result describes.
    pub captured_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub payload: AnalysisPayload,
}

/// Capability interface over interchangeable vision algorithms. One
/// analysis runs at a time; implementations may keep per-stream state
/// (previous frame, rolling statistics) between calls.
#[async_trait]
pub trait FrameAnalyzer: Send {
    fn name(&self) -> &'static str;

    /// Frame-local failures return `PipelineError::Analysis`; anything
    /// fatal (allocation, accelerator loss) returns `ResourceExhausted`
    /// and stops the pipeline.
    async fn analyze(&mut self, input: &ConversionResult) -> Result<AnalysisResult, PipelineError>;
}

/// Mean luma per cell of a `cells x cells` grid, the shared first step
/// of both built-in analyzers.
pub(crate) fn luma_grid(image: &image::RgbImage, cells: u32) -> Vec<f32> {
    let (width, height) = image.dimensions();
    let mut sums = vec![0.0f64; (cells * cells) as usize];
    let mut counts = vec![0u32; (cells * cells) as usize];
    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        let cell = ((y * cells / height) * cells + (x * cells / width)) as usize;
        sums[cell] += luma;
        counts[cell] += 1;
    }
    sums.iter()
        .zip(&counts)
        .map(|(sum, &count)| if count == 0 { 0.0 } else { (sum / count as f64) as f32 })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn luma_grid_averages_per_cell() {
        let mut image = RgbImage::from_pixel(8, 8, Rgb([0, 0, 0]));
        // Light up the top-left quadrant only.
        for y in 0..4 {
            for x in 0..4 {
                image.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let grid = luma_grid(&image, 2);
        assert_eq!(grid.len(), 4);
        assert!(grid[0] > 250.0);
        assert!(grid[1] < 1.0);
        assert!(grid[2] < 1.0);
        assert!(grid[3] < 1.0);
    }
}
