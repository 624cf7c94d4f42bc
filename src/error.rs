use crate::common::PixelFormat;
use crate::controller::PipelineState;
use thiserror::Error;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Pipeline Error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Pipeline error taxonomy. Frame-local errors are absorbed at the stage
/// that detected them and surfaced as counters/log lines; fatal errors
/// transition the pipeline to `Failed`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Capture device lost: {0}")]
    DeviceLost(String),
    #[error("Unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),
    #[error("Analysis failed for frame {sequence}: {cause}")]
    Analysis { sequence: u64, cause: String },
    #[error("Operation '{op}' is not valid in state {state:?}")]
    InvalidTransition {
        op: &'static str,
        state: PipelineState,
    },
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl PipelineError {
    /// Errors recovered by dropping the offending frame.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedFormat(_) | PipelineError::Analysis { .. }
        )
    }

    /// Errors that transition the pipeline to `Failed`.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::DeviceUnavailable(_)
                | PipelineError::DeviceLost(_)
                | PipelineError::ResourceExhausted(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_local_and_fatal_are_disjoint() {
        let local = PipelineError::UnsupportedFormat(PixelFormat::Jpeg);
        assert!(local.is_frame_local());
        assert!(!local.is_fatal());

        let fatal = PipelineError::DeviceLost("unplugged".into());
        assert!(fatal.is_fatal());
        assert!(!fatal.is_frame_local());

        let misuse = PipelineError::InvalidTransition {
            op: "start",
            state: PipelineState::Running,
        };
        assert!(!misuse.is_frame_local());
        assert!(!misuse.is_fatal());
    }
}
