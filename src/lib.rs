pub mod analysis;
pub mod common;
pub mod config;
pub mod controller;
pub mod convert;
pub mod error;
pub mod metrics;
pub mod router;
pub mod sink;
pub mod source;

pub use config::Configuration;
pub use controller::{PipelineController, PipelineState};
pub use error::{AppError, PipelineError};
pub use sink::{ResultEvent, ResultSubscription};
pub use source::{CaptureConfig, FrameSource, SyntheticCamera};
