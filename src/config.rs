use crate::analysis::AnalyzerKind;
use crate::source::CaptureConfig;
use serde::Deserialize;
use std::path::Path;

/// Runtime configuration, loadable from a TOML file with
/// `VISIONPIPE_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub capture: CaptureConfig,
    pub analyzer: AnalyzerKind,
    /// How often the reporter task logs counters and the drop count.
    pub drop_report_interval_ms: u64,
    /// How long `stop()` waits for workers before aborting them.
    pub drain_timeout_ms: u64,
    /// Spare RGB buffers kept for reuse between frames.
    pub buffer_pool_spares: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            analyzer: AnalyzerKind::LumaRegions,
            drop_report_interval_ms: 1_000,
            drain_timeout_ms: 500,
            buffer_pool_spares: 4,
        }
    }
}

impl Configuration {
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder
            .add_source(config::Environment::with_prefix("VISIONPIPE").separator("__"))
            .build()?
            .try_deserialize()
    }
}
