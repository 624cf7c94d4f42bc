use std::path::Path;
use tracing::Level;
use visionpipe::{AppError, Configuration, PipelineController, ResultEvent, SyntheticCamera};

fn init_logging() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();

    let config_path = std::env::args().nth(1);
    let configuration = Configuration::load(config_path.as_deref().map(Path::new))?;

    let mut controller = PipelineController::new(configuration);
    let mut results = controller.subscribe();
    let consumer = tokio::spawn(async move {
        while let Some(event) = results.next().await {
            match event {
                ResultEvent::Analyzed(result) => {
                    let latency_ms = (chrono::Utc::now() - result.captured_at).num_milliseconds();
                    tracing::info!(
                        sequence = result.sequence,
                        analyzer = result.analyzer,
                        elapsed_us = result.elapsed.as_micros() as u64,
                        latency_ms,
                        "analysis result"
                    )
                }
                ResultEvent::Skipped { sequence, reason } => {
                    tracing::warn!(sequence, %reason, "frame skipped")
                }
            }
        }
    });

    let mut camera = SyntheticCamera::new();
    controller.start(&mut camera).await?;

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
    controller.stop().await?;
    consumer.abort();
    Ok(())
}
