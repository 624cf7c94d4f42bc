use crate::analysis::{build_analyzer, FrameAnalyzer};
use crate::config::Configuration;
use crate::convert::{BufferPool, FormatConverter};
use crate::error::PipelineError;
use crate::metrics::PipelineMetrics;
use crate::router::FrameRouter;
use crate::sink::{ResultEvent, ResultSink, ResultSubscription};
use crate::source::{CaptureHandle, FrameSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of the processing pipeline. One instance per controller;
/// transitions happen only through controller operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
    Failed(String),
}

type AnalyzerFactory = Box<dyn Fn() -> Box<dyn FrameAnalyzer> + Send + Sync>;

/// Owns the pipeline lifecycle: wires source, converter, router,
/// analyzer and sink into cooperating workers, supervises their errors,
/// and exposes the contract the host shell consumes.
///
/// Frame-local errors never leave their stage; capture- and
/// resource-fatal errors transition the state machine to `Failed` with a
/// human-readable reason, and the host decides whether to `start` again.
/// The controller never retries on its own.
pub struct PipelineController {
    config: Configuration,
    analyzer_factory: AnalyzerFactory,
    state: Arc<watch::Sender<PipelineState>>,
    paused: Arc<watch::Sender<bool>>,
    sink: Arc<ResultSink>,
    metrics: Arc<PipelineMetrics>,
    session: Option<Session>,
}

struct Session {
    id: Uuid,
    cancel: CancellationToken,
    router: Arc<FrameRouter>,
    workers: JoinSet<()>,
}

impl PipelineController {
    pub fn new(config: Configuration) -> Self {
        let kind = config.analyzer;
        Self::with_analyzer_factory(config, move || build_analyzer(kind))
    }

    /// Same controller with a caller-supplied analyzer constructor; each
    /// session gets a fresh analyzer so per-stream state never leaks
    /// across restarts.
    pub fn with_analyzer_factory<F>(config: Configuration, factory: F) -> Self
    where
        F: Fn() -> Box<dyn FrameAnalyzer> + Send + Sync + 'static,
    {
        let (state, _) = watch::channel(PipelineState::Idle);
        let (paused, _) = watch::channel(false);
        Self {
            config,
            analyzer_factory: Box::new(factory),
            state: Arc::new(state),
            paused: Arc::new(paused),
            sink: Arc::new(ResultSink::new()),
            metrics: Arc::new(PipelineMetrics::new()),
            session: None,
        }
    }

    pub fn current_state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    /// State transitions for the host shell, including the reason string
    /// on `Failed`.
    pub fn state_changes(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> ResultSubscription {
        self.sink.subscribe()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|session| session.id)
    }

    /// Frames the router overwrote unconsumed in the current session.
    pub fn dropped_frames(&self) -> u64 {
        self.session
            .as_ref()
            .map(|session| session.router.dropped())
            .unwrap_or_else(|| self.metrics.snapshot().dropped)
    }

    /// Acquires the device and brings the pipeline to `Running`. Valid
    /// from `Idle`, `Stopped` and `Failed`; a pipeline that is already
    /// starting or running rejects the call.
    pub async fn start<S: FrameSource>(&mut self, source: &mut S) -> Result<(), PipelineError> {
        match self.current_state() {
            PipelineState::Idle | PipelineState::Stopped | PipelineState::Failed(_) => {}
            state => return Err(PipelineError::InvalidTransition { op: "start", state }),
        }
        // A failed session's workers are already winding down; join them
        // before acquiring the device again.
        self.teardown_session().await;

        self.state.send_replace(PipelineState::Starting);
        self.paused.send_replace(false);
        self.metrics.reset();

        let handle = match source.open(&self.config.capture).await {
            Ok(handle) => handle,
            Err(err) => {
                self.state
                    .send_replace(PipelineState::Failed(err.to_string()));
                return Err(err);
            }
        };

        let id = handle.session();
        let cancel = CancellationToken::new();
        let router = Arc::new(FrameRouter::new());
        let pool = BufferPool::new(self.config.buffer_pool_spares);
        let shared = WorkerShared {
            state: self.state.clone(),
            cancel: cancel.clone(),
            router: router.clone(),
            metrics: self.metrics.clone(),
        };

        let mut workers = JoinSet::new();
        workers.spawn(capture_worker(
            handle,
            FormatConverter::new(pool.clone()),
            shared.clone(),
        ));
        workers.spawn(analysis_worker(
            (self.analyzer_factory)(),
            self.sink.clone(),
            pool,
            self.paused.subscribe(),
            shared.clone(),
        ));
        workers.spawn(report_worker(
            Duration::from_millis(self.config.drop_report_interval_ms.max(1)),
            shared,
        ));

        self.session = Some(Session {
            id,
            cancel,
            router,
            workers,
        });
        // A worker may have already escalated to Failed; never clobber it.
        let running = self.state.send_if_modified(|state| match state {
            PipelineState::Starting => {
                *state = PipelineState::Running;
                true
            }
            _ => false,
        });
        if running {
            tracing::info!(session = %id, "pipeline running");
        }
        Ok(())
    }

    /// Drains and stops the pipeline, releasing the capture device.
    /// Idempotent from `Running`, `Draining` and `Stopped`; from
    /// `Failed` it only joins the already-cancelled workers.
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        match self.current_state() {
            PipelineState::Running | PipelineState::Draining => {
                self.state.send_replace(PipelineState::Draining);
                self.teardown_session().await;
                self.state.send_replace(PipelineState::Stopped);
                Ok(())
            }
            PipelineState::Stopped => Ok(()),
            PipelineState::Failed(_) => {
                self.teardown_session().await;
                Ok(())
            }
            state => Err(PipelineError::InvalidTransition { op: "stop", state }),
        }
    }

    /// Suspends analysis without releasing the device. Capture keeps
    /// running and the router keeps coalescing, so consumers simply see
    /// no new results until `resume`.
    pub fn pause(&self) -> Result<(), PipelineError> {
        match self.current_state() {
            PipelineState::Running => {
                self.paused.send_replace(true);
                tracing::info!("analysis paused");
                Ok(())
            }
            state => Err(PipelineError::InvalidTransition { op: "pause", state }),
        }
    }

    pub fn resume(&self) -> Result<(), PipelineError> {
        match self.current_state() {
            PipelineState::Running => {
                self.paused.send_replace(false);
                tracing::info!("analysis resumed");
                Ok(())
            }
            state => Err(PipelineError::InvalidTransition { op: "resume", state }),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn teardown_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.cancel.cancel();
        session.router.close();

        let drain = Duration::from_millis(self.config.drain_timeout_ms.max(1));
        let drained = tokio::time::timeout(drain, async {
            while session.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(session = %session.id, "drain timeout exceeded, aborting workers");
            session.workers.abort_all();
            while session.workers.join_next().await.is_some() {}
        }

        self.metrics.set_dropped(session.router.dropped());
        tracing::info!(session = %session.id, "capture session released");
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
            session.router.close();
        }
    }
}

/// Handles every worker needs: cancellation, the router, the shared
/// counters, and the state channel for fatal-error escalation.
#[derive(Clone)]
struct WorkerShared {
    state: Arc<watch::Sender<PipelineState>>,
    cancel: CancellationToken,
    router: Arc<FrameRouter>,
    metrics: Arc<PipelineMetrics>,
}

impl WorkerShared {
    /// Moves the pipeline to `Failed` (unless it is already draining or
    /// done) and winds the session down. Safe to call from any worker.
    fn escalate(&self, err: PipelineError) {
        tracing::error!(error = %err, "fatal pipeline error");
        self.fail(err.to_string());
    }

    fn fail(&self, reason: String) {
        self.state.send_if_modified(|state| match state {
            PipelineState::Starting | PipelineState::Running => {
                *state = PipelineState::Failed(reason);
                true
            }
            _ => false,
        });
        self.cancel.cancel();
        self.router.close();
    }
}

/// Fails the pipeline if its worker unwinds or returns while the session
/// is still live. A panic inside a spawned task is otherwise invisible
/// until teardown joins it, which would leave the state stuck at
/// `Running` over a dead frame stream.
struct WorkerGuard {
    worker: &'static str,
    shared: WorkerShared,
}

impl WorkerGuard {
    fn new(worker: &'static str, shared: &WorkerShared) -> Self {
        Self {
            worker,
            shared: shared.clone(),
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.shared.cancel.is_cancelled() {
            tracing::error!(worker = self.worker, "worker exited unexpectedly");
            self.shared
                .fail(format!("{} worker exited unexpectedly", self.worker));
        }
    }
}

/// Capture-rate producer: pulls frames off the device, converts them and
/// submits to the router. Never blocks on the analysis side.
async fn capture_worker(
    mut handle: CaptureHandle,
    mut converter: FormatConverter,
    shared: WorkerShared,
) {
    let _guard = WorkerGuard::new("capture", &shared);
    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = handle.next_frame() => next,
        };
        match next {
            Some(Ok(frame)) => {
                shared.metrics.record_captured(frame.timestamp_ns());
                let sequence = frame.sequence();
                match converter.convert(frame) {
                    Ok(result) => {
                        shared.metrics.record_converted();
                        shared.router.submit(result);
                    }
                    Err(err) if err.is_frame_local() => {
                        shared.metrics.record_convert_failure();
                        tracing::warn!(sequence, error = %err, "frame dropped, conversion failed");
                    }
                    Err(err) => {
                        shared.escalate(err);
                        break;
                    }
                }
            }
            Some(Err(err)) => {
                shared.escalate(err);
                break;
            }
            None => {
                if !shared.cancel.is_cancelled() {
                    shared.escalate(PipelineError::DeviceLost(
                        "frame stream ended unexpectedly".into(),
                    ));
                }
                break;
            }
        }
    }
    // The handle (and with it the device guard) drops here; that is the
    // single release path for the capture device.
}

/// Analysis-rate consumer: at most one analysis in flight, always on the
/// freshest frame the router holds.
async fn analysis_worker(
    mut analyzer: Box<dyn FrameAnalyzer>,
    sink: Arc<ResultSink>,
    pool: Arc<BufferPool>,
    mut paused: watch::Receiver<bool>,
    shared: WorkerShared,
) {
    tracing::debug!(analyzer = analyzer.name(), "analysis worker started");
    let _guard = WorkerGuard::new("analysis", &shared);
    loop {
        if *paused.borrow_and_update() {
            // Wait out the pause; the router keeps coalescing meanwhile.
            tokio::select! {
                _ = shared.cancel.cancelled() => return,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }

        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = shared.router.take() => next,
        };
        let Some(input) = next else {
            break; // end of stream
        };

        let sequence = input.sequence();
        match analyzer.analyze(&input).await {
            Ok(result) => {
                shared.metrics.record_published();
                sink.publish(ResultEvent::Analyzed(Arc::new(result)));
            }
            Err(err) if err.is_frame_local() => {
                shared.metrics.record_skipped();
                tracing::warn!(sequence, error = %err, "frame skipped, analysis failed");
                sink.publish(ResultEvent::Skipped {
                    sequence,
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                shared.escalate(err);
                break;
            }
        }
        pool.reclaim(input.into_image());
    }
}

/// Periodically copies the router's drop counter into the shared metrics
/// and logs a one-line report.
async fn report_worker(interval: Duration, shared: WorkerShared) {
    let _guard = WorkerGuard::new("report", &shared);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // the immediate first tick
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.metrics.set_dropped(shared.router.dropped());
                let snapshot = shared.metrics.snapshot();
                tracing::info!(
                    captured = snapshot.captured,
                    converted = snapshot.converted,
                    dropped = snapshot.dropped,
                    published = snapshot.published,
                    skipped = snapshot.skipped,
                    capture_fps = snapshot.capture_fps,
                    "pipeline counters"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SyntheticCamera;

    fn controller() -> PipelineController {
        let mut config = Configuration::default();
        config.capture.width = 64;
        config.capture.height = 48;
        config.capture.fps = 60;
        PipelineController::new(config)
    }

    #[tokio::test]
    async fn starts_idle() {
        let controller = controller();
        assert_eq!(controller.current_state(), PipelineState::Idle);
        assert!(!controller.is_paused());
    }

    #[tokio::test]
    async fn start_twice_is_an_invalid_transition() {
        let mut controller = controller();
        let mut camera = SyntheticCamera::new();
        controller.start(&mut camera).await.unwrap();
        let err = controller.start(&mut camera).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition { op: "start", .. }
        ));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_from_idle_is_an_invalid_transition() {
        let mut controller = controller();
        let err = controller.stop().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InvalidTransition { op: "stop", .. }
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent_once_stopped() {
        let mut controller = controller();
        let mut camera = SyntheticCamera::new();
        controller.start(&mut camera).await.unwrap();
        controller.stop().await.unwrap();
        assert_eq!(controller.current_state(), PipelineState::Stopped);
        controller.stop().await.unwrap();
        assert_eq!(controller.current_state(), PipelineState::Stopped);
    }

    #[tokio::test]
    async fn pause_requires_running() {
        let controller = controller();
        assert!(matches!(
            controller.pause(),
            Err(PipelineError::InvalidTransition { op: "pause", .. })
        ));
        assert!(matches!(
            controller.resume(),
            Err(PipelineError::InvalidTransition { op: "resume", .. })
        ));
    }

    #[tokio::test]
    async fn device_unavailable_at_start_surfaces_and_fails() {
        let mut config = Configuration::default();
        config.capture.width = 0;
        let mut controller = PipelineController::new(config);
        let mut camera = SyntheticCamera::new();
        let err = controller.start(&mut camera).await.unwrap_err();
        assert!(matches!(err, PipelineError::DeviceUnavailable(_)));
        assert!(matches!(
            controller.current_state(),
            PipelineState::Failed(_)
        ));
    }
}
