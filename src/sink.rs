use crate::analysis::AnalysisResult;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

/// What the pipeline publishes for each frame the analysis stage took:
/// either a result or a marker that the frame was skipped.
#[derive(Debug, Clone)]
pub enum ResultEvent {
    Analyzed(Arc<AnalysisResult>),
    Skipped { sequence: u64, reason: String },
}

impl ResultEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            ResultEvent::Analyzed(result) => result.sequence,
            ResultEvent::Skipped { sequence, .. } => *sequence,
        }
    }
}

/// Fan-out of analysis results to any number of consumers. Built on a
/// watch channel, so publication never blocks and a slow consumer only
/// ever observes the latest event, mirroring the router's latest-wins
/// policy. Sequence numbers are non-decreasing within a session;
/// intermediate numbers may be missing.
pub struct ResultSink {
    tx: watch::Sender<Option<ResultEvent>>,
}

impl ResultSink {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, event: ResultEvent) {
        tracing::debug!(sequence = event.sequence(), "publishing result");
        self.tx.send_replace(Some(event));
    }

    pub fn subscribe(&self) -> ResultSubscription {
        ResultSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ResultSink {
    fn default() -> Self {
        Self::new()
    }
}

/// One consumer's view of the sink.
pub struct ResultSubscription {
    rx: watch::Receiver<Option<ResultEvent>>,
}

impl ResultSubscription {
    /// Waits for the next unseen event. `None` when the pipeline
    /// controller (and with it the sink) has gone away.
    pub async fn next(&mut self) -> Option<ResultEvent> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(event) = self.rx.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }

    /// The most recent event without waiting.
    pub fn latest(&mut self) -> Option<ResultEvent> {
        self.rx.borrow_and_update().clone()
    }

    /// Adapts the subscription into a `Stream` for combinator-style
    /// consumers. The first item is the current sink value, `None` until
    /// something has been published.
    pub fn into_stream(self) -> impl Stream<Item = Option<ResultEvent>> + Unpin {
        WatchStream::new(self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisPayload;
    use chrono::Utc;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn event(sequence: u64) -> ResultEvent {
        ResultEvent::Analyzed(Arc::new(AnalysisResult {
            sequence,
            analyzer: "test",
            captured_at: Utc::now(),
            elapsed: Duration::ZERO,
            payload: AnalysisPayload::Regions(Vec::new()),
        }))
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let sink = ResultSink::new();
        let mut sub = sink.subscribe();
        sink.publish(event(1));
        assert_eq!(sub.next().await.unwrap().sequence(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_sees_only_the_latest() {
        let sink = ResultSink::new();
        let mut sub = sink.subscribe();
        for seq in 1..=5 {
            sink.publish(event(seq));
        }
        assert_eq!(sub.next().await.unwrap().sequence(), 5);
        assert_eq!(sub.latest().unwrap().sequence(), 5);
    }

    #[tokio::test]
    async fn publish_proceeds_with_zero_subscribers() {
        let sink = ResultSink::new();
        sink.publish(event(1));
        sink.publish(ResultEvent::Skipped {
            sequence: 2,
            reason: "test".into(),
        });
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscription_ends_when_sink_drops() {
        let sink = ResultSink::new();
        let mut sub = sink.subscribe();
        drop(sink);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_adapter_yields_events_and_ends_with_the_sink() {
        let sink = ResultSink::new();
        let mut stream = sink.subscribe().into_stream();
        // Current value first: nothing published yet.
        assert!(stream.next().await.unwrap().is_none());
        sink.publish(event(9));
        let item = stream.next().await.unwrap().unwrap();
        assert_eq!(item.sequence(), 9);
        drop(sink);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let sink = ResultSink::new();
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        sink.publish(event(3));
        assert_eq!(a.next().await.unwrap().sequence(), 3);
        assert_eq!(b.next().await.unwrap().sequence(), 3);
    }
}
