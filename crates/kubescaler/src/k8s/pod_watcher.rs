use futures::Stream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::core::WatchEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::k8s::types::PodEvent;

/// Capacity of the channel between the watch forwarder and the scale loop.
/// A full channel blocks the forwarder, which in turn applies backpressure
/// to the watch.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Bridges a pod watch stream into a bounded event channel.
///
/// Events are forwarded in the order the orchestrator produced them. The
/// channel is closed exactly once: when the forwarder task exits and drops
/// its sender.
pub struct PodWatcher {
    events: mpsc::Receiver<PodEvent>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

impl PodWatcher {
    /// Spawn a forwarder consuming the given watch stream.
    pub(crate) fn spawn<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<WatchEvent<Pod>, kube::Error>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let forwarder = tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => {
                        let event = match item {
                            Some(Ok(WatchEvent::Added(pod))) => PodEvent::Added(pod),
                            Some(Ok(WatchEvent::Modified(pod))) => PodEvent::Modified(pod),
                            Some(Ok(WatchEvent::Deleted(pod))) => PodEvent::Deleted(pod),
                            Some(Ok(WatchEvent::Bookmark(_))) => continue,
                            Some(Ok(WatchEvent::Error(status))) => {
                                warn!(
                                    code = status.code,
                                    message = %status.message,
                                    "watch stream reported an error status"
                                );
                                continue;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "pod watch stream failed");
                                break;
                            }
                            None => break,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            events: rx,
            cancel,
            forwarder,
        }
    }

    /// Next event in orchestrator order, or `None` once the watch has ended
    /// and the channel is drained.
    pub async fn next_event(&mut self) -> Option<PodEvent> {
        self.events.recv().await
    }

    /// Close the underlying watch and wait for the forwarder to exit.
    pub async fn stop(self) {
        let Self {
            events,
            cancel,
            forwarder,
        } = self;

        cancel.cancel();
        // Dropping the receiver fails any send the forwarder may be parked on,
        // so the join below cannot deadlock on a full channel.
        drop(events);
        if let Err(e) = forwarder.await {
            warn!(error = %e, "pod watch forwarder terminated abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;

    use super::*;

    fn test_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    fn pod_name(event: &PodEvent) -> String {
        let pod = match event {
            PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod) => pod,
        };
        pod.metadata.name.clone().unwrap_or_default()
    }

    #[tokio::test]
    async fn forwards_events_in_stream_order() {
        let events = vec![
            Ok::<_, kube::Error>(WatchEvent::Added(test_pod("a"))),
            Ok(WatchEvent::Modified(test_pod("b"))),
            Ok(WatchEvent::Deleted(test_pod("c"))),
        ];
        let mut watcher = PodWatcher::spawn(stream::iter(events));

        let first = watcher.next_event().await.expect("first event");
        assert!(matches!(first, PodEvent::Added(_)));
        assert_eq!(pod_name(&first), "a");

        let second = watcher.next_event().await.expect("second event");
        assert!(matches!(second, PodEvent::Modified(_)));
        assert_eq!(pod_name(&second), "b");

        let third = watcher.next_event().await.expect("third event");
        assert!(matches!(third, PodEvent::Deleted(_)));
        assert_eq!(pod_name(&third), "c");

        // Stream exhausted: the forwarder exits and the channel closes.
        assert!(watcher.next_event().await.is_none());
    }

    #[tokio::test]
    async fn skips_error_statuses() {
        let events = vec![
            Ok::<_, kube::Error>(WatchEvent::Error(ErrorResponse {
                status: "Failure".to_string(),
                message: "too old resource version".to_string(),
                reason: "Expired".to_string(),
                code: 410,
            })),
            Ok(WatchEvent::Added(test_pod("a"))),
        ];
        let mut watcher = PodWatcher::spawn(stream::iter(events));

        let event = watcher.next_event().await.expect("event after status");
        assert_eq!(pod_name(&event), "a");
        assert!(watcher.next_event().await.is_none());
    }

    #[tokio::test]
    async fn forwards_bursts_larger_than_channel_capacity() {
        let events: Vec<Result<_, kube::Error>> = (0..40)
            .map(|i| Ok(WatchEvent::Added(test_pod(&format!("pod-{i}")))))
            .collect();
        let mut watcher = PodWatcher::spawn(stream::iter(events));

        for i in 0..40 {
            let event = watcher.next_event().await.expect("burst event");
            assert_eq!(pod_name(&event), format!("pod-{i}"));
        }
        assert!(watcher.next_event().await.is_none());
    }

    #[tokio::test]
    async fn stop_joins_forwarder_on_pending_stream() {
        let watcher = PodWatcher::spawn(stream::pending::<Result<WatchEvent<Pod>, kube::Error>>());
        // Must not hang: cancellation wins over the pending stream.
        watcher.stop().await;
    }

    #[tokio::test]
    async fn stop_joins_forwarder_with_unread_backlog() {
        let events: Vec<Result<_, kube::Error>> = (0..40)
            .map(|i| Ok(WatchEvent::Added(test_pod(&format!("pod-{i}")))))
            .collect();
        let watcher = PodWatcher::spawn(stream::iter(events));
        // The forwarder may be parked on a full channel; stop must still join.
        watcher.stop().await;
    }
}
