//! Topic-keyed fanout of session events to live observers.
//!
//! One broadcast channel per session, created on first subscription.
//! Publishing never waits on subscribers: a consumer that falls more than
//! the buffer size behind loses the oldest events and keeps going.

use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::models::event::SessionEvent;

#[derive(Clone)]
pub struct EventBus {
    topics: Arc<RwLock<HashMap<Uuid, broadcast::Sender<SessionEvent>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to `session_id`, creating its topic if necessary.
    pub fn subscribe(&self, session_id: Uuid) -> EventStream {
        let receiver = match self.topics.write() {
            Ok(mut topics) => topics
                .entry(session_id)
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
            Err(_) => {
                tracing::error!("Event topic map poisoned, returning closed stream");
                return EventStream::closed(session_id);
            }
        };
        tracing::debug!("👀 Observer subscribed to session {}", session_id);
        EventStream::new(session_id, receiver)
    }

    /// Delivers `event` to the current subscribers of its session.
    ///
    /// Returns the number of subscribers reached. Publishing to a topic with
    /// no subscribers is a no-op and does not create the topic.
    pub fn publish(&self, event: SessionEvent) -> usize {
        let session_id = event.session_id();
        let Ok(mut topics) = self.topics.write() else {
            return 0;
        };
        let Some(sender) = topics.get(&session_id) else {
            return 0;
        };

        match sender.send(event) {
            Ok(receivers) => {
                tracing::debug!("📣 Event delivered to {} observer(s) of {}", receivers, session_id);
                receivers
            }
            Err(_) => {
                topics.remove(&session_id);
                tracing::debug!("Removing topic {} due to no subscribers", session_id);
                0
            }
        }
    }

    /// Drops the topic. Live streams end once they drain buffered events.
    pub fn retire(&self, session_id: Uuid) {
        if let Ok(mut topics) = self.topics.write() {
            topics.remove(&session_id);
        }
    }

    pub fn subscriber_count(&self, session_id: Uuid) -> usize {
        self.topics
            .read()
            .ok()
            .and_then(|t| t.get(&session_id).map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

/// Live, unbounded sequence of one session's events.
///
/// Dropping the stream unsubscribes.
pub struct EventStream {
    session_id: Uuid,
    inner: BroadcastStream<SessionEvent>,
}

impl EventStream {
    fn new(session_id: Uuid, receiver: broadcast::Receiver<SessionEvent>) -> Self {
        Self {
            session_id,
            inner: BroadcastStream::new(receiver),
        }
    }

    /// A stream that is already finished.
    pub fn closed(session_id: Uuid) -> Self {
        let (sender, receiver) = broadcast::channel(1);
        drop(sender);
        Self::new(session_id, receiver)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::warn!(
                        "Observer of session {} lagged, {} event(s) dropped",
                        self.session_id,
                        skipped
                    );
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use futures::StreamExt;
    use tokio::time::{Duration, timeout};

    fn rotated(session_id: Uuid) -> SessionEvent {
        SessionEvent::TokenRotated { session_id, expires_at: Utc::now() }
    }

    #[tokio::test]
    async fn delivers_to_all_subscribers_of_the_topic() {
        let bus = EventBus::new(8);
        let session = Uuid::new_v4();
        let mut a = bus.subscribe(session);
        let mut b = bus.subscribe(session);
        let mut other = bus.subscribe(Uuid::new_v4());

        assert_eq!(bus.publish(rotated(session)), 2);

        let got_a = timeout(Duration::from_millis(50), a.next()).await.unwrap();
        let got_b = timeout(Duration::from_millis(50), b.next()).await.unwrap();
        assert_eq!(got_a.map(|e| e.session_id()), Some(session));
        assert_eq!(got_b.map(|e| e.session_id()), Some(session));
        assert!(timeout(Duration::from_millis(20), other.next()).await.is_err());
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_events() {
        let bus = EventBus::new(8);
        let session = Uuid::new_v4();
        let _early = bus.subscribe(session);
        bus.publish(rotated(session));

        let mut late = bus.subscribe(session);
        assert!(timeout(Duration::from_millis(20), late.next()).await.is_err());
    }

    #[tokio::test]
    async fn publish_without_topic_does_not_create_it() {
        let bus = EventBus::new(8);
        let session = Uuid::new_v4();
        assert_eq!(bus.publish(rotated(session)), 0);
        assert_eq!(bus.subscriber_count(session), 0);
    }

    #[tokio::test]
    async fn slow_observer_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let session = Uuid::new_v4();
        let mut slow = bus.subscribe(session);
        for _ in 0..10 {
            bus.publish(rotated(session));
        }
        bus.retire(session);

        let received: Vec<_> = slow.by_ref().collect().await;
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn retiring_ends_streams_and_dropping_unsubscribes() {
        let bus = EventBus::new(8);
        let session = Uuid::new_v4();
        let mut stream = bus.subscribe(session);
        let dropped = bus.subscribe(session);
        drop(dropped);
        assert_eq!(bus.subscriber_count(session), 1);

        bus.retire(session);
        let end = timeout(Duration::from_millis(50), stream.next()).await.unwrap();
        assert!(end.is_none());
        assert!(EventStream::closed(session).next().await.is_none());
    }
}
