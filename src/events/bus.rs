//! Dispatch fan-out
//!
//! Every subscription owns an unbounded queue drained by its own task, so
//! delivery order is preserved per listener and a slow listener never stalls
//! the shard that published the event.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// A dispatch as it leaves a Ready shard
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub shard_id: u64,
    /// Event name, e.g. `MESSAGE_CREATE`
    pub name: String,
    pub sequence: Option<u64>,
    pub payload: Value,
}

/// Consumer of dispatch events
#[async_trait]
pub trait EventListener: Send + Sync + 'static {
    async fn on_event(&self, event: &DispatchEvent);
}

/// Turns a raw dispatch payload into a consumer-defined domain type.
pub trait ModelDecoder: Send + Sync + 'static {
    type Output: Send;

    /// `None` skips the event (not interesting or not decodable).
    fn decode(&self, name: &str, payload: &Value) -> Option<Self::Output>;
}

/// Adapts a [`ModelDecoder`] and a typed callback into an [`EventListener`].
pub struct DecodingListener<D, F> {
    decoder: D,
    handler: F,
}

impl<D, F> DecodingListener<D, F>
where
    D: ModelDecoder,
    F: Fn(u64, D::Output) + Send + Sync + 'static,
{
    pub fn new(decoder: D, handler: F) -> Self {
        Self { decoder, handler }
    }
}

#[async_trait]
impl<D, F> EventListener for DecodingListener<D, F>
where
    D: ModelDecoder,
    F: Fn(u64, D::Output) + Send + Sync + 'static,
{
    async fn on_event(&self, event: &DispatchEvent) {
        match self.decoder.decode(&event.name, &event.payload) {
            Some(model) => (self.handler)(event.shard_id, model),
            None => debug!(event = %event.name, "Decoder skipped event"),
        }
    }
}

/// Which events a subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Named(String),
}

impl EventFilter {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(wanted) => wanted == name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Arc<DispatchEvent>>,
}

/// Fan-out point between shards and listeners. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; spawns its delivery task on the current runtime.
    pub fn subscribe<L: EventListener>(&self, filter: EventFilter, listener: L) -> SubscriptionId {
        let (id, mut rx) = self.register(filter);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listener.on_event(&event).await;
            }
        });
        id
    }

    /// Register a plain channel receiver instead of a listener.
    pub fn subscribe_channel(
        &self,
        filter: EventFilter,
    ) -> mpsc::UnboundedReceiver<Arc<DispatchEvent>> {
        self.register(filter).1
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Deliver to every matching subscription. Returns the number of queues
    /// the event was placed on; subscriptions whose receiver is gone are pruned.
    pub fn publish(&self, event: DispatchEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subs = self.inner.subscriptions.read();
            for sub in subs.iter().filter(|s| s.filter.matches(&event.name)) {
                if sub.tx.send(Arc::clone(&event)).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(sub.id);
                }
            }
        }

        if !closed.is_empty() {
            self.inner
                .subscriptions
                .write()
                .retain(|s| !closed.contains(&s.id));
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    fn register(
        &self,
        filter: EventFilter,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<DispatchEvent>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscriptions
            .write()
            .push(Subscription { id, filter, tx });
        (id, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn event(name: &str, seq: u64) -> DispatchEvent {
        DispatchEvent {
            shard_id: 0,
            name: name.to_string(),
            sequence: Some(seq),
            payload: json!({ "seq": seq }),
        }
    }

    #[tokio::test]
    async fn filters_by_event_name() {
        let bus = EventBus::new();
        let mut all = bus.subscribe_channel(EventFilter::All);
        let mut messages = bus.subscribe_channel(EventFilter::named("MESSAGE_CREATE"));

        assert_eq!(bus.publish(event("MESSAGE_CREATE", 1)), 2);
        assert_eq!(bus.publish(event("GUILD_CREATE", 2)), 1);

        assert_eq!(all.recv().await.unwrap().name, "MESSAGE_CREATE");
        assert_eq!(all.recv().await.unwrap().name, "GUILD_CREATE");
        assert_eq!(messages.recv().await.unwrap().sequence, Some(1));
        assert!(messages.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe_channel(EventFilter::All);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.publish(event("READY", 1)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, _rx) = bus.register(EventFilter::All);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish(event("READY", 1)), 0);
    }

    struct ContentDecoder;

    impl ModelDecoder for ContentDecoder {
        type Output = String;

        fn decode(&self, name: &str, payload: &Value) -> Option<String> {
            (name == "MESSAGE_CREATE")
                .then(|| payload["content"].as_str().map(str::to_string))
                .flatten()
        }
    }

    #[tokio::test]
    async fn decoding_listener_receives_typed_models_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            EventFilter::All,
            DecodingListener::new(ContentDecoder, move |shard_id, content: String| {
                sink.lock().push((shard_id, content));
            }),
        );

        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            bus.publish(DispatchEvent {
                shard_id: 2,
                name: "MESSAGE_CREATE".to_string(),
                sequence: Some(i as u64),
                payload: json!({ "content": text }),
            });
        }
        bus.publish(event("TYPING_START", 9));

        for _ in 0..50 {
            if seen.lock().len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let seen = seen.lock().clone();
        assert_eq!(
            seen,
            vec![(2, "a".to_string()), (2, "b".to_string()), (2, "c".to_string())]
        );
    }
}
