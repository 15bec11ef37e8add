// =============================================================================
// Event Bus — topic pub/sub fabric between engine subsystems
// =============================================================================
//
// Topics are hierarchical `domain.subject` names (`market.tick`,
// `order.filled`). Subscribers register either an exact topic or a pattern
// with a single trailing `*` wildcard (`market.*`).
//
// Delivery model:
//   - `publish` is fire-and-forget: it enqueues onto every matching
//     subscription and returns without waiting for handlers.
//   - Each subscription owns an unbounded queue drained by its own task, so
//     one subscriber sees events from a single publisher on a single topic
//     in publication order, while distinct subscribers run concurrently.
//   - A handler error is logged and swallowed; it never blocks or terminates
//     other handlers.
//   - Delivery is at-most-once. Cross-topic ordering is not guaranteed;
//     consumers that correlate across topics use `correlation_id`.
// =============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Event envelope
// ---------------------------------------------------------------------------

/// Envelope carried by every event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id (UUID v4).
    pub event_id: String,
    /// Topic name, e.g. `order.filled`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Free-form JSON payload.
    pub data: serde_json::Value,
    /// ISO-8601 UTC timestamp.
    pub timestamp: DateTime<Utc>,
    /// Publishing component.
    pub source: String,
    /// Optional id for tracing a signal through risk -> order -> fill.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Future returned by an event handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// An asynchronous event handler.
pub type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Identifier returned by `subscribe`, used to unsubscribe.
pub type SubscriptionId = u64;

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Returns true if `topic` matches `pattern` (exact, or single trailing `*`
/// wildcard matching any suffix).
fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    tx: mpsc::UnboundedSender<Event>,
}

/// Process-wide topic pub/sub. Cheap to clone via `Arc`.
pub struct EventBus {
    source: String,
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl EventBus {
    /// Create a bus whose emitted events carry `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            next_id: AtomicU64::new(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Register `handler` for every topic matching `pattern`.
    ///
    /// The returned id can be passed to [`EventBus::unsubscribe`]. Each
    /// subscription drains its queue sequentially on a dedicated task, so a
    /// slow handler delays only its own subscription.
    pub fn subscribe(&self, pattern: impl Into<String>, handler: Handler) -> SubscriptionId {
        let pattern = pattern.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let task_pattern = pattern.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let topic = event.event_type.clone();
                let event_id = event.event_id.clone();
                if let Err(e) = handler(event).await {
                    warn!(
                        pattern = %task_pattern,
                        topic = %topic,
                        event_id = %event_id,
                        error = %e,
                        "event handler failed — event dropped"
                    );
                }
            }
        });

        self.subscriptions.write().push(Subscription { id, pattern, tx });
        id
    }

    /// Remove a subscription. Safe to call with an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        // Dropping the sender ends the drain task once its queue empties.
        self.subscriptions.write().retain(|s| s.id != id);
    }

    /// Publish a fully-formed event. Returns after enqueuing, not after
    /// handlers complete.
    pub fn publish(&self, event: Event) {
        let subs = self.subscriptions.read();
        let mut delivered = 0usize;
        for sub in subs.iter() {
            if topic_matches(&sub.pattern, &event.event_type) {
                // Send failures mean the drain task is gone; unsubscribe
                // will clean the entry up.
                if sub.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!(topic = %event.event_type, delivered, "event published");
    }

    /// Convenience: build the envelope (id, timestamp, source) and publish.
    pub fn emit(
        &self,
        event_type: impl Into<String>,
        data: serde_json::Value,
        correlation_id: Option<String>,
    ) {
        self.publish(Event {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            source: self.source.clone(),
            correlation_id,
        });
    }

    /// Number of live subscriptions (used by the engine snapshot).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("source", &self.source)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}
