//! Tenant-scoped event fan-out.
//!
//! A per-process hub mapping tenant IDs to subscriber channels. Publish
//! never blocks the caller: each subscriber gets a bounded channel, a full
//! channel simply loses the message, and a closed channel drops the
//! subscriber. Transports (WebSocket handlers) sit on the receiving end.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Per-subscriber buffer. Slow consumers lose messages rather than
/// holding up state transitions.
const SUBSCRIBER_BUFFER: usize = 64;

/// One `{event, data}` message delivered to subscribers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TenantEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl TenantEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<TenantEvent>,
}

/// In-memory tenant event hub.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<HashMap<Uuid, Vec<Subscriber>>>,
}

/// Handle returned from [`EventHub::subscribe`]; receives the tenant's
/// events until dropped.
pub struct Subscription {
    pub id: Uuid,
    pub rx: mpsc::Receiver<TenantEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber for a tenant. Multiple subscriptions per
    /// tenant are fine; each gets its own channel.
    pub fn subscribe(&self, tenant_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = Uuid::new_v4();

        let mut map = self.subscribers.lock().expect("hub poisoned");
        map.entry(tenant_id).or_default().push(Subscriber { id, tx });

        Subscription { id, rx }
    }

    /// Remove one subscriber (normally on transport disconnect).
    pub fn unsubscribe(&self, tenant_id: Uuid, subscription_id: Uuid) {
        let mut map = self.subscribers.lock().expect("hub poisoned");
        if let Some(subs) = map.get_mut(&tenant_id) {
            subs.retain(|s| s.id != subscription_id);
            if subs.is_empty() {
                map.remove(&tenant_id);
            }
        }
    }

    /// Broadcast an event to every subscriber of a tenant.
    ///
    /// Best-effort: a full buffer loses this message for that subscriber;
    /// a closed channel unsubscribes it. Other subscribers are unaffected
    /// and the caller never waits.
    pub fn publish(&self, tenant_id: Uuid, event: TenantEvent) {
        let mut map = self.subscribers.lock().expect("hub poisoned");
        let Some(subs) = map.get_mut(&tenant_id) else {
            return;
        };

        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    subscriber = %sub.id,
                    event = %event.event,
                    "subscriber buffer full, message lost"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    subscriber = %sub.id,
                    "dropping closed subscriber"
                );
                false
            }
        });

        if subs.is_empty() {
            map.remove(&tenant_id);
        }
    }

    /// Number of live subscribers for a tenant.
    pub fn subscriber_count(&self, tenant_id: Uuid) -> usize {
        self.subscribers
            .lock()
            .expect("hub poisoned")
            .get(&tenant_id)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_all_tenant_subscribers() {
        let hub = EventHub::new();
        let tenant = Uuid::new_v4();

        let mut a = hub.subscribe(tenant);
        let mut b = hub.subscribe(tenant);

        hub.publish(tenant, TenantEvent::new("artifact:approved", json!({"x": 1})));

        assert_eq!(a.rx.recv().await.unwrap().event, "artifact:approved");
        assert_eq!(b.rx.recv().await.unwrap().event, "artifact:approved");
    }

    #[tokio::test]
    async fn events_do_not_cross_tenants() {
        let hub = EventHub::new();
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        let mut a = hub.subscribe(tenant_a);
        let mut b = hub.subscribe(tenant_b);

        hub.publish(tenant_a, TenantEvent::new("only:a", json!({})));

        assert_eq!(a.rx.recv().await.unwrap().event, "only:a");
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_is_dropped_without_affecting_others() {
        let hub = EventHub::new();
        let tenant = Uuid::new_v4();

        let dead = hub.subscribe(tenant);
        let mut live = hub.subscribe(tenant);
        drop(dead.rx);

        hub.publish(tenant, TenantEvent::new("e", json!({})));

        assert_eq!(live.rx.recv().await.unwrap().event, "e");
        assert_eq!(hub.subscriber_count(tenant), 1);
    }

    #[tokio::test]
    async fn full_buffer_loses_messages_but_keeps_subscriber() {
        let hub = EventHub::new();
        let tenant = Uuid::new_v4();
        let mut sub = hub.subscribe(tenant);

        for i in 0..(SUBSCRIBER_BUFFER + 10) {
            hub.publish(tenant, TenantEvent::new(format!("e{i}"), json!({})));
        }

        // Still subscribed; the overflowed messages are simply gone.
        assert_eq!(hub.subscriber_count(tenant), 1);
        let first = sub.rx.recv().await.unwrap();
        assert_eq!(first.event, "e0");
    }

    #[test]
    fn unsubscribe_removes_only_that_subscription() {
        let hub = EventHub::new();
        let tenant = Uuid::new_v4();

        let a = hub.subscribe(tenant);
        let _b = hub.subscribe(tenant);
        assert_eq!(hub.subscriber_count(tenant), 2);

        hub.unsubscribe(tenant, a.id);
        assert_eq!(hub.subscriber_count(tenant), 1);
    }
}
