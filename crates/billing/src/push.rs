//! Push channel contract and the in-process topic hub
//!
//! The push connection is process-wide and multiplexes many topics. A
//! subscriber owns only its own slot on a topic: unsubscribing never touches
//! other subscribers of the same topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use franquia_shared::ChargeStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{BillingError, BillingResult};
use crate::lock_unpoisoned;

pub type SubscriptionId = u64;

/// Status change delivered by the push provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub charge_id: String,
    pub new_status: ChargeStatus,
}

/// An active topic subscription and its event stream
#[derive(Debug)]
pub struct PushSubscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub events: mpsc::UnboundedReceiver<PushEvent>,
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Subscribe to a topic. Resolves once the provider confirmed the subscription.
    async fn subscribe(&self, topic: &str) -> BillingResult<PushSubscription>;

    /// Drop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Topic carrying status changes for one charge
pub fn charge_topic(charge_id: &str) -> String {
    format!("charge:{}", charge_id)
}

/// In-process multiplexed topic broker
#[derive(Default)]
pub struct PushHub {
    next_id: AtomicU64,
    topics: Mutex<HashMap<String, HashMap<SubscriptionId, mpsc::UnboundedSender<PushEvent>>>>,
    owners: Mutex<HashMap<SubscriptionId, String>>,
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every subscriber of `topic`, returning how many received it
    pub fn publish(&self, topic: &str, event: PushEvent) -> usize {
        let mut pruned = Vec::new();
        let delivered = {
            let mut topics = lock_unpoisoned(&self.topics);
            let Some(subscribers) = topics.get_mut(topic) else {
                return 0;
            };

            // Receivers dropped without unsubscribing are pruned here
            subscribers.retain(|id, tx| {
                let alive = tx.send(event.clone()).is_ok();
                if !alive {
                    pruned.push(*id);
                }
                alive
            });
            let delivered = subscribers.len();
            if subscribers.is_empty() {
                topics.remove(topic);
            }
            delivered
        };

        if !pruned.is_empty() {
            let mut owners = lock_unpoisoned(&self.owners);
            for id in pruned {
                owners.remove(&id);
            }
        }
        delivered
    }

    /// Close every stream on `topic`, as a dropped connection would
    pub fn disconnect_topic(&self, topic: &str) -> usize {
        let Some(subscribers) = lock_unpoisoned(&self.topics).remove(topic) else {
            return 0;
        };

        let mut owners = lock_unpoisoned(&self.owners);
        for id in subscribers.keys() {
            owners.remove(id);
        }
        tracing::debug!(topic = %topic, count = subscribers.len(), "Push topic disconnected");
        subscribers.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock_unpoisoned(&self.topics)
            .get(topic)
            .map_or(0, |subscribers| subscribers.len())
    }

    fn register(&self, topic: &str) -> PushSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();

        lock_unpoisoned(&self.topics)
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);
        lock_unpoisoned(&self.owners).insert(id, topic.to_string());

        PushSubscription {
            id,
            topic: topic.to_string(),
            events: rx,
        }
    }
}

#[async_trait]
impl PushChannel for PushHub {
    async fn subscribe(&self, topic: &str) -> BillingResult<PushSubscription> {
        let subscription = self.register(topic);
        tracing::debug!(topic = %topic, subscription_id = subscription.id, "Push subscription registered");
        Ok(subscription)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let Some(topic) = lock_unpoisoned(&self.owners).remove(&id) else {
            return;
        };

        let mut topics = lock_unpoisoned(&self.topics);
        if let Some(subscribers) = topics.get_mut(&topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                topics.remove(&topic);
            }
        }
        tracing::debug!(topic = %topic, subscription_id = id, "Push subscription removed");
    }
}

/// Push channel used when realtime delivery is switched off; every subscribe fails
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPushChannel;

#[async_trait]
impl PushChannel for DisabledPushChannel {
    async fn subscribe(&self, _topic: &str) -> BillingResult<PushSubscription> {
        Err(BillingError::PushUnavailable("push delivery disabled".to_string()))
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paid(charge_id: &str) -> PushEvent {
        PushEvent {
            charge_id: charge_id.to_string(),
            new_status: ChargeStatus::Paid,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers_only() {
        let hub = PushHub::new();
        let mut a = hub.subscribe(&charge_topic("ch_1")).await.unwrap();
        let mut b = hub.subscribe(&charge_topic("ch_2")).await.unwrap();

        assert_eq!(hub.publish(&charge_topic("ch_1"), paid("ch_1")), 1);
        assert_eq!(a.events.recv().await, Some(paid("ch_1")));
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_other_subscribers() {
        let hub = PushHub::new();
        let topic = charge_topic("ch_1");
        let first = hub.subscribe(&topic).await.unwrap();
        let mut second = hub.subscribe(&topic).await.unwrap();
        assert_eq!(hub.subscriber_count(&topic), 2);

        hub.unsubscribe(first.id);
        assert_eq!(hub.subscriber_count(&topic), 1);
        assert_eq!(hub.publish(&topic, paid("ch_1")), 1);
        assert_eq!(second.events.recv().await, Some(paid("ch_1")));

        hub.unsubscribe(second.id);
        hub.unsubscribe(second.id);
        assert_eq!(hub.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_disconnect_topic_ends_streams() {
        let hub = PushHub::new();
        let topic = charge_topic("ch_1");
        let mut a = hub.subscribe(&topic).await.unwrap();
        let mut other = hub.subscribe(&charge_topic("ch_2")).await.unwrap();

        assert_eq!(hub.disconnect_topic(&topic), 1);
        assert_eq!(a.events.recv().await, None);
        assert_eq!(hub.subscriber_count(&topic), 0);
        assert_eq!(hub.disconnect_topic(&topic), 0);

        // Unsubscribing a disconnected id is a no-op
        hub.unsubscribe(a.id);
        assert_eq!(hub.publish(&charge_topic("ch_2"), paid("ch_2")), 1);
        assert_eq!(other.events.recv().await, Some(paid("ch_2")));
    }

    #[tokio::test]
    async fn test_dropped_receivers_are_pruned() {
        let hub = PushHub::new();
        let topic = charge_topic("ch_9");
        let subscription = hub.subscribe(&topic).await.unwrap();
        drop(subscription);
        assert_eq!(hub.publish(&topic, paid("ch_9")), 0);
        assert_eq!(hub.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_disabled_channel_rejects() {
        let err = DisabledPushChannel.subscribe("charge:ch_1").await.unwrap_err();
        assert!(matches!(err, BillingError::PushUnavailable(_)));
    }
}
