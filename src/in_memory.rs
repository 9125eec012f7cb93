//! A single-node adapter keeping its subscriber set in process memory.

use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
};

use async_trait::async_trait;
use derive_more::{Display, Error};

use crate::{
    adapter::{AdapterError, SubscriberRef, SubscriptionAdapter, SubscriptionQuery, WrappedEvent},
    broker::EventPublisher,
};

/// Error of publishing through an [`InMemoryAdapter`] that is not wired to a broker yet.
#[derive(Debug, Display, Error)]
#[display("adapter is not listening yet")]
pub struct NotListening;

/// A [`SubscriptionAdapter`] for single-node deployments: the subscriber set lives in process
/// memory, and events enter through [`publish`](InMemoryAdapter::publish) instead of an
/// external queue.
///
/// Registrations stay until explicitly unsubscribed, and everything this adapter knows dies
/// with the process. Deployments that need subscriptions to survive restarts, or that fan
/// events out across nodes, should implement [`SubscriptionAdapter`] against their own pub/sub
/// service instead.
#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    subscribers: Mutex<HashMap<SubscriberRef, SubscriptionQuery>>,
    events: OnceLock<EventPublisher>,
}

impl InMemoryAdapter {
    /// Creates an adapter with an empty subscriber set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands one event to the broker.
    ///
    /// Fails until the adapter has been wired up by the handler assembly.
    pub fn publish(&self, event: WrappedEvent) -> Result<(), NotListening> {
        let events = self.events.get().ok_or(NotListening)?;
        events.publish(event);
        Ok(())
    }

    /// Publishes one query result for a single subscriber.
    pub fn publish_to(
        &self,
        subscriber: &SubscriberRef,
        query_result: serde_json::Value,
        finished: bool,
    ) -> Result<(), NotListening> {
        self.publish(WrappedEvent {
            client_id: subscriber.client_id.clone(),
            subscription_id: subscriber.subscription_id.clone(),
            query_result,
            finished,
        })
    }

    /// Returns the currently registered subscribers.
    pub fn subscribers(&self) -> Vec<SubscriberRef> {
        self.subscribers
            .lock()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the query registered for the given subscriber, if any.
    pub fn query_of(&self, subscriber: &SubscriberRef) -> Option<SubscriptionQuery> {
        self.subscribers
            .lock()
            .ok()
            .and_then(|map| map.get(subscriber).cloned())
    }
}

#[async_trait]
impl SubscriptionAdapter for InMemoryAdapter {
    fn start_listening(&self, events: EventPublisher) {
        let _ = self.events.set(events);
    }

    async fn notify_new_subscription(
        &self,
        subscriber: SubscriberRef,
        query: SubscriptionQuery,
    ) -> Result<(), AdapterError> {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(subscriber, query);
        }
        Ok(())
    }

    async fn notify_unsubscribe(&self, subscriber: SubscriberRef) -> Result<(), AdapterError> {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&subscriber);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn subscriber(client: &str, subscription: &str) -> SubscriberRef {
        SubscriberRef {
            client_id: client.into(),
            subscription_id: subscription.into(),
        }
    }

    #[tokio::test]
    async fn tracks_subscribers() {
        let adapter = InMemoryAdapter::new();
        let query = SubscriptionQuery {
            request_string: "{hello}".into(),
            variable_values: serde_json::Map::new(),
        };

        adapter
            .notify_new_subscription(subscriber("c1", "s1"), query.clone())
            .await
            .unwrap();
        adapter
            .notify_new_subscription(subscriber("c1", "s2"), query.clone())
            .await
            .unwrap();
        assert_eq!(adapter.subscribers().len(), 2);
        assert_eq!(adapter.query_of(&subscriber("c1", "s1")), Some(query));

        adapter
            .notify_unsubscribe(subscriber("c1", "s1"))
            .await
            .unwrap();
        assert_eq!(adapter.subscribers(), vec![subscriber("c1", "s2")]);
    }

    #[test]
    fn publishing_requires_a_broker() {
        let adapter = InMemoryAdapter::new();
        assert!(
            adapter
                .publish_to(&subscriber("c1", "s1"), serde_json::json!({}), false)
                .is_err(),
        );
    }
}
