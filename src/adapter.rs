//! The integration seam towards external event sources.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::EventPublisher;

/// Errors reported by a [`SubscriptionAdapter`]. Surfaced to the requesting client as a 500
/// `GQL_ERROR` frame.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

/// The primary key of a subscription: subscription ids are chosen by clients and are only
/// unique per client.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberRef {
    /// The id of the subscribed client.
    pub client_id: String,

    /// The client-chosen id of the subscription.
    pub subscription_id: String,
}

/// The GraphQL operation a subscription should stream results for.
///
/// Serializable in both directions, so adapters may persist it alongside the
/// [`SubscriberRef`] and replay it against their event source later.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionQuery {
    /// The raw GraphQL request string.
    pub request_string: String,

    /// The values of the variables in the request.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variable_values: serde_json::Map<String, serde_json::Value>,
}

/// One result produced by the adapter for a single subscription, addressed at a single client.
///
/// Serializable in both directions, so multi-node adapters can ship these through an external
/// pub/sub service verbatim.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedEvent {
    /// The id of the client the result is addressed at.
    pub client_id: String,

    /// The subscription the result belongs to.
    pub subscription_id: String,

    /// The result of the GraphQL query.
    pub query_result: serde_json::Value,

    /// Whether this is the final result for the subscription. `true` turns the frame pushed to
    /// the client into a `GQL_COMPLETE`.
    #[serde(default)]
    pub finished: bool,
}

/// An integration with an external event source (an in-memory timer, a pub/sub service, a
/// message queue), owned by the embedder.
///
/// The adapter is told about subscription registrations and cancellations, and delivers
/// results for live subscriptions through the [`EventPublisher`] handed to
/// [`start_listening`](SubscriptionAdapter::start_listening). Registration calls are expected
/// to return quickly; adapters persisting state should do so asynchronously.
#[async_trait]
pub trait SubscriptionAdapter: Send + Sync + 'static {
    /// Called once at assembly time. The adapter must begin delivering events through
    /// `events` from here on.
    fn start_listening(&self, events: EventPublisher);

    /// Called when a client registered a subscription, with the operation to stream results
    /// for.
    async fn notify_new_subscription(
        &self,
        subscriber: SubscriberRef,
        query: SubscriptionQuery,
    ) -> Result<(), AdapterError>;

    /// Called when a client cancelled a subscription. The adapter should cease producing
    /// events for it.
    async fn notify_unsubscribe(&self, subscriber: SubscriberRef) -> Result<(), AdapterError>;

    /// Called when a client's event stream has been established. Adapters tracking per-client
    /// subscription sets can load them here.
    async fn notify_client_connected(&self, _client_id: &str) {}

    /// Called when a client's event stream has gone away. Adapters tracking per-client
    /// subscription sets can unload them here.
    async fn notify_client_disconnected(&self, _client_id: &str) {}
}
