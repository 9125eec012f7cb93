#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]


pub mod adapter;
mod broker;
pub mod client_id;
mod in_memory;
pub mod protocol;
mod response;
mod schema;
pub mod streaming;
pub mod subscriptions;
mod util;

use std::{sync::Arc, time::Duration};

use axum::{
    Extension, Router, middleware,
    routing::{get, post},
};

pub use self::{
    adapter::{AdapterError, SubscriberRef, SubscriptionAdapter, SubscriptionQuery, WrappedEvent},
    broker::{Broker, EventPublisher},
    client_id::ClientId,
    in_memory::{InMemoryAdapter, NotListening},
    response::ControlResponse,
    schema::Schema,
};

/// What the broker does when a client's outbound channel is full.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowPolicy {
    /// Wait for capacity. The broker is the single serialization point for all clients, so one
    /// slow consumer stalls delivery for everyone until it catches up or disconnects.
    #[default]
    Block,

    /// Drop the frame and log. Delivery to other clients is never delayed, at the price of
    /// lost frames for clients that do not keep up.
    Drop,
}

/// Configuration of the transport.
#[derive(Clone, Debug)]
pub struct Config {
    /// Interval at which idle event streams carry a `GQL_KEEPALIVE` frame, defeating
    /// intermediate proxy timeouts. 15 seconds by default.
    pub keep_alive_interval: Duration,

    /// Capacity of the replay ring buffer, in frames across all clients.
    ///
    /// When non-zero, outbound frames are retained and tagged with a monotonic event id, and a
    /// client reconnecting with a `Last-Event-ID` header gets the retained tail again. Only
    /// events this process routed are retained, and duplicates are possible, so clients must
    /// be idempotent. `0` (the default) disables replay entirely.
    pub event_buffer_size: usize,

    /// Capacity of each client's outbound channel. `1` by default, so backpressure reaches
    /// the broker immediately.
    pub client_channel_capacity: usize,

    /// What to do when a client's outbound channel is full. [`OverflowPolicy::Block`] by
    /// default.
    pub overflow_policy: OverflowPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            event_buffer_size: 0,
            client_channel_capacity: 1,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl Config {
    /// Constructs the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the interval at which idle streams carry keep-alive frames.
    #[must_use]
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Specifies the capacity of the replay ring buffer. `0` disables replay.
    #[must_use]
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Specifies the capacity of each client's outbound channel.
    #[must_use]
    pub fn with_client_channel_capacity(mut self, capacity: usize) -> Self {
        self.client_channel_capacity = capacity;
        self
    }

    /// Specifies what to do when a client's outbound channel is full.
    #[must_use]
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }
}

/// The assembled transport: the broker, the schema operations are validated against, and the
/// adapter events come from.
///
/// Construct one with [`Handlers::new`] and mount the [`subscriptions::subscribe`] and
/// [`streaming::stream`] handlers on routes of your choosing (or use [`Handlers::router`] for
/// the recommended layout).
#[derive(Debug)]
pub struct Handlers<S, A> {
    schema: S,
    adapter: Arc<A>,
    broker: Broker,
    config: Config,
}

impl<S, A> Handlers<S, A>
where
    S: Schema,
    A: SubscriptionAdapter,
{
    /// Spawns the broker and wires the adapter up to it.
    ///
    /// Must be called within a Tokio runtime. The adapter's `start_listening` is invoked here
    /// with the publish upcall, and its connect/disconnect hooks are relayed from a dedicated
    /// task so they never delay event routing.
    pub fn new(schema: S, adapter: A, config: Config) -> Arc<Self> {
        let (broker, mut lifecycle) = Broker::spawn(&config);
        let adapter = Arc::new(adapter);
        adapter.start_listening(broker.publisher());

        let hooks = Arc::clone(&adapter);
        tokio::spawn(async move {
            use crate::broker::LifecycleEvent;
            while let Some(event) = lifecycle.recv().await {
                match event {
                    LifecycleEvent::Connected(client_id) => {
                        hooks.notify_client_connected(&client_id).await;
                    }
                    LifecycleEvent::Disconnected(client_id) => {
                        hooks.notify_client_disconnected(&client_id).await;
                    }
                }
            }
        });

        Arc::new(Self {
            schema,
            adapter,
            broker,
            config,
        })
    }

    /// Returns the schema operations are validated against.
    pub fn schema(&self) -> &S {
        &self.schema
    }

    /// Returns the adapter events come from.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Returns the handle to the running broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Returns the configuration of this transport.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a [`Router`] with the recommended layout: the event stream on `GET /`, control
    /// frames on `POST /subscriptions` (plus the convenience `DELETE`), and the client-id
    /// middleware applied to both.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(streaming::stream::<S, A>))
            .route(
                "/subscriptions",
                post(subscriptions::subscribe::<S, A>)
                    .delete(subscriptions::unsubscribe::<S, A>),
            )
            .layer(middleware::from_fn(client_id::provide_client_id))
            .layer(Extension(Arc::clone(self)))
    }
}
