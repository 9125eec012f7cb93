//! The single-writer event hub routing adapter-published events to client streams.
//!
//! All mutable state (the client registry, the recently-disconnected window, the replay ring)
//! is owned by one task; registrations, deregistrations, tear-down requests and publications
//! reach it only through channels, so there is exactly one logical writer and no locking.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    Config, OverflowPolicy,
    adapter::WrappedEvent,
    protocol::{Frame, OperationType},
};

/// How long a disconnected client id stays eligible for replay.
const REPLAY_WINDOW: Duration = Duration::from_secs(300);

/// A connected client as registered by the streaming endpoint.
///
/// `outbound` and `close` are written only by the broker task and read only by this client's
/// stream. The `serial` uniquely identifies this connection: a client id may reconnect (or be
/// replaced), and only the [`Deregistration`] carrying the matching serial removes this entry.
#[derive(Debug)]
pub(crate) struct ClientInfo {
    pub client_id: String,
    pub serial: u64,
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub close: Option<oneshot::Sender<()>>,
    pub last_seen_event_id: Option<u64>,
}

/// The streaming endpoint's acknowledgement that one particular connection stopped reading.
#[derive(Debug)]
pub(crate) struct Deregistration {
    pub client_id: String,
    pub serial: u64,
}

/// A pre-marshaled protocol frame on its way to one client's stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct OutboundFrame {
    /// The monotonic replay id, present only when the replay buffer is enabled.
    pub event_id: Option<u64>,
    pub data: String,
}

/// Client lifecycle notifications relayed to the adapter's connect/disconnect hooks outside
/// the broker task.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum LifecycleEvent {
    Connected(String),
    Disconnected(String),
}

/// The upcall handed to the adapter: publishing an event enqueues it for routing.
///
/// The send is the only synchronization between the adapter and the broker; publishing never
/// blocks.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    new_events: mpsc::UnboundedSender<WrappedEvent>,
}

impl EventPublisher {
    /// Hands one event to the broker for routing to the addressed client.
    pub fn publish(&self, event: WrappedEvent) {
        if self.new_events.send(event).is_err() {
            tracing::warn!("broker is gone, dropping published event");
        }
    }
}

/// Handle to a running broker task.
#[derive(Clone, Debug)]
pub struct Broker {
    new_clients: mpsc::UnboundedSender<ClientInfo>,
    closed_clients: mpsc::UnboundedSender<Deregistration>,
    closing_clients: mpsc::UnboundedSender<String>,
    new_events: mpsc::UnboundedSender<WrappedEvent>,
    next_serial: Arc<AtomicU64>,
}

impl Broker {
    /// Spawns the broker task and returns its handle together with the lifecycle notification
    /// stream for the adapter hooks.
    pub(crate) fn spawn(config: &Config) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (new_clients_tx, new_clients) = mpsc::unbounded_channel();
        let (closed_clients_tx, closed_clients) = mpsc::unbounded_channel();
        let (closing_clients_tx, closing_clients) = mpsc::unbounded_channel();
        let (new_events_tx, new_events) = mpsc::unbounded_channel();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();

        let event_loop = EventLoop {
            new_clients,
            closed_clients,
            closing_clients,
            new_events,
            lifecycle: lifecycle_tx,
            clients: HashMap::new(),
            recently_disconnected: HashMap::new(),
            buffer: VecDeque::new(),
            next_event_id: 1,
            event_buffer_size: config.event_buffer_size,
            overflow_policy: config.overflow_policy,
        };
        tokio::spawn(event_loop.run());

        let broker = Self {
            new_clients: new_clients_tx,
            closed_clients: closed_clients_tx,
            closing_clients: closing_clients_tx,
            new_events: new_events_tx,
            next_serial: Arc::new(AtomicU64::new(1)),
        };
        (broker, lifecycle_rx)
    }

    /// Returns the publish upcall for the adapter.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            new_events: self.new_events.clone(),
        }
    }

    /// Requests tear-down of the given client's event stream.
    ///
    /// The stream observes the close signal, stops reading and acknowledges on its own; the
    /// registry entry survives until that acknowledgement arrives.
    pub fn request_close(&self, client_id: &str) {
        let _ = self.closing_clients.send(client_id.to_owned());
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a new client connection. Fails only when the broker task is gone.
    pub(crate) fn register(&self, client: ClientInfo) -> Result<(), ()> {
        self.new_clients.send(client).map_err(|_| ())
    }

    /// Acknowledges that the given connection stopped reading its stream.
    pub(crate) fn acknowledge_closed(&self, client_id: String, serial: u64) {
        let _ = self.closed_clients.send(Deregistration { client_id, serial });
    }
}

struct EventLoop {
    new_clients: mpsc::UnboundedReceiver<ClientInfo>,
    closed_clients: mpsc::UnboundedReceiver<Deregistration>,
    closing_clients: mpsc::UnboundedReceiver<String>,
    new_events: mpsc::UnboundedReceiver<WrappedEvent>,
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,

    clients: HashMap<String, ClientInfo>,
    recently_disconnected: HashMap<String, Instant>,
    buffer: VecDeque<BufferedFrame>,
    next_event_id: u64,

    event_buffer_size: usize,
    overflow_policy: OverflowPolicy,
}

struct BufferedFrame {
    event_id: u64,
    client_id: String,
    data: String,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(client) = self.new_clients.recv() => self.register(client).await,
                Some(dereg) = self.closed_clients.recv() => self.deregister(dereg),
                Some(client_id) = self.closing_clients.recv() => self.begin_close(&client_id),
                Some(event) = self.new_events.recv() => self.route(event).await,
                else => break,
            }
        }
    }

    async fn register(&mut self, mut client: ClientInfo) {
        if let Some(previous) = self.clients.remove(&client.client_id) {
            // The newcomer replaces the old stream; kick it and let its own
            // acknowledgement (carrying the stale serial) fall through later.
            if let Some(close) = previous.close {
                let _ = close.send(());
            }
        }

        if self.event_buffer_size > 0 {
            let recent = self
                .recently_disconnected
                .remove(&client.client_id)
                .is_some_and(|at| at.elapsed() < REPLAY_WINDOW);
            if recent {
                if let Some(last_seen) = client.last_seen_event_id {
                    self.replay(&mut client, last_seen).await;
                }
            }
        }

        let _ = self
            .lifecycle
            .send(LifecycleEvent::Connected(client.client_id.clone()));
        self.clients.insert(client.client_id.clone(), client);
    }

    /// Re-sends the buffered tail past `last_seen` to a reconnecting client. Duplicates are
    /// possible by contract; clients are required to be idempotent.
    async fn replay(&mut self, client: &mut ClientInfo, last_seen: u64) {
        let frames = self
            .buffer
            .iter()
            .filter(|f| f.client_id == client.client_id && f.event_id > last_seen)
            .map(|f| OutboundFrame {
                event_id: Some(f.event_id),
                data: f.data.clone(),
            })
            .collect::<Vec<_>>();
        let replayed = frames.len();
        for frame in frames {
            if !Self::deliver(client, frame, self.overflow_policy).await {
                break;
            }
        }
        if replayed > 0 {
            tracing::debug!(
                client_id = %client.client_id,
                frames = replayed,
                "replayed buffered events",
            );
        }
    }

    fn begin_close(&mut self, client_id: &str) {
        // Two-phase: signal only. The entry is removed once the stream acknowledges it has
        // stopped reading, so nothing is ever sent on channels the consumer abandoned.
        if let Some(client) = self.clients.get_mut(client_id) {
            if let Some(close) = client.close.take() {
                let _ = close.send(());
            }
        }
    }

    fn deregister(&mut self, dereg: Deregistration) {
        let matches = self
            .clients
            .get(&dereg.client_id)
            .is_some_and(|c| c.serial == dereg.serial);
        if !matches {
            // A late acknowledgement from a connection that has already been replaced.
            return;
        }
        self.clients.remove(&dereg.client_id);

        let now = Instant::now();
        self.recently_disconnected
            .retain(|_, at| now.duration_since(*at) < REPLAY_WINDOW);
        self.recently_disconnected.insert(dereg.client_id.clone(), now);

        let _ = self
            .lifecycle
            .send(LifecycleEvent::Disconnected(dereg.client_id));
    }

    async fn route(&mut self, event: WrappedEvent) {
        let Some(client) = self.clients.get_mut(&event.client_id) else {
            // The addressed client is not connected to this node.
            tracing::debug!(client_id = %event.client_id, "dropping event for unknown client");
            return;
        };

        let kind = if event.finished {
            OperationType::Complete
        } else {
            OperationType::Data
        };
        let payload = match serde_json::value::to_raw_value(&event.query_result) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::error!(
                    client_id = %event.client_id,
                    subscription_id = %event.subscription_id,
                    error = %e,
                    "failed to marshal event, dropping it",
                );
                return;
            }
        };
        let frame = Frame {
            kind,
            id: Some(event.subscription_id),
            payload,
        };
        let data = match frame.encode() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(
                    client_id = %event.client_id,
                    error = %e,
                    "failed to marshal event, dropping it",
                );
                return;
            }
        };

        let event_id = (self.event_buffer_size > 0).then(|| {
            let event_id = self.next_event_id;
            self.next_event_id += 1;
            self.buffer.push_back(BufferedFrame {
                event_id,
                client_id: event.client_id.clone(),
                data: data.clone(),
            });
            while self.buffer.len() > self.event_buffer_size {
                self.buffer.pop_front();
            }
            event_id
        });

        Self::deliver(client, OutboundFrame { event_id, data }, self.overflow_policy).await;
    }

    /// Hands one frame to a client's stream. Returns whether the stream is still readable.
    async fn deliver(client: &mut ClientInfo, frame: OutboundFrame, policy: OverflowPolicy) -> bool {
        match policy {
            OverflowPolicy::Block => {
                if client.outbound.send(frame).await.is_err() {
                    // The consumer is gone; its acknowledgement is still in flight.
                    tracing::debug!(client_id = %client.client_id, "outbound channel closed");
                    return false;
                }
                true
            }
            OverflowPolicy::Drop => match client.outbound.try_send(frame) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        client_id = %client.client_id,
                        "client is not keeping up, dropping event",
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(client_id = %client.client_id, "outbound channel closed");
                    false
                }
            },
        }
    }
}
