//! The streaming endpoint owning one SSE connection per client.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt as _;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    Handlers,
    adapter::SubscriptionAdapter,
    broker::{Broker, ClientInfo, OutboundFrame},
    client_id::ClientId,
    protocol::KEEP_ALIVE_PAYLOAD,
    schema::Schema,
};

/// The SSE reconnection header carrying the last replay id a client has processed.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Sends the deregistration acknowledgement when the stream stops being read, whether the
/// client went away or the broker asked for tear-down. The broker never writes to this
/// connection's channels again afterwards.
struct DisconnectGuard {
    broker: Broker,
    client_id: String,
    serial: u64,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.broker
            .acknowledge_closed(std::mem::take(&mut self.client_id), self.serial);
    }
}

impl From<OutboundFrame> for Event {
    fn from(frame: OutboundFrame) -> Self {
        let event = Event::default().data(frame.data);
        match frame.event_id {
            Some(id) => event.id(id.to_string()),
            None => event,
        }
    }
}

/// The `GET` handler producing a client's event stream.
///
/// Registers the client with the broker and pumps its outbound frames as SSE `data:` events
/// until either side disconnects. Idle streams carry a `GQL_KEEPALIVE` event at the configured
/// interval so intermediate proxies do not cut the connection.
pub async fn stream<S, A>(
    Extension(handlers): Extension<Arc<Handlers<S, A>>>,
    client_id: ClientId,
    headers: HeaderMap,
) -> Response
where
    S: Schema,
    A: SubscriptionAdapter,
{
    let broker = handlers.broker().clone();
    let config = handlers.config();

    let last_seen_event_id = if config.event_buffer_size > 0 {
        headers
            .get(LAST_EVENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    } else {
        None
    };

    let (outbound_tx, outbound_rx) = mpsc::channel(config.client_channel_capacity.max(1));
    let (close_tx, close_rx) = oneshot::channel();
    let serial = broker.next_serial();

    let registered = broker.register(ClientInfo {
        client_id: client_id.as_str().to_owned(),
        serial,
        outbound: outbound_tx,
        close: Some(close_tx),
        last_seen_event_id,
    });
    if registered.is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "event broker is not running").into_response();
    }

    let guard = DisconnectGuard {
        broker,
        client_id: client_id.as_str().to_owned(),
        serial,
    };
    let frames = ReceiverStream::new(outbound_rx)
        .map(move |frame| {
            let _held_until_the_stream_drops = &guard;
            Ok::<_, Infallible>(Event::from(frame))
        })
        .take_until(close_rx);

    let mut response = Sse::new(frames)
        .keep_alive(
            KeepAlive::new()
                .interval(config.keep_alive_interval)
                .event(Event::default().data(KEEP_ALIVE_PAYLOAD)),
        )
        .into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if client_id.is_generated() {
        if let Some(cookie) = client_id.to_set_cookie() {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
    response
}
