//! The subscription endpoint handling inbound control frames.

use std::sync::Arc;

use axum::{
    Extension,
    body::Bytes,
    extract::rejection::BytesRejection,
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};

use crate::{
    Handlers,
    adapter::{SubscriberRef, SubscriptionAdapter, SubscriptionQuery},
    client_id::{CLIENT_ID_HEADER, ClientId},
    protocol::{Frame, OperationType, validate_payload},
    response::ControlResponse,
    schema::Schema,
};

/// The `POST` handler for control frames.
///
/// Decodes one protocol frame from the body and answers synchronously: `GQL_INIT` is
/// acknowledged with the resolved client id echoed in the `X-Gql-Sse-Client-Id` header,
/// `GQL_START` is validated against the schema and handed to the adapter, `GQL_STOP` is handed
/// to the adapter, and `GQL_CONNECTION_TERMINATE` asks the broker to tear down the client's
/// event stream. Anything else is a 400.
pub async fn subscribe<S, A>(
    Extension(handlers): Extension<Arc<Handlers<S, A>>>,
    client_id: ClientId,
    body: Result<Bytes, BytesRejection>,
) -> Response
where
    S: Schema,
    A: SubscriptionAdapter,
{
    let Ok(body) = body else {
        return finish(ControlResponse::server_error(), &client_id);
    };
    let Ok(frame) = Frame::decode(&body) else {
        return finish(ControlResponse::bad_request(), &client_id);
    };

    let response = match frame.kind {
        OperationType::ConnectionInit => init(&client_id),
        OperationType::Start => start(&handlers, &client_id, &frame).await,
        OperationType::Stop => stop(&handlers, &client_id, frame.id).await,
        OperationType::ConnectionTerminate => {
            handlers.broker().request_close(client_id.as_str());
            ControlResponse::ok()
        }
        _ => ControlResponse::bad_request(),
    };
    finish(response, &client_id)
}

/// The convenience `DELETE` handler: the carried frame is treated as a `GQL_STOP` regardless
/// of its `type`.
pub async fn unsubscribe<S, A>(
    Extension(handlers): Extension<Arc<Handlers<S, A>>>,
    client_id: ClientId,
    body: Result<Bytes, BytesRejection>,
) -> Response
where
    S: Schema,
    A: SubscriptionAdapter,
{
    let Ok(body) = body else {
        return finish(ControlResponse::server_error(), &client_id);
    };
    let Ok(frame) = Frame::decode(&body) else {
        return finish(ControlResponse::bad_request(), &client_id);
    };
    let response = stop(&handlers, &client_id, frame.id).await;
    finish(response, &client_id)
}

fn init(client_id: &ClientId) -> ControlResponse {
    match HeaderValue::from_str(client_id.as_str()) {
        Ok(value) => {
            ControlResponse::ok().with_header(HeaderName::from_static(CLIENT_ID_HEADER), value)
        }
        // A client id that cannot travel in a header cannot be pinned; still acknowledge.
        Err(_) => ControlResponse::ok(),
    }
}

async fn start<S, A>(
    handlers: &Handlers<S, A>,
    client_id: &ClientId,
    frame: &Frame,
) -> ControlResponse
where
    S: Schema,
    A: SubscriptionAdapter,
{
    if frame.payload.is_none() {
        return ControlResponse::bad_request();
    }
    let Some(payload) = frame.start_payload() else {
        return ControlResponse::bad_request();
    };
    if let Err(error) = validate_payload(handlers.schema(), &payload) {
        return ControlResponse::validation_error(&error);
    }

    let subscriber = SubscriberRef {
        client_id: client_id.as_str().to_owned(),
        subscription_id: frame.id.clone().unwrap_or_default(),
    };
    let query = SubscriptionQuery {
        request_string: payload.query,
        variable_values: payload.variables,
    };
    match handlers
        .adapter()
        .notify_new_subscription(subscriber, query)
        .await
    {
        Ok(()) => ControlResponse::ok(),
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "adapter rejected subscription");
            ControlResponse::server_error()
        }
    }
}

async fn stop<S, A>(
    handlers: &Handlers<S, A>,
    client_id: &ClientId,
    subscription_id: Option<String>,
) -> ControlResponse
where
    S: Schema,
    A: SubscriptionAdapter,
{
    let subscriber = SubscriberRef {
        client_id: client_id.as_str().to_owned(),
        subscription_id: subscription_id.unwrap_or_default(),
    };
    match handlers.adapter().notify_unsubscribe(subscriber).await {
        Ok(()) => ControlResponse::ok(),
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "adapter rejected unsubscribe");
            ControlResponse::server_error()
        }
    }
}

fn finish(mut response: ControlResponse, client_id: &ClientId) -> Response {
    if client_id.is_generated() {
        if let Some(cookie) = client_id.to_set_cookie() {
            response.headers_mut().append(header::SET_COOKIE, cookie);
        }
    }
    response.into_response()
}
