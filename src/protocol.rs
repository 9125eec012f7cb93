//! Implementation of the control-frame subset of the
//! [`subscriptions-transport-ws` GraphQL over WebSocket Protocol][proto], repackaged for
//! HTTP + Server-Sent Events.
//!
//! `GQL_INIT`, `GQL_START`, `GQL_STOP` and `GQL_CONNECTION_TERMINATE` are sent to the
//! subscription endpoint, which answers synchronously with `GQL_CONNECTION_ACK` or `GQL_ERROR`.
//! `GQL_DATA`, `GQL_COMPLETE` and `GQL_KEEPALIVE` travel over the streaming endpoint.
//!
//! [proto]: https://github.com/apollographql/subscriptions-transport-ws/blob/v0.11.0/PROTOCOL.md

use juniper::{
    GraphQLError,
    parser::parse_document_source,
    validation::{ValidatorContext, visit_all_rules},
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{schema::Schema, util::default_for_null};

/// Pre-marshaled JSON representing the keep-alive frame.
pub const KEEP_ALIVE_PAYLOAD: &str = r#"{"type":"GQL_KEEPALIVE"}"#;

/// The operation type of a control [`Frame`], using the wire strings verbatim.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OperationType {
    // Client to server.
    /// Sent by the client once it wants to pin a client id.
    #[serde(rename = "GQL_INIT")]
    ConnectionInit,
    /// Registers a subscription for the sending client.
    #[serde(rename = "GQL_START")]
    Start,
    /// Cancels a subscription of the sending client.
    #[serde(rename = "GQL_STOP")]
    Stop,
    /// Requests tear-down of the sending client's event stream.
    #[serde(rename = "GQL_CONNECTION_TERMINATE")]
    ConnectionTerminate,

    // Server to client.
    /// Positive synchronous answer of the subscription endpoint.
    #[serde(rename = "GQL_CONNECTION_ACK")]
    ConnectionAck,
    /// Carries one result for a subscription over the event stream.
    #[serde(rename = "GQL_DATA")]
    Data,
    /// Negative synchronous answer of the subscription endpoint.
    #[serde(rename = "GQL_ERROR")]
    Error,
    /// Signals that no more results will follow for a subscription.
    #[serde(rename = "GQL_COMPLETE")]
    Complete,
    /// Emitted periodically on otherwise idle event streams.
    #[serde(rename = "GQL_KEEPALIVE")]
    ConnectionKeepAlive,

    /// Any operation type this server does not understand.
    #[serde(other, skip_serializing)]
    Unknown,
}

/// A single control frame as it appears on the wire: `{"type", "id"?, "payload"?}`.
///
/// The `payload` is retained as raw bytes and only parsed once the operation type demands it
/// (e.g. [`OperationType::Start`] requires a [`StartPayload`]), so frames that are merely
/// forwarded never pay for a second round of JSON parsing. Re-encoding writes the retained
/// bytes back verbatim.
#[derive(Debug, Deserialize, Serialize)]
pub struct Frame {
    /// The operation type of this frame.
    #[serde(rename = "type")]
    pub kind: OperationType,

    /// The subscription id this frame refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The raw payload bytes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl Frame {
    /// Decodes a frame from a request or event body.
    pub fn decode(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Encodes this frame into its wire representation.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parses the retained payload bytes as a [`StartPayload`].
    ///
    /// Returns `None` when the frame carries no payload or the payload does not describe a
    /// GraphQL operation.
    pub fn start_payload(&self) -> Option<StartPayload> {
        let raw = self.payload.as_deref()?;
        serde_json::from_str(raw.get()).ok()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.id == other.id
            && self.payload.as_deref().map(RawValue::get)
                == other.payload.as_deref().map(RawValue::get)
    }
}

/// The payload of a client's [`OperationType::Start`] frame. This describes the operation whose
/// results the subscription should stream, but does not trigger its execution.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    /// The document body.
    pub query: String,

    /// The optional operation name (required if the document contains multiple operations).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    /// The optional variables.
    #[serde(default, deserialize_with = "default_for_null")]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// Parses and validates an operation against `schema` without executing it.
///
/// Returns the parse error or the collected validation rule errors on failure.
pub fn validate_payload<S: Schema>(schema: &S, payload: &StartPayload) -> Result<(), GraphQLError> {
    let schema = schema.schema_type();
    let document =
        parse_document_source(&payload.query, schema).map_err(GraphQLError::ParseError)?;
    let mut ctx = ValidatorContext::new(schema, &document);
    visit_all_rules(&mut ctx, &document);
    let errors = ctx.into_errors();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(GraphQLError::ValidationError(errors))
    }
}
