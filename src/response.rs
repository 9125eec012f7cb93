//! Synchronous answers of the subscription endpoint, as protocol frames.

use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use juniper::GraphQLError;
use serde::Serialize;

use crate::protocol::{Frame, OperationType};

const ACK_BODY: &str = r#"{"type":"GQL_CONNECTION_ACK"}"#;
const BAD_REQUEST_BODY: &str =
    r#"{"type":"GQL_ERROR","payload":{"errors":[{"message":"Please send a valid payload"}]}}"#;
const SERVER_ERROR_BODY: &str =
    r#"{"type":"GQL_ERROR","payload":{"errors":[{"message":"Something went wrong"}]}}"#;

/// The payload of a [`OperationType::Error`] frame.
#[derive(Debug, Serialize)]
struct ErrorsPayload<'a> {
    errors: &'a GraphQLError,
}

/// A synchronous answer of the subscription endpoint: an HTTP status code, a pre-marshaled
/// protocol frame as the body, and any extra headers to set on the response.
#[derive(Debug)]
pub struct ControlResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

impl ControlResponse {
    /// The default positive answer: a 200 carrying [`OperationType::ConnectionAck`].
    pub fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: ACK_BODY.into(),
        }
    }

    /// The default answer to malformed or unrecognized frames: a 400 carrying
    /// [`OperationType::Error`].
    pub fn bad_request() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: BAD_REQUEST_BODY.into(),
        }
    }

    /// The default answer to internal failures: a 500 carrying [`OperationType::Error`].
    pub fn server_error() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            headers: HeaderMap::new(),
            body: SERVER_ERROR_BODY.into(),
        }
    }

    /// A 400 [`OperationType::Error`] frame carrying the formatted parse or validation errors
    /// under `payload.errors`.
    pub fn validation_error(error: &GraphQLError) -> Self {
        let payload = match serde_json::value::to_raw_value(&ErrorsPayload { errors: error }) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "failed to marshal validation errors");
                return Self::server_error();
            }
        };
        let frame = Frame {
            kind: OperationType::Error,
            id: None,
            payload: Some(payload),
        };
        match frame.encode() {
            Ok(body) => Self {
                status: StatusCode::BAD_REQUEST,
                headers: HeaderMap::new(),
                body,
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to marshal validation errors");
                Self::server_error()
            }
        }
    }

    /// Sets an extra header on the response.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

impl IntoResponse for ControlResponse {
    fn into_response(self) -> Response {
        let mut headers = self.headers;
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        (self.status, headers, self.body).into_response()
    }
}
