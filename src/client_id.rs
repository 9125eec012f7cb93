//! Derivation of a stable per-client id from an inbound request.
//!
//! The id is resolved in strict priority order: a [`ClientId`] already attached to the request
//! extensions (custom middleware wins), the [`CLIENT_ID_QUERY_PARAM`] query-string parameter,
//! the [`CLIENT_ID_HEADER`] header, the [`CLIENT_ID_COOKIE`] cookie, and finally a freshly
//! generated nanoid that is pinned with a cookie on the response.
//!
//! Browsers cannot set headers on an `EventSource` GET, so the cookie and the query string are
//! the only carriers that reliably reach the streaming endpoint. Note that multiple tabs share
//! the cookie: if each tab must hold its own stream, issue a `GQL_INIT` first and pin the
//! echoed id via the query string.

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Query, Request},
    http::{HeaderValue, header, request::Parts},
    middleware::Next,
    response::Response,
};
use cookie::Cookie;
use nanoid::nanoid;
use serde::Deserialize;

/// The query-string parameter carrying the client id.
pub const CLIENT_ID_QUERY_PARAM: &str = "gql_sse_client_id";

/// The header carrying the client id. Matched case-insensitively on requests; echoed verbatim
/// on `GQL_INIT` responses. If set multiple times, the first value wins.
pub const CLIENT_ID_HEADER: &str = "x-gql-sse-client-id";

/// The cookie carrying the client id, set by the server when no other carrier is present.
pub const CLIENT_ID_COOKIE: &str = "gql_sse_client_id";

/// A resolved client id.
///
/// Extracting it never fails: when no carrier is present on the request a fresh id is
/// generated, and the endpoint handlers then pin it with a [`CLIENT_ID_COOKIE`] on their
/// response. Attach a `ClientId` to the request extensions from your own middleware to
/// override the discovery entirely.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientId {
    value: String,
    generated: bool,
}

impl ClientId {
    /// Wraps an externally chosen client id.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            generated: false,
        }
    }

    fn generate() -> Self {
        Self {
            value: nanoid!(),
            generated: true,
        }
    }

    /// Returns the id itself.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Whether this id was generated for the current request rather than presented by the
    /// client. Generated ids must be pinned with a cookie on the response to be stable.
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// The `Set-Cookie` value pinning this id, or `None` for values that cannot be carried in
    /// a header.
    pub(crate) fn to_set_cookie(&self) -> Option<HeaderValue> {
        let cookie = Cookie::build((CLIENT_ID_COOKIE, self.value.as_str()))
            .path("/")
            .build();
        HeaderValue::from_str(&cookie.to_string()).ok()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Deserialize)]
struct ClientIdQuery {
    gql_sse_client_id: Option<String>,
}

/// Resolves the client id from the request carriers, without generating one.
fn resolve(parts: &Parts) -> Option<ClientId> {
    if let Some(id) = parts.extensions.get::<ClientId>() {
        return Some(id.clone());
    }
    if let Ok(Query(query)) = Query::<ClientIdQuery>::try_from_uri(&parts.uri) {
        if let Some(id) = query.gql_sse_client_id.filter(|id| !id.is_empty()) {
            return Some(ClientId::new(id));
        }
    }
    if let Some(id) = parts
        .headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
    {
        return Some(ClientId::new(id));
    }
    for value in parts.headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for cookie in Cookie::split_parse(value).flatten() {
            if cookie.name() == CLIENT_ID_COOKIE && !cookie.value().is_empty() {
                return Some(ClientId::new(cookie.value()));
            }
        }
    }
    None
}

impl<S: Send + Sync> FromRequestParts<S> for ClientId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(resolve(parts).unwrap_or_else(ClientId::generate))
    }
}

/// Middleware resolving the client id once per request and pinning it into the request
/// extensions, so every downstream handler sees a single uniform source. When the id had to be
/// generated, the fallback cookie is set on the response here.
pub async fn provide_client_id(req: Request, next: Next) -> Response {
    let (mut parts, body) = req.into_parts();
    let resolved = resolve(&parts).unwrap_or_else(ClientId::generate);
    let set_cookie = resolved.is_generated().then(|| resolved.to_set_cookie());
    parts.extensions.insert(ClientId::new(resolved.value));

    let mut response = next.run(Request::from_parts(parts, body)).await;
    if let Some(Some(cookie)) = set_cookie {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

#[cfg(test)]
mod test {
    use axum::http::Request;

    use super::*;

    fn parts(req: Request<()>) -> Parts {
        req.into_parts().0
    }

    #[test]
    fn extensions_take_priority() {
        let mut req = Request::get(format!("/?{CLIENT_ID_QUERY_PARAM}=from-query"))
            .header(CLIENT_ID_HEADER, "from-header")
            .body(())
            .unwrap();
        req.extensions_mut().insert(ClientId::new("from-middleware"));
        let id = resolve(&parts(req)).unwrap();
        assert_eq!(id.as_str(), "from-middleware");
        assert!(!id.is_generated());
    }

    #[test]
    fn query_string_beats_header_and_cookie() {
        let req = Request::get(format!("/?{CLIENT_ID_QUERY_PARAM}=from-query"))
            .header(CLIENT_ID_HEADER, "from-header")
            .header(header::COOKIE, format!("{CLIENT_ID_COOKIE}=from-cookie"))
            .body(())
            .unwrap();
        assert_eq!(resolve(&parts(req)).unwrap().as_str(), "from-query");
    }

    #[test]
    fn header_beats_cookie() {
        let req = Request::get("/")
            .header(CLIENT_ID_HEADER, "from-header")
            .header(header::COOKIE, format!("{CLIENT_ID_COOKIE}=from-cookie"))
            .body(())
            .unwrap();
        assert_eq!(resolve(&parts(req)).unwrap().as_str(), "from-header");
    }

    #[test]
    fn header_is_matched_case_insensitively() {
        let req = Request::get("/")
            .header("X-Gql-Sse-Client-Id", "from-header")
            .body(())
            .unwrap();
        assert_eq!(resolve(&parts(req)).unwrap().as_str(), "from-header");
    }

    #[test]
    fn cookie_is_found_among_others() {
        let req = Request::get("/")
            .header(
                header::COOKIE,
                format!("theme=dark; {CLIENT_ID_COOKIE}=from-cookie; lang=en"),
            )
            .body(())
            .unwrap();
        assert_eq!(resolve(&parts(req)).unwrap().as_str(), "from-cookie");
    }

    #[test]
    fn empty_values_fall_through() {
        let req = Request::get(format!("/?{CLIENT_ID_QUERY_PARAM}="))
            .header(CLIENT_ID_HEADER, "")
            .header(header::COOKIE, format!("{CLIENT_ID_COOKIE}=from-cookie"))
            .body(())
            .unwrap();
        assert_eq!(resolve(&parts(req)).unwrap().as_str(), "from-cookie");
    }

    #[test]
    fn nothing_resolves_to_none() {
        let req = Request::get("/").body(()).unwrap();
        assert_eq!(resolve(&parts(req)), None);
    }

    #[tokio::test]
    async fn generated_ids_are_nanoids() {
        let mut parts = parts(Request::get("/").body(()).unwrap());
        let id = ClientId::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert!(id.is_generated());
        assert_eq!(id.as_str().len(), 21);
        let cookie = id.to_set_cookie().unwrap();
        let cookie = Cookie::parse(cookie.to_str().unwrap().to_owned()).unwrap();
        assert_eq!(cookie.name(), CLIENT_ID_COOKIE);
        assert_eq!(cookie.value(), id.as_str());
        assert_eq!(cookie.path(), Some("/"));
    }
}
