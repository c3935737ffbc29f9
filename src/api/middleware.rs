use crate::app_state::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderValue, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::{error, warn};

pub const TOKEN_HEADER: &str = "x-auth-token";

const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'";

pub async fn log_request_errors(req: Request<Body>, next: Next) -> Response {
    // Path only: the query string may carry the access token.
    let uri = req.uri().path().to_owned();
    let method = req.method().clone();

    let response = next.run(req).await;
    let status = response.status();
    if status.is_client_error() {
        // 4xx error
        warn!(
            method = %method,
            path = %uri,
            status = %status,
            "Client error"
        );
    } else if status.is_server_error() {
        // 5xx error
        error!(
            method = %method,
            path = %uri,
            status = %status,
            "Server error"
        );
    }

    response
}

/// Steps 1 to 4 of the gate: cooldown, quota, token and session.
///
/// Path checks run later, inside the handlers.
pub async fn require_token(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let token = request_token(&req);
    if let Err(error) = state.gate.admit(peer.ip(), token.as_deref()) {
        return error.into_response();
    }

    next.run(req).await
}

pub async fn security_headers(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CONTENT_SECURITY_POLICY),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The presented token: the `X-Auth-Token` header, else the `token` query
/// parameter. Empty values count as absent.
fn request_token<B>(req: &Request<B>) -> Option<String> {
    let from_header = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned);

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.token)
            .filter(|v| !v.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, header: Option<&'static str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = header {
            builder = builder.header(TOKEN_HEADER, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_token_from_header_wins() {
        let req = request("/api/files?token=fromquery", Some("fromheader"));
        assert_eq!(request_token(&req).as_deref(), Some("fromheader"));
    }

    #[test]
    fn test_token_from_query() {
        let req = request("/api/files?x=1&token=abc%20def", None);
        assert_eq!(request_token(&req).as_deref(), Some("abc def"));

        let req = request("/api/files?token=abc", Some(""));
        assert_eq!(request_token(&req).as_deref(), Some("abc"));
    }

    #[test]
    fn test_no_token() {
        assert_eq!(request_token(&request("/api/files", None)), None);
        assert_eq!(request_token(&request("/api/files?token=", None)), None);
    }
}
