// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Request filtering and response stamping for the metadata routes.
//!
//! The server listens on a loopback address, so the threat is a web page
//! reaching it through the browser (DNS rebinding). Metadata SDKs never send
//! browser headers, so their presence is enough to reject a request.
//!
//! Order on the instance metadata routes:
//!
//! 1. [`require_session_token`]
//! 2. [`reject_browser_requests`]
//! 3. [`stamp_response_headers`]
//!
//! The container route skips the token check and filters with
//! [`reject_browser_requests_json`].

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, ETAG, HOST, LAST_MODIFIED, SERVER, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use crate::application::AppState;
use crate::constants::{
    ALLOWED_HOSTS, BROWSER_USER_AGENT_MARKER, DENIED_HEADERS, PLAINTEXT_CONTENT_TYPE,
    SERVER_HEADER_VALUE, TOKEN_HEADER, TOKEN_TTL_HEADER,
};
use crate::errors::{AppError, PlainText};

/// Validates the IMDSv2 session token, if any, and reports its remaining TTL.
///
/// Requests without a token pass unless `--imdsv2-required` is set.
pub async fn require_session_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(TOKEN_HEADER)
        .map(|value| value.to_str().unwrap_or_default().to_string());

    let remaining = match token {
        None if state.options.imdsv2_required => {
            tracing::debug!("[agent] rejecting request without session token");
            return PlainText(AppError::Forbidden).into_response();
        }
        None => None,
        Some(token) => match state.sessions.check_token(&token).await {
            Some(remaining) => Some(remaining),
            None => {
                tracing::debug!("[agent] rejecting request with invalid session token");
                return PlainText(AppError::Forbidden).into_response();
            }
        },
    };

    let mut response = next.run(request).await;
    if let Some(remaining) = remaining {
        response
            .headers_mut()
            .insert(TOKEN_TTL_HEADER, HeaderValue::from(remaining));
    }
    response
}

/// Rejects anything that looks like it came from a web browser, with a plain
/// text body.
pub async fn reject_browser_requests(request: Request, next: Next) -> Response {
    if let Some(reason) = browser_rejection(request.headers()) {
        log_rejection(&request, &reason);
        return PlainText(AppError::Forbidden).into_response();
    }
    next.run(request).await
}

/// Same filter as [`reject_browser_requests`], answering with the JSON error
/// body the container route uses.
pub async fn reject_browser_requests_json(request: Request, next: Next) -> Response {
    if let Some(reason) = browser_rejection(request.headers()) {
        log_rejection(&request, &reason);
        return AppError::Forbidden.into_response();
    }
    next.run(request).await
}

fn log_rejection(request: &Request, reason: &str) {
    tracing::warn!(
        "[agent] rejecting {} {}: {}",
        request.method(),
        request.uri().path(),
        reason
    );
}

/// Returns why a request is refused, or `None` if it may pass.
fn browser_rejection(headers: &HeaderMap) -> Option<String> {
    // raw bytes, so obs-text in the value cannot hide the marker
    let marker = BROWSER_USER_AGENT_MARKER.as_bytes();
    let browser = headers.get(USER_AGENT).is_some_and(|value| {
        value
            .as_bytes()
            .windows(marker.len())
            .any(|window| window.eq_ignore_ascii_case(marker))
    });
    if browser {
        return Some("browser user agent".to_string());
    }

    if let Some(header) = DENIED_HEADERS.iter().find(|name| headers.contains_key(**name)) {
        return Some(format!("{header} header present"));
    }

    if let Some(host) = headers.get(HOST) {
        let host = host.to_str().unwrap_or_default();
        if !ALLOWED_HOSTS.contains(&strip_port(host)) {
            return Some(format!("host `{host}` not allowed"));
        }
    }

    None
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Adds the headers real metadata responses carry.
pub async fn stamp_response_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    let etag = format!("\"{:016x}\"", fastrand::u64(..));
    let last_modified = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(LAST_MODIFIED, value);
    }
    headers.insert(SERVER, HeaderValue::from_static(SERVER_HEADER_VALUE));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(PLAINTEXT_CONTENT_TYPE));

    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::HeaderName;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        map
    }

    #[test]
    fn test_sdk_request_passes() {
        assert_eq!(
            browser_rejection(&headers(&[
                ("user-agent", "aws-sdk-go-v2/1.30.0"),
                ("host", "169.254.169.254")
            ])),
            None
        );
        assert_eq!(browser_rejection(&HeaderMap::new()), None);
    }

    #[test]
    fn test_browser_user_agent_is_rejected() {
        assert!(
            browser_rejection(&headers(&[(
                "user-agent",
                "MoZiLLa/5.0 (X11; Linux x86_64)"
            )]))
            .is_some()
        );
    }

    #[test]
    fn test_browser_user_agent_with_non_utf8_bytes_is_rejected() {
        let mut map = HeaderMap::new();
        map.insert(
            USER_AGENT,
            HeaderValue::from_bytes(b"Mozilla/5.0 (X11; \xe9)").unwrap(),
        );
        assert!(browser_rejection(&map).is_some());

        let mut map = HeaderMap::new();
        map.insert(
            USER_AGENT,
            HeaderValue::from_bytes(b"aws-sdk-rust \xe9").unwrap(),
        );
        assert_eq!(browser_rejection(&map), None);
    }

    #[test]
    fn test_denied_headers_are_rejected_regardless_of_value() {
        for name in ["referer", "origin", "x-forwarded-for"] {
            assert!(
                browser_rejection(&headers(&[(name, "")])).is_some(),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_host_allow_list() {
        for host in ["localhost", "127.0.0.1", "169.254.169.254", "127.0.0.1:9911"] {
            assert_eq!(browser_rejection(&headers(&[("host", host)])), None, "{host}");
        }
        for host in ["evil.example.com", "localhost.evil.com", "127.0.0.2"] {
            assert!(browser_rejection(&headers(&[("host", host)])).is_some(), "{host}");
        }
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("localhost:80"), "localhost");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
