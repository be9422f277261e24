//! Reverse proxy from `/api/agent/{projectId}/{sandboxId}/*` to the agent
//! server inside the sandbox.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use sandbox_relay_error::RelayError;
use sandbox_relay_sandbox_provider::SandboxProvider;

use crate::router::ApiError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ROUTE_PREFIX_SEGMENTS: usize = 4;

/// Request headers the HTTP client sets itself.
const SKIPPED_REQUEST_HEADERS: [&str; 4] =
    ["host", "content-length", "connection", "transfer-encoding"];
const SKIPPED_RESPONSE_HEADERS: [&str; 4] =
    ["content-length", "connection", "transfer-encoding", "keep-alive"];

#[derive(Debug, Clone)]
pub struct AgentDispatcher {
    provider: Arc<dyn SandboxProvider>,
    http: reqwest::Client,
    agent_port: u16,
    max_body_bytes: usize,
}

impl AgentDispatcher {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        agent_port: u16,
        max_body_bytes: usize,
    ) -> Result<Self, reqwest::Error> {
        // No overall timeout: event streams stay open for the life of a session.
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            provider,
            http,
            agent_port,
            max_body_bytes,
        })
    }

    pub async fn dispatch(&self, project_id: &str, sandbox_id: &str, request: Request) -> Response {
        let (parts, body) = request.into_parts();

        let sandbox = match self.provider.connect(sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                tracing::warn!(project_id, sandbox_id, error = %err, "sandbox lookup failed");
                return upstream_unavailable();
            }
        };

        if content_length(&parts.headers).is_some_and(|len| len > self.max_body_bytes) {
            return self.payload_too_large();
        }
        let body = match to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(err) => {
                tracing::debug!(project_id, sandbox_id, error = %err, "rejecting proxied body");
                return self.payload_too_large();
            }
        };

        let target = format!("{}{}", sandbox.url(self.agent_port), upstream_path(&parts.uri));
        let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
            return upstream_unavailable();
        };
        tracing::info!(project_id, sandbox_id, method = %method, target = %target, "proxying agent request");

        let upstream = self
            .http
            .request(method, &target)
            .headers(forwarded_request_headers(&parts.headers))
            .body(body)
            .send()
            .await;
        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(target = %target, error = %err, "agent request failed");
                return upstream_unavailable();
            }
        };

        let status =
            StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let headers = forwarded_response_headers(upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    fn payload_too_large(&self) -> Response {
        ApiError::from(RelayError::PayloadTooLarge {
            limit: self.max_body_bytes,
        })
        .into_response()
    }
}

/// Path and query to request upstream: the route prefix is removed and an
/// empty remainder becomes `/`.
pub fn upstream_path(uri: &Uri) -> String {
    let path = uri.path().trim_start_matches('/');
    let rest = path
        .splitn(ROUTE_PREFIX_SEGMENTS + 1, '/')
        .nth(ROUTE_PREFIX_SEGMENTS)
        .unwrap_or_default();
    match uri.query() {
        Some(query) => format!("/{rest}?{query}"),
        None => format!("/{rest}"),
    }
}

fn upstream_unavailable() -> Response {
    (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn forwarded_request_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut forwarded = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        forwarded.append(name, value);
    }
    forwarded
}

fn forwarded_response_headers(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) else {
            continue;
        };
        forwarded.append(name, value);
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(uri: &str) -> String {
        upstream_path(&uri.parse::<Uri>().expect("uri"))
    }

    #[test]
    fn strips_route_prefix_and_keeps_query() {
        assert_eq!(
            path("/api/agent/p1/sbx-1/session/abc/message?limit=5&x=%20"),
            "/session/abc/message?limit=5&x=%20"
        );
        assert_eq!(path("/api/agent/p1/sbx-1/event"), "/event");
    }

    #[test]
    fn empty_remainder_is_root() {
        assert_eq!(path("/api/agent/p1/sbx-1"), "/");
        assert_eq!(path("/api/agent/p1/sbx-1/"), "/");
        assert_eq!(path("/api/agent/p1/sbx-1?x=1"), "/?x=1");
    }

    #[test]
    fn host_and_length_headers_are_not_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("relay.local"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("12"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.append("x-custom", HeaderValue::from_static("a"));
        headers.append("x-custom", HeaderValue::from_static("b"));

        let forwarded = forwarded_request_headers(&headers);
        assert!(forwarded.get("host").is_none());
        assert!(forwarded.get("content-length").is_none());
        assert!(forwarded.get("connection").is_none());
        assert_eq!(forwarded.get("authorization").map(|v| v.as_bytes()), Some(&b"Bearer t"[..]));
        assert_eq!(forwarded.get_all("x-custom").iter().count(), 2);
    }
}
