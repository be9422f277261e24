#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use sandbox_relay::router::{build_router, AppState, RelayConfig};
use sandbox_relay_sandbox_provider::testing::MockSandboxProvider;
use sandbox_relay_sandbox_provider::CommandOutput;

pub const TEMPLATE: &str = "test-template";
pub const EVENT_FRAME: &str = "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n";

pub struct TestApp {
    pub app: Router,
    pub provider: Arc<MockSandboxProvider>,
}

impl TestApp {
    pub fn new(agent_port: u16) -> Self {
        Self::with_config(RelayConfig {
            template: TEMPLATE.to_string(),
            agent_port,
            ..RelayConfig::default()
        })
    }

    pub fn with_config(config: RelayConfig) -> Self {
        let provider = Arc::new(MockSandboxProvider::new());
        let state = AppState::new(provider.clone(), config).expect("app state");
        Self {
            app: build_router(state),
            provider,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec();
        (status, headers, body)
    }

    pub async fn json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(path);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let (status, _, bytes) = self.request(request).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    /// Script `pm2 jlist` to report `name` as online.
    pub fn pm2_online(&self, name: &str) {
        self.provider.script(
            "pm2 jlist",
            CommandOutput {
                stdout: json!([{ "name": name, "pm2_env": { "status": "online" } }]).to_string(),
                ..CommandOutput::default()
            },
        );
    }

    pub fn commands(&self) -> Vec<String> {
        self.provider
            .commands()
            .into_iter()
            .map(|command| command.cmd)
            .collect()
    }
}

/// Stand-in agent server: `/event` serves one SSE frame, every other path
/// echoes the request back as JSON.
pub async fn spawn_agent() -> SocketAddr {
    let app = Router::new()
        .route(
            "/event",
            get(|| async { ([(header::CONTENT_TYPE, "text/event-stream")], EVENT_FRAME) }),
        )
        .fallback(echo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind agent");
    let addr = listener.local_addr().expect("agent addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    listener.local_addr().expect("addr").port()
}

async fn echo(request: Request<Body>) -> impl IntoResponse {
    let (parts, body) = request.into_parts();
    let body = to_bytes(body, usize::MAX).await.unwrap_or_default();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    (
        StatusCode::CREATED,
        [("x-agent", "echo")],
        Json(json!({
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "host": header("host"),
            "xTest": header("x-test"),
            "authorization": header("authorization"),
            "body": String::from_utf8_lossy(&body),
        })),
    )
}
