use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use sandbox_relay_client::{
    AgentStream, AgentTransport, ByteStream, ClientError, MessageWithParts, Projection,
    StreamConfig, TransportFuture,
};
use serde_json::json;

const SESSION: &str = "ses_1";

#[derive(Default)]
struct FakeTransport {
    connects: AtomicUsize,
    /// SSE body served on every connect; `None` fails the connect.
    body: Option<&'static str>,
    history: Option<Vec<MessageWithParts>>,
}

impl AgentTransport for FakeTransport {
    fn history<'a>(&'a self, _session_id: &'a str) -> TransportFuture<'a, Vec<MessageWithParts>> {
        let history = self.history.clone();
        Box::pin(async move {
            history.ok_or(ClientError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        })
    }

    fn events(&self) -> TransportFuture<'_, ByteStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let body = self.body;
        Box::pin(async move {
            let Some(body) = body else {
                return Err(ClientError::Status {
                    status: 502,
                    body: "Upstream unavailable".to_string(),
                });
            };
            let first: Result<Bytes, ClientError> = Ok(Bytes::from_static(body.as_bytes()));
            let chunks = stream::iter(vec![first]).chain(stream::pending());
            Ok(Box::pin(chunks) as ByteStream)
        })
    }
}

fn config() -> StreamConfig {
    StreamConfig {
        reconnect_delay: Duration::from_secs(2),
    }
}

async fn wait_until(
    stream: &AgentStream,
    predicate: impl FnMut(&Projection) -> bool,
) -> Projection {
    let mut rx = stream.watch();
    let state = tokio::time::timeout(Duration::from_secs(30), rx.wait_for(predicate))
        .await
        .expect("projection reached expected state")
        .expect("stream still running")
        .clone();
    state
}

#[tokio::test(start_paused = true)]
async fn failed_connects_retry_on_fixed_delay() {
    let transport = Arc::new(FakeTransport::default());
    let stream = AgentStream::spawn(transport.clone(), Some(SESSION.to_string()), config());

    // Attempts at t=0s, 2s and 4s.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

    let state = stream.close().await;
    assert!(!state.connected);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(transport.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn live_events_and_history_are_folded() {
    let body = concat!(
        "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n",
        ": keep-alive\n\n",
        "data: {\"type\":\"message.updated\",\"properties\":{\"info\":{\"id\":\"m2\",\"sessionID\":\"ses_1\",\"role\":\"assistant\"}}}\n\n",
        "data: {\"type\":\"message.part.updated\",\"properties\":{\"part\":{\"id\":\"p2\",\"messageID\":\"m2\",\"type\":\"text\",\"text\":\"hi\"}}}\n\n",
        "data: {\"type\":\"message.updated\",\"properties\":{\"info\":{\"id\":\"m9\",\"sessionID\":\"other\"}}}\n\n",
        "data: not json\n\n",
    );
    let history: Vec<MessageWithParts> = serde_json::from_value(json!([{
        "info": {"id": "m1", "sessionID": SESSION, "role": "user"},
        "parts": [{"id": "p1", "messageID": "m1", "type": "text", "text": "hello"}]
    }]))
    .expect("history");
    let transport = Arc::new(FakeTransport {
        body: Some(body),
        history: Some(history),
        ..FakeTransport::default()
    });

    let stream = AgentStream::spawn(transport.clone(), Some(SESSION.to_string()), config());
    let state = wait_until(&stream, |state| {
        state.connected && state.messages.len() == 2 && state.parts.len() == 2
    })
    .await;

    assert!(state.message("m1").is_some());
    assert!(state.message("m9").is_none());
    assert_eq!(state.parts_for("m1")[0].text(), Some("hello"));
    assert_eq!(state.parts_for("m2")[0].text(), Some("hi"));
    assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

    let state = stream.close().await;
    assert!(!state.connected);
    assert_eq!(state.messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn history_failure_leaves_projection_empty() {
    let transport = Arc::new(FakeTransport {
        body: Some("data: {\"type\":\"server.connected\"}\n\n"),
        ..FakeTransport::default()
    });

    let stream = AgentStream::spawn(transport, Some(SESSION.to_string()), config());
    let state = wait_until(&stream, |state| state.connected).await;
    assert!(state.messages.is_empty());
    assert!(state.parts.is_empty());
    stream.close().await;
}

#[tokio::test(start_paused = true)]
async fn without_session_only_connection_state_changes() {
    let body = concat!(
        "data: {\"type\":\"server.connected\",\"properties\":{}}\n\n",
        "data: {\"type\":\"message.updated\",\"properties\":{\"info\":{\"id\":\"m1\",\"sessionID\":\"ses_1\"}}}\n\n",
    );
    let transport = Arc::new(FakeTransport {
        body: Some(body),
        ..FakeTransport::default()
    });

    let stream = AgentStream::spawn(transport, None, config());
    assert_eq!(stream.session_id(), None);
    let state = wait_until(&stream, |state| state.connected).await;
    // Both frames arrive in one chunk, so the message event is already folded.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(stream.snapshot().messages.is_empty());
    assert!(state.messages.is_empty());
    stream.close().await;
}
