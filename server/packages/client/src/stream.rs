//! Live subscription to one agent session.
//!
//! A connection task reads the agent's event stream and a backfill task loads
//! the session history; both feed a single fold task over a channel, which
//! owns the [`Projection`] and publishes it through a `watch` channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::{AgentClient, ClientError};
use crate::event::StreamEvent;
use crate::model::MessageWithParts;
use crate::projection::Projection;
use crate::sse::SseDecoder;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ClientError>> + Send>>;
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// What a subscription needs from the agent.
pub trait AgentTransport: Send + Sync + 'static {
    fn history<'a>(&'a self, session_id: &'a str) -> TransportFuture<'a, Vec<MessageWithParts>>;

    /// Raw `text/event-stream` body.
    fn events(&self) -> TransportFuture<'_, ByteStream>;
}

impl AgentTransport for AgentClient {
    fn history<'a>(&'a self, session_id: &'a str) -> TransportFuture<'a, Vec<MessageWithParts>> {
        Box::pin(self.messages(session_id))
    }

    fn events(&self) -> TransportFuture<'_, ByteStream> {
        Box::pin(async move {
            let response = self.open_events().await?;
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ClientError::from));
            Ok(Box::pin(body) as ByteStream)
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub reconnect_delay: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Handle to a running subscription. Dropping it cancels the tasks; use
/// [`AgentStream::close`] to also wait for them and get the final state.
pub struct AgentStream {
    session_id: Option<String>,
    cancel: CancellationToken,
    state: watch::Receiver<Projection>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentStream {
    /// Start following `session_id`. Must be called inside a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn AgentTransport>,
        session_id: Option<String>,
        config: StreamConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Projection::default());

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(run_connection(
            transport.clone(),
            event_tx.clone(),
            cancel.clone(),
            config.reconnect_delay,
        )));
        if let Some(session_id) = session_id.clone() {
            tasks.push(tokio::spawn(backfill(
                transport,
                session_id,
                event_tx,
                cancel.clone(),
            )));
        }
        // Runs until every sender is gone, so it is joined last.
        tasks.push(tokio::spawn(run_fold(event_rx, state_tx, session_id.clone())));

        Self {
            session_id,
            cancel,
            state: state_rx,
            tasks,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn snapshot(&self) -> Projection {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Projection> {
        self.state.clone()
    }

    /// Stop the subscription and return the final projection.
    pub async fn close(mut self) -> Projection {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "agent stream task failed");
            }
        }
        self.snapshot()
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_fold(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    state: watch::Sender<Projection>,
    session_id: Option<String>,
) {
    while let Some(event) = events.recv().await {
        tracing::trace!(kind = event.kind(), "folding agent event");
        state.send_modify(|projection| {
            let current = std::mem::take(projection);
            *projection = current.apply(event, session_id.as_deref());
        });
    }
}

async fn run_connection(
    transport: Arc<dyn AgentTransport>,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = pump_events(transport.as_ref(), &events) => outcome,
        };
        match outcome {
            Ok(()) => tracing::debug!("agent event stream ended"),
            Err(err) => tracing::warn!(error = %err, "agent event stream failed"),
        }
        if events.send(StreamEvent::ConnectionClosed).is_err() {
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
        tracing::debug!("reconnecting to agent event stream");
    }
    let _ = events.send(StreamEvent::ConnectionClosed);
}

async fn pump_events(
    transport: &dyn AgentTransport,
    events: &mpsc::UnboundedSender<StreamEvent>,
) -> Result<(), ClientError> {
    let mut body = transport.events().await?;
    let mut decoder = SseDecoder::default();
    while let Some(chunk) = body.next().await {
        decoder.push(&chunk?);
        while let Some(data) = decoder.next_frame() {
            match StreamEvent::parse(&data) {
                Ok(event) => {
                    if events.send(event).is_err() {
                        return Ok(());
                    }
                }
                Err(err) => tracing::debug!(error = %err, "dropping malformed agent event"),
            }
        }
    }
    Ok(())
}

async fn backfill(
    transport: Arc<dyn AgentTransport>,
    session_id: String,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
) {
    let history = tokio::select! {
        _ = cancel.cancelled() => return,
        history = transport.history(&session_id) => history,
    };
    let history = match history {
        Ok(history) => history,
        Err(err) => {
            tracing::debug!(session_id = %session_id, error = %err, "session history unavailable");
            return;
        }
    };
    tracing::debug!(session_id = %session_id, messages = history.len(), "loaded session history");
    for entry in history {
        if events
            .send(StreamEvent::MessageUpdated { info: entry.info })
            .is_err()
        {
            return;
        }
        for part in entry.parts {
            if events.send(StreamEvent::PartUpdated { part }).is_err() {
                return;
            }
        }
    }
}
