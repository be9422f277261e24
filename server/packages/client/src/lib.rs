//! Client side of the relay: project and agent HTTP clients, the agent event
//! model, and the live session projection.

pub mod api;
pub mod client;
pub mod event;
pub mod model;
pub mod projection;
pub mod sse;
pub mod store;
pub mod stream;

pub use api::{
    AgentMode, FilePartInput, InitProjectRequest, ProjectEndpoints, ProxyStatusResponse,
    ResumeProjectRequest, SendMessage,
};
pub use client::{AgentClient, ClientError, RelayClient};
pub use event::{EventError, StreamEvent};
pub use model::{Message, MessageWithParts, Part, Session};
pub use projection::Projection;
pub use store::{new_project_id, now_millis, ProjectRecord, ProjectStore, StoreError};
pub use stream::{AgentStream, AgentTransport, ByteStream, StreamConfig, TransportFuture};
