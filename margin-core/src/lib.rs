//! Agent session engine for the margin editor
//!
//! This crate provides:
//! - **Engine**: `AgentEngine`, dispatching chat messages and edit batches to
//!   an external agent, streaming its output and reconciling the result
//! - **Transports**: `IpcTransport` (agent channel, e.g. `ProcessChannel`) and
//!   `HttpTransport` (polling), chosen once by `select_transport`
//! - **Storage**: `PersistenceGateway` trait with `HttpGateway` and
//!   `MemoryGateway`, wrapped in a `RetryPolicy`
//! - **State**: `SessionStore` / `DocumentView`, read by the UI
//!
//! # Example
//!
//! ```ignore
//! use margin_core::{AgentEngine, EngineOptions, HostCapabilities, HttpGateway};
//!
//! let transport = select_transport(HostCapabilities::default(), http_config)?;
//! let engine = AgentEngine::new(Arc::new(gateway), transport, EngineOptions::default());
//! engine.send_message(&doc, "Summarize section 2", None).await?;
//! ```
pub mod engine;
pub mod error;
pub mod ids;
pub mod pending;
pub mod storage;
pub mod store;
pub mod transport;
pub mod types;

pub use engine::{AgentEngine, EngineOptions};
pub use error::{EngineError, GatewayError, TransportError};
pub use ids::{ChangelogId, CommentId, Identity, InvocationId, LocalId, MessageId, RequestId, SessionId};
pub use pending::{InvocationKind, PendingInvocation, Phase};
pub use storage::{HttpGateway, MemoryGateway, PersistenceGateway, RetryPolicy};
pub use store::{DocumentView, SessionStore};
pub use transport::{
    AgentChannel, AgentTransport, HostCapabilities, HttpTransport, HttpTransportConfig,
    IpcTransport, ProcessChannel, TransportKind, select_transport,
};
pub use types::{
    ChangelogEntry, ChangelogStatus, Comment, CommentDraft, CommentStatus, DocumentPath, Message,
    Role, Session,
};
