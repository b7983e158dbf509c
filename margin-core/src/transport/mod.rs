//! Agent transports
//!
//! Two substrates, one contract. The engine only sees [`AgentTransport`]:
//! `start` an invocation, register `on_increment` / `on_terminal` handlers and
//! `cancel`. Increments are full accumulated snapshots, never diffs, so a
//! missed increment is repaired by the next one.
//!
//! - `IpcTransport` - push events from an [`AgentChannel`] (agent process)
//! - `HttpTransport` - fixed-interval polling of the served application

mod http;
mod ipc;
mod process;
mod selector;

pub use http::{HttpTransport, HttpTransportConfig};
pub use ipc::{AgentChannel, ChannelEvent, ChatCall, EditCall, IpcTransport};
pub use process::ProcessChannel;
pub use selector::{HostCapabilities, select_transport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::ids::{InvocationId, SessionId};
use crate::types::{DocumentPath, HistoryEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ipc,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ipc => f.write_str("ipc"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

/// What the agent is asked to do
#[derive(Clone, Debug, PartialEq)]
pub enum AgentRequest {
    Chat {
        message: String,
        session_id: Option<SessionId>,
        context: Option<String>,
        history: Vec<HistoryEntry>,
        model: Option<String>,
    },
    Edit {
        instruction: String,
        model: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub id: InvocationId,
    pub document: DocumentPath,
    pub request: AgentRequest,
}

/// Accumulated output so far for one invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Increment {
    pub document: DocumentPath,
    pub invocation: InvocationId,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalSignal {
    Complete { content: String },
    Error { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Terminal {
    pub document: DocumentPath,
    pub invocation: InvocationId,
    pub signal: TerminalSignal,
}

pub type IncrementHandler = Arc<dyn Fn(Increment) + Send + Sync>;
pub type TerminalHandler = Arc<dyn Fn(Terminal) + Send + Sync>;

/// Transport contract shared by the IPC and HTTP substrates.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begin reading the stream for `invocation`, then invoke the agent.
    /// Returns once the agent accepted the request.
    async fn start(&self, invocation: Invocation) -> Result<(), TransportError>;

    fn on_increment(&self, handler: IncrementHandler);

    fn on_terminal(&self, handler: TerminalHandler);

    /// Stop local tracking of `invocation` immediately and ask the agent to
    /// stop. No handler fires for it afterwards.
    async fn cancel(&self, document: &DocumentPath, invocation: InvocationId);
}

/// Registered handlers, shared with the transport's reader tasks
#[derive(Default)]
pub(crate) struct Listeners {
    increment: RwLock<Vec<IncrementHandler>>,
    terminal: RwLock<Vec<TerminalHandler>>,
}

impl Listeners {
    pub(crate) fn add_increment(&self, handler: IncrementHandler) {
        self.increment
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub(crate) fn add_terminal(&self, handler: TerminalHandler) {
        self.terminal
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handler);
    }

    pub(crate) fn emit_increment(&self, increment: Increment) {
        let handlers = self
            .increment
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for handler in handlers {
            handler(increment.clone());
        }
    }

    pub(crate) fn emit_terminal(&self, terminal: Terminal) {
        let handlers = self
            .terminal
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for handler in handlers {
            handler(terminal.clone());
        }
    }
}

/// Reader tasks currently running, one per live invocation
#[derive(Default)]
pub(crate) struct ActiveStreams {
    tokens: Mutex<HashMap<InvocationId, CancellationToken>>,
}

impl ActiveStreams {
    pub(crate) fn register(&self, invocation: InvocationId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(invocation, token.clone());
        token
    }

    /// Reader finished on its own (terminal signal seen)
    pub(crate) fn finish(&self, invocation: InvocationId) {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&invocation);
    }

    /// Stop the reader. Returns false when it had already finished.
    pub(crate) fn stop(&self, invocation: InvocationId) -> bool {
        let token = self
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&invocation);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
