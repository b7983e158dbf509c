//! Push-event transport over a host-provided agent channel

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{
    ActiveStreams, AgentRequest, AgentTransport, Increment, IncrementHandler, Invocation,
    Listeners, Terminal, TerminalHandler, TerminalSignal, TransportKind,
};
use crate::error::TransportError;
use crate::ids::{InvocationId, SessionId};
use crate::types::{DocumentPath, HistoryEntry};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatCall {
    pub invocation: InvocationId,
    pub message: String,
    pub doc_path: DocumentPath,
    pub session_id: Option<SessionId>,
    pub context_selection: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EditCall {
    pub invocation: InvocationId,
    pub instruction: String,
    pub file_path: DocumentPath,
    pub model: Option<String>,
}

/// Event pushed by the agent, tagged with the invocation it belongs to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelEvent {
    Stream {
        invocation: InvocationId,
        content: String,
    },
    Complete {
        invocation: InvocationId,
        content: String,
    },
    Error {
        invocation: InvocationId,
        message: String,
    },
}

impl ChannelEvent {
    pub fn invocation(&self) -> InvocationId {
        match self {
            ChannelEvent::Stream { invocation, .. }
            | ChannelEvent::Complete { invocation, .. }
            | ChannelEvent::Error { invocation, .. } => *invocation,
        }
    }
}

/// Direct channel to the agent, available only in hosts that can run it.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn send_chat(&self, call: ChatCall) -> Result<(), TransportError>;

    async fn send_edit(&self, call: EditCall) -> Result<(), TransportError>;

    async fn cancel(&self, invocation: InvocationId) -> Result<(), TransportError>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;
}

pub struct IpcTransport {
    channel: Arc<dyn AgentChannel>,
    listeners: Arc<Listeners>,
    active: Arc<ActiveStreams>,
}

impl IpcTransport {
    pub fn new(channel: Arc<dyn AgentChannel>) -> Self {
        Self {
            channel,
            listeners: Arc::new(Listeners::default()),
            active: Arc::new(ActiveStreams::default()),
        }
    }

    fn spawn_reader(&self, document: DocumentPath, id: InvocationId) {
        // Subscribe before the request goes out so no early event is lost
        let mut events = self.channel.subscribe();
        let token = self.active.register(id);
        let listeners = Arc::clone(&self.listeners);
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(invocation = %id, "IPC reader unsubscribed");
                        return;
                    }
                    event = events.recv() => event,
                };

                let signal = match event {
                    Ok(event) if event.invocation() != id => continue,
                    Ok(ChannelEvent::Stream { content, .. }) => {
                        listeners.emit_increment(Increment {
                            document: document.clone(),
                            invocation: id,
                            content,
                        });
                        continue;
                    }
                    Ok(ChannelEvent::Complete { content, .. }) => {
                        TerminalSignal::Complete { content }
                    }
                    Ok(ChannelEvent::Error { message, .. }) => TerminalSignal::Error { message },
                    Err(RecvError::Lagged(skipped)) => {
                        // Increments are snapshots; the next one catches up
                        warn!(invocation = %id, skipped, "IPC reader lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => TerminalSignal::Error {
                        message: "agent channel closed".to_string(),
                    },
                };

                active.finish(id);
                listeners.emit_terminal(Terminal {
                    document,
                    invocation: id,
                    signal,
                });
                return;
            }
        });
    }
}

#[async_trait]
impl AgentTransport for IpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ipc
    }

    async fn start(&self, invocation: Invocation) -> Result<(), TransportError> {
        let Invocation {
            id,
            document,
            request,
        } = invocation;

        self.spawn_reader(document.clone(), id);

        let sent = match request {
            AgentRequest::Chat {
                message,
                session_id,
                context,
                history,
                model,
            } => {
                self.channel
                    .send_chat(ChatCall {
                        invocation: id,
                        message,
                        doc_path: document,
                        session_id,
                        context_selection: context,
                        history,
                        model,
                    })
                    .await
            }
            AgentRequest::Edit { instruction, model } => {
                self.channel
                    .send_edit(EditCall {
                        invocation: id,
                        instruction,
                        file_path: document,
                        model,
                    })
                    .await
            }
        };

        if let Err(e) = sent {
            self.active.stop(id);
            return Err(e);
        }
        debug!(invocation = %id, "IPC invocation started");
        Ok(())
    }

    fn on_increment(&self, handler: IncrementHandler) {
        self.listeners.add_increment(handler);
    }

    fn on_terminal(&self, handler: TerminalHandler) {
        self.listeners.add_terminal(handler);
    }

    async fn cancel(&self, document: &DocumentPath, invocation: InvocationId) {
        if !self.active.stop(invocation) {
            debug!(%document, %invocation, "IPC cancel for finished invocation");
            return;
        }
        if let Err(e) = self.channel.cancel(invocation).await {
            warn!(%document, %invocation, "Agent cancel failed: {}", e);
        }
    }
}
