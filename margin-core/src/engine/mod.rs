//! AgentEngine - the UI-facing surface of the session engine
//!
//! Coordinates:
//! - Dispatch of chat messages and edit batches (`dispatch`)
//! - Reconciliation of exactly one terminal signal per invocation (`reconcile`)
//! - Cancellation (`cancel`)
//! - Document, session and comment management (this module)
//!
//! Transport handlers only forward events into a channel; a background task
//! owns applying them to the session store.

mod cancel;
mod dispatch;
mod reconcile;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::ids::{CommentId, Identity, LocalId, SessionId};
use crate::pending::InvocationContext;
use crate::storage::{PersistenceGateway, RetryPolicy};
use crate::store::{DocumentView, SessionStore};
use crate::transport::{AgentTransport, Increment, Terminal, TransportKind};
use crate::types::{Comment, CommentDraft, DocumentPath, Message};

/// Tunables for an engine instance
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub retry: RetryPolicy,
    /// Model hint forwarded to the agent
    pub model: Option<String>,
}

enum TransportEvent {
    Increment(Increment),
    Terminal(Terminal),
}

pub(crate) struct EngineInner {
    gateway: Arc<dyn PersistenceGateway>,
    transport: Arc<dyn AgentTransport>,
    store: SessionStore,
    retry: RetryPolicy,
    model: Option<String>,
}

// ============================================================================
// AgentEngine
// ============================================================================

/// Cheap to clone; all clones share one store and one transport.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct AgentEngine {
    inner: Arc<EngineInner>,
}

impl AgentEngine {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        transport: Arc<dyn AgentTransport>,
        options: EngineOptions,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let increment_tx = event_tx.clone();
        transport.on_increment(Arc::new(move |increment| {
            let _ = increment_tx.send(TransportEvent::Increment(increment));
        }));
        transport.on_terminal(Arc::new(move |terminal| {
            let _ = event_tx.send(TransportEvent::Terminal(terminal));
        }));

        let inner = Arc::new(EngineInner {
            gateway,
            transport,
            store: SessionStore::new(),
            retry: options.retry,
            model: options.model,
        });

        tokio::spawn(Self::background_loop(Arc::downgrade(&inner), event_rx));

        Self { inner }
    }

    /// Runs until the engine is dropped. Holds only a weak reference so the
    /// transport (which owns the senders) can be released.
    async fn background_loop(
        inner: Weak<EngineInner>,
        mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match event {
                TransportEvent::Increment(increment) => inner.apply_increment(increment),
                TransportEvent::Terminal(terminal) => inner.reconcile(terminal).await,
            }
        }
        debug!("Engine event loop stopped");
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Current UI state of `document`
    pub fn snapshot(&self, document: &DocumentPath) -> DocumentView {
        self.inner.store.snapshot(document)
    }

    /// Bumped after every store change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.store.subscribe()
    }

    pub fn is_pending(&self, document: &DocumentPath) -> bool {
        self.inner.store.is_pending(document)
    }

    fn ensure_idle(&self, document: &DocumentPath) -> Result<()> {
        if self.inner.store.is_pending(document) {
            return Err(EngineError::AlreadyPending(document.clone()));
        }
        Ok(())
    }

    // ========================================================================
    // Documents and sessions
    // ========================================================================

    /// Load sessions, the latest session's messages, comments and changelog.
    pub async fn open_document(&self, document: &DocumentPath) -> Result<()> {
        self.ensure_idle(document)?;
        let inner = &self.inner;

        let sessions = inner
            .retry
            .run("list_sessions", || inner.gateway.list_sessions(document))
            .await?;
        let active = sessions.first().map(|s| s.id.clone());
        let messages = match &active {
            Some(session_id) => {
                inner
                    .retry
                    .run("list_messages", || inner.gateway.list_messages(session_id))
                    .await?
            }
            None => Vec::new(),
        };
        let comments = inner
            .retry
            .run("list_comments", || inner.gateway.list_comments(document))
            .await?;
        let changelog = inner
            .retry
            .run("list_changelog", || inner.gateway.list_changelog(document))
            .await?;

        // A dispatch may have started while loading
        self.ensure_idle(document)?;

        info!(
            %document,
            sessions = sessions.len(),
            messages = messages.len(),
            comments = comments.len(),
            "Document opened"
        );
        inner.store.update(document, |view| {
            view.sessions = sessions;
            view.active_session_id = active;
            view.messages = messages.into_iter().map(Message::from).collect();
            view.comments = comments.into_iter().map(Comment::from).collect();
            view.changelog = changelog;
            view.last_error = None;
        });
        Ok(())
    }

    /// Start a fresh conversation; the session is created by the next message.
    pub fn new_session(&self, document: &DocumentPath) -> Result<()> {
        self.ensure_idle(document)?;
        self.inner.store.update(document, |view| {
            view.active_session_id = None;
            view.messages.clear();
        });
        Ok(())
    }

    pub async fn select_session(&self, document: &DocumentPath, session_id: &SessionId) -> Result<()> {
        self.ensure_idle(document)?;
        let known = self
            .inner
            .store
            .read(document, |view| view.sessions.iter().any(|s| &s.id == session_id));
        if !known {
            return Err(EngineError::UnknownSession(session_id.to_string()));
        }

        let inner = &self.inner;
        let messages = inner
            .retry
            .run("list_messages", || inner.gateway.list_messages(session_id))
            .await?;
        self.ensure_idle(document)?;

        inner.store.update(document, |view| {
            view.active_session_id = Some(session_id.clone());
            view.messages = messages.into_iter().map(Message::from).collect();
        });
        Ok(())
    }

    pub async fn delete_session(&self, document: &DocumentPath, session_id: &SessionId) -> Result<()> {
        self.ensure_idle(document)?;
        let inner = &self.inner;
        inner
            .retry
            .run("delete_session", || inner.gateway.delete_session(session_id))
            .await?;

        inner.store.update(document, |view| {
            view.sessions.retain(|s| &s.id != session_id);
            if view.active_session_id.as_ref() == Some(session_id) {
                view.active_session_id = None;
                view.messages.clear();
            }
        });
        info!(%document, session = %session_id, "Session deleted");
        Ok(())
    }

    // ========================================================================
    // Comments
    // ========================================================================

    /// Add an inline edit comment. Shown immediately, confirmed by the gateway.
    pub async fn add_comment(&self, document: &DocumentPath, draft: CommentDraft) -> Result<CommentId> {
        if draft.instruction.trim().is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let inner = &self.inner;
        let local = LocalId::new();
        inner.store.update(document, |view| {
            view.comments
                .push(Comment::optimistic(local.clone(), document.clone(), &draft));
        });

        let created = inner
            .retry
            .run("create_comment", || inner.gateway.create_comment(document, &draft))
            .await;
        match created {
            Ok(stored) => {
                let id = stored.id.clone();
                inner
                    .store
                    .update(document, |view| view.confirm_comment(&local, stored));
                Ok(id)
            }
            Err(e) => {
                inner.store.update(document, |view| {
                    view.remove_comment(&Identity::Local(local));
                });
                Err(e.into())
            }
        }
    }

    /// Delete a comment outright, whatever its status. Refused while the
    /// comment belongs to the running edit batch.
    pub async fn remove_comment(&self, document: &DocumentPath, comment_id: &CommentId) -> Result<()> {
        let in_flight = self
            .inner
            .store
            .slots()
            .current(document)
            .is_some_and(|pending| match pending.context {
                InvocationContext::Edit { comment_ids, .. } => comment_ids.contains(comment_id),
                InvocationContext::Chat { .. } => false,
            });
        if in_flight {
            return Err(EngineError::AlreadyPending(document.clone()));
        }

        let inner = &self.inner;
        inner
            .retry
            .run("delete_comment", || inner.gateway.delete_comment(comment_id))
            .await?;
        inner.store.update(document, |view| {
            view.remove_comment(&Identity::Persisted(comment_id.clone()));
        });
        Ok(())
    }
}

impl EngineInner {
    fn apply_increment(&self, increment: Increment) {
        let Increment {
            document,
            invocation,
            content,
        } = increment;
        if !self.store.slots().accepts_output(&document, invocation) {
            debug!(%document, %invocation, "Dropping increment for stale invocation");
            return;
        }
        self.store.update(&document, |view| {
            if view.set_stream_output(&content) {
                debug!(%document, %invocation, len = content.len(), "Stream increment");
            }
        });
    }
}
