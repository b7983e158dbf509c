//! Chat and edit-batch dispatch
//!
//! Both paths claim the document's slot before their first await, record the
//! request durably, and only then start the transport. A dispatch returns as
//! soon as streaming has started.

use std::fmt::Write;
use tracing::{info, warn};

use super::AgentEngine;
use crate::error::{EngineError, Result};
use crate::ids::{ChangelogId, CommentId, Identity, InvocationId, LocalId, RequestId};
use crate::pending::{InvocationContext, InvocationKind};
use crate::transport::{AgentRequest, Invocation, Terminal, TerminalSignal};
use crate::types::{
    ChangelogDraft, ChangelogPatch, ChangelogStatus, CommentPatch, CommentStatus, DocumentPath,
    HistoryEntry, Message, Role, StoredComment,
};

pub(crate) const CANCELLED_SUMMARY: &str = "Cancelled by user";

impl AgentEngine {
    /// Send a chat message for `document`, optionally with a context snippet.
    pub async fn send_message(
        &self,
        document: &DocumentPath,
        text: &str,
        context: Option<String>,
    ) -> Result<InvocationId> {
        let message = text.trim();
        if message.is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let inner = &self.inner;

        let id = inner.store.slots().try_begin(
            document,
            InvocationKind::Chat,
            inner.transport.kind(),
            InvocationContext::Chat { session_id: None },
        )?;

        // Read only once the slot is ours, so the previous reply is included
        let (session_id, history) = inner.store.read(document, |view| {
            let history: Vec<HistoryEntry> = view
                .messages
                .iter()
                .filter(|m| m.id.is_persisted() && !m.is_error)
                .map(|m| HistoryEntry {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect();
            (view.active_session_id.clone(), history)
        });

        let local = LocalId::new();
        let optimistic = Message::optimistic(local.clone(), Role::User, message, context.clone());
        let draft = optimistic.draft();
        inner.store.update(document, |view| {
            view.push_message(optimistic);
            view.begin_stream();
        });

        let receipt = inner
            .retry
            .run("create_message", || {
                inner
                    .gateway
                    .create_message(document, session_id.as_ref(), &draft)
            })
            .await;
        let receipt = match receipt {
            Ok(receipt) => receipt,
            Err(e) => {
                inner.store.slots().release(document, id);
                inner.store.update(document, |view| {
                    view.remove_message(&local);
                    view.end_stream();
                    view.last_error = Some(e.to_string());
                });
                return Err(e.into());
            }
        };

        let session_id = receipt.session.id.clone();
        inner.store.slots().update_context(
            document,
            id,
            InvocationContext::Chat {
                session_id: Some(session_id.clone()),
            },
        );
        inner.store.update(document, |view| {
            view.confirm_message(&local, receipt.message);
            view.upsert_session(receipt.session);
            view.active_session_id = Some(session_id.clone());
        });

        if !inner.store.slots().set_streaming(document, id) {
            inner.store.settle(document, id, |view| view.end_stream());
            info!(%document, invocation = %id, "Chat cancelled before the agent was invoked");
            return Err(EngineError::Cancelled);
        }

        let invocation = Invocation {
            id,
            document: document.clone(),
            request: AgentRequest::Chat {
                message: message.to_string(),
                session_id: Some(session_id),
                context,
                history,
                model: inner.model.clone(),
            },
        };
        self.start(invocation).await?;
        info!(%document, invocation = %id, "Chat dispatched");
        Ok(id)
    }

    /// Send a batch of persisted, not yet applied comments as one edit.
    pub async fn send_edit_batch(
        &self,
        document: &DocumentPath,
        comments: &[Identity<CommentId>],
    ) -> Result<InvocationId> {
        if comments.is_empty() {
            return Err(EngineError::EmptyBatch);
        }
        let inner = &self.inner;

        let batch = inner
            .store
            .read(document, |view| -> Result<Vec<StoredComment>> {
                comments
                    .iter()
                    .map(|wanted| {
                        let comment = view
                            .comments
                            .iter()
                            .find(|c| &c.id == wanted)
                            .ok_or_else(|| EngineError::UnknownComment(wanted.to_string()))?;
                        let id = comment
                            .id
                            .persisted()
                            .ok_or_else(|| EngineError::UnpersistedComment(wanted.to_string()))?;
                        if !comment.status.can_advance_to(CommentStatus::Sent) {
                            return Err(EngineError::InvalidTransition {
                                from: comment.status,
                                to: CommentStatus::Sent,
                            });
                        }
                        Ok(StoredComment {
                            id: id.clone(),
                            document: comment.document.clone(),
                            selected_text: comment.selected_text.clone(),
                            instruction: comment.instruction.clone(),
                            line_hint: comment.line_hint,
                            status: comment.status,
                            request_id: comment.request_id.clone(),
                        })
                    })
                    .collect()
            })?;

        let request_id = RequestId::new();
        let comment_ids: Vec<CommentId> = batch.iter().map(|c| c.id.clone()).collect();
        let edit_context = |changelog_id: Option<ChangelogId>, snapshot: Vec<StoredComment>| {
            InvocationContext::Edit {
                request_id: request_id.clone(),
                comment_ids: comment_ids.clone(),
                changelog_id,
                snapshot,
            }
        };

        let id = inner.store.slots().try_begin(
            document,
            InvocationKind::Edit,
            inner.transport.kind(),
            edit_context(None, batch),
        )?;
        inner.store.update(document, |view| view.begin_stream());

        // Durability point: the whole batch is "sent" under one request id
        let patch = CommentPatch {
            status: CommentStatus::Sent,
            request_id: Some(request_id.clone()),
        };
        let sent = inner
            .retry
            .run("patch_comments", || {
                inner.gateway.patch_comments(&comment_ids, &patch)
            })
            .await;
        let sent = match sent {
            Ok(sent) => sent,
            Err(e) => {
                self.abort_dispatch(document, id, &e.to_string());
                return Err(e.into());
            }
        };
        inner.store.update(document, |view| view.merge_comments(&sent));

        // Cancelled while marking sent: the comments stay sent, no changelog
        if inner.store.slots().is_cancelled(document, id) {
            inner.store.settle(document, id, |view| view.end_stream());
            info!(%document, invocation = %id, "Edit batch cancelled before the agent was invoked");
            return Err(EngineError::Cancelled);
        }

        let draft = ChangelogDraft {
            request_id: Some(request_id.clone()),
            status: ChangelogStatus::Running,
            summary: String::new(),
            stream_log: String::new(),
            comments_snapshot: sent.clone(),
        };
        let entry = inner
            .retry
            .run("create_changelog", || {
                inner.gateway.create_changelog(document, &draft)
            })
            .await;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                self.abort_dispatch(document, id, &e.to_string());
                return Err(e.into());
            }
        };
        let changelog_id = entry.id.clone();
        inner.store.slots().update_context(
            document,
            id,
            edit_context(Some(changelog_id.clone()), sent.clone()),
        );
        inner.store.update(document, |view| view.upsert_changelog(entry));

        if !inner.store.slots().set_streaming(document, id) {
            self.close_cancelled_changelog(document, &changelog_id).await;
            inner.store.settle(document, id, |view| view.end_stream());
            info!(%document, invocation = %id, "Edit batch cancelled before the agent was invoked");
            return Err(EngineError::Cancelled);
        }

        let invocation = Invocation {
            id,
            document: document.clone(),
            request: AgentRequest::Edit {
                instruction: edit_instruction(&sent),
                model: inner.model.clone(),
            },
        };
        self.start(invocation).await?;
        info!(%document, invocation = %id, comments = sent.len(), %request_id, "Edit batch dispatched");
        Ok(id)
    }

    /// Hand the invocation to the transport. A refused start is reconciled
    /// like an agent error.
    async fn start(&self, invocation: Invocation) -> Result<()> {
        let inner = &self.inner;
        let document = invocation.document.clone();
        let id = invocation.id;

        if let Err(e) = inner.transport.start(invocation).await {
            warn!(%document, invocation = %id, "Agent invocation failed to start: {}", e);
            inner
                .reconcile(Terminal {
                    document,
                    invocation: id,
                    signal: TerminalSignal::Error {
                        message: e.to_string(),
                    },
                })
                .await;
            return Err(e.into());
        }

        // Cancelled while the transport was starting: make sure it stops
        if !inner.store.slots().is_current(&document, id) {
            inner.transport.cancel(&document, id).await;
        }
        Ok(())
    }

    /// Setup failed before the agent was invoked.
    fn abort_dispatch(&self, document: &DocumentPath, id: InvocationId, error: &str) {
        let inner = &self.inner;
        let was_cancelled = inner.store.slots().is_cancelled(document, id);
        inner.store.slots().release(document, id);
        inner.store.update(document, |view| {
            view.end_stream();
            if !was_cancelled {
                view.last_error = Some(error.to_string());
            }
        });
    }

    pub(crate) async fn close_cancelled_changelog(
        &self,
        document: &DocumentPath,
        changelog_id: &ChangelogId,
    ) {
        let inner = &self.inner;
        let patch = ChangelogPatch {
            status: ChangelogStatus::Error,
            summary: CANCELLED_SUMMARY.to_string(),
            stream_log: String::new(),
        };
        match inner
            .retry
            .run("patch_changelog", || {
                inner.gateway.patch_changelog(changelog_id, &patch)
            })
            .await
        {
            Ok(entry) => inner.store.update(document, |view| view.upsert_changelog(entry)),
            Err(e) => warn!(%document, changelog = %changelog_id, "Failed to close cancelled changelog entry: {}", e),
        }
    }
}

/// One instruction covering every comment of the batch, numbered in order.
pub(crate) fn edit_instruction(comments: &[StoredComment]) -> String {
    let mut instruction = String::from("Apply the following edits to the document:\n");
    for (index, comment) in comments.iter().enumerate() {
        let _ = write!(instruction, "\n{}. On \"{}\"", index + 1, comment.selected_text);
        if let Some(line) = comment.line_hint {
            let _ = write!(instruction, " (line ~{})", line);
        }
        let _ = write!(instruction, ": {}", comment.instruction);
    }
    instruction
}
