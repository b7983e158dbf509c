//! In-memory PersistenceGateway implementation
//!
//! Enforces the same rules a real store does: comment status never regresses
//! and a finished changelog entry is never reopened.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::PersistenceGateway;
use crate::error::GatewayError;
use crate::ids::{ChangelogId, CommentId, MessageId, SessionId};
use crate::types::{
    ChangelogDraft, ChangelogEntry, ChangelogPatch, CommentDraft, CommentPatch, DocumentPath,
    MessageDraft, MessageReceipt, Session, StoredComment, StoredMessage,
};

#[derive(Debug, Default)]
struct MemoryState {
    sessions: HashMap<SessionId, Session>,
    /// Messages in insertion order per session
    messages: HashMap<SessionId, Vec<StoredMessage>>,
    comments: Vec<StoredComment>,
    changelog: Vec<ChangelogEntry>,
}

/// In-memory gateway for tests and hosts without a served store
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of persisted messages across all sessions (for tests)
    pub fn message_count(&self) -> usize {
        self.lock().messages.values().map(Vec::len).sum()
    }

    /// All persisted messages of a document in creation order
    pub fn messages_for(&self, document: &DocumentPath) -> Vec<StoredMessage> {
        let state = self.lock();
        let mut sessions: Vec<&Session> = state
            .sessions
            .values()
            .filter(|s| &s.document == document)
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
            .into_iter()
            .flat_map(|s| state.messages.get(&s.id).cloned().unwrap_or_default())
            .collect()
    }

    pub fn comment(&self, id: &CommentId) -> Option<StoredComment> {
        self.lock().comments.iter().find(|c| &c.id == id).cloned()
    }
}

fn new_session(document: &DocumentPath) -> Session {
    let now = Utc::now();
    Session {
        id: SessionId::new(),
        document: document.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn list_sessions(&self, document: &DocumentPath) -> Result<Vec<Session>, GatewayError> {
        let state = self.lock();
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| &s.document == document)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn create_session(&self, document: &DocumentPath) -> Result<Session, GatewayError> {
        let session = new_session(document);
        let mut state = self.lock();
        state.sessions.insert(session.id.clone(), session.clone());
        state.messages.insert(session.id.clone(), Vec::new());
        Ok(session)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), GatewayError> {
        let mut state = self.lock();
        state.sessions.remove(session_id);
        state.messages.remove(session_id);
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, GatewayError> {
        Ok(self.lock().messages.get(session_id).cloned().unwrap_or_default())
    }

    async fn create_message(
        &self,
        document: &DocumentPath,
        session_id: Option<&SessionId>,
        draft: &MessageDraft,
    ) -> Result<MessageReceipt, GatewayError> {
        let mut state = self.lock();

        let session_id = match session_id {
            Some(id) => {
                let session = state
                    .sessions
                    .get(id)
                    .ok_or_else(|| GatewayError::Rejected(format!("unknown session {}", id)))?;
                if &session.document != document {
                    return Err(GatewayError::Rejected(format!(
                        "session {} does not belong to {}",
                        id, document
                    )));
                }
                id.clone()
            }
            None => {
                let session = new_session(document);
                let id = session.id.clone();
                state.sessions.insert(id.clone(), session);
                id
            }
        };

        let now = Utc::now();
        let message = StoredMessage {
            id: MessageId::new(),
            session_id: session_id.clone(),
            role: draft.role,
            content: draft.content.clone(),
            context: draft.context.clone(),
            is_error: draft.is_error,
            created_at: now,
        };
        state
            .messages
            .entry(session_id.clone())
            .or_default()
            .push(message.clone());

        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown session {}", session_id)))?;
        session.updated_at = now;

        Ok(MessageReceipt {
            session: session.clone(),
            message,
        })
    }

    async fn list_comments(
        &self,
        document: &DocumentPath,
    ) -> Result<Vec<StoredComment>, GatewayError> {
        Ok(self
            .lock()
            .comments
            .iter()
            .filter(|c| &c.document == document)
            .cloned()
            .collect())
    }

    async fn create_comment(
        &self,
        document: &DocumentPath,
        draft: &CommentDraft,
    ) -> Result<StoredComment, GatewayError> {
        let comment = StoredComment {
            id: CommentId::new(),
            document: document.clone(),
            selected_text: draft.selected_text.clone(),
            instruction: draft.instruction.clone(),
            line_hint: draft.line_hint,
            status: crate::types::CommentStatus::Pending,
            request_id: None,
        };
        self.lock().comments.push(comment.clone());
        Ok(comment)
    }

    async fn patch_comments(
        &self,
        ids: &[CommentId],
        patch: &CommentPatch,
    ) -> Result<Vec<StoredComment>, GatewayError> {
        let mut state = self.lock();

        // Validate the whole batch before touching anything
        for id in ids {
            let comment = state
                .comments
                .iter()
                .find(|c| &c.id == id)
                .ok_or_else(|| GatewayError::Rejected(format!("unknown comment {}", id)))?;
            if !comment.status.can_advance_to(patch.status) {
                return Err(GatewayError::Rejected(format!(
                    "comment {} cannot move from {} to {}",
                    id, comment.status, patch.status
                )));
            }
        }

        let mut patched = Vec::with_capacity(ids.len());
        for comment in state.comments.iter_mut().filter(|c| ids.contains(&c.id)) {
            comment.status = patch.status;
            if patch.request_id.is_some() {
                comment.request_id = patch.request_id.clone();
            }
            patched.push(comment.clone());
        }
        Ok(patched)
    }

    async fn delete_comment(&self, id: &CommentId) -> Result<(), GatewayError> {
        self.lock().comments.retain(|c| &c.id != id);
        Ok(())
    }

    async fn list_changelog(
        &self,
        document: &DocumentPath,
    ) -> Result<Vec<ChangelogEntry>, GatewayError> {
        let mut entries: Vec<ChangelogEntry> = self
            .lock()
            .changelog
            .iter()
            .filter(|e| &e.document == document)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn create_changelog(
        &self,
        document: &DocumentPath,
        draft: &ChangelogDraft,
    ) -> Result<ChangelogEntry, GatewayError> {
        let entry = ChangelogEntry {
            id: ChangelogId::new(),
            document: document.clone(),
            request_id: draft.request_id.clone(),
            status: draft.status,
            summary: draft.summary.clone(),
            stream_log: draft.stream_log.clone(),
            comments_snapshot: draft.comments_snapshot.clone(),
            created_at: Utc::now(),
        };
        self.lock().changelog.push(entry.clone());
        Ok(entry)
    }

    async fn patch_changelog(
        &self,
        id: &ChangelogId,
        patch: &ChangelogPatch,
    ) -> Result<ChangelogEntry, GatewayError> {
        let mut state = self.lock();
        let entry = state
            .changelog
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| GatewayError::Rejected(format!("unknown changelog entry {}", id)))?;
        if entry.status.is_terminal() {
            return Err(GatewayError::Rejected(format!(
                "changelog entry {} is already finished",
                id
            )));
        }
        entry.status = patch.status;
        entry.summary = patch.summary.clone();
        entry.stream_log = patch.stream_log.clone();
        Ok(entry.clone())
    }
}
