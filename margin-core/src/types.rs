//! Domain records shared by the engine, the session store and the gateway.
//!
//! `Stored*` types are what the persistence gateway returns; the store keeps
//! [`Message`] and [`Comment`], which may still carry a local identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;
use crate::ids::{ChangelogId, CommentId, Identity, LocalId, MessageId, RequestId, SessionId};

/// Path of the document that scopes sessions, comments and changelog entries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentPath(String);

impl DocumentPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub document: DocumentPath,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message as returned by the persistence gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

/// A message as held by the session store.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: Identity<MessageId>,
    pub session_id: Option<SessionId>,
    pub role: Role,
    pub content: String,
    pub context: Option<String>,
    /// Content is an agent error rather than a reply
    pub is_error: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Optimistic message shown before the gateway confirms it.
    pub fn optimistic(
        local: LocalId,
        role: Role,
        content: impl Into<String>,
        context: Option<String>,
    ) -> Self {
        Self {
            id: Identity::Local(local),
            session_id: None,
            role,
            content: content.into(),
            context,
            is_error: false,
            created_at: Utc::now(),
        }
    }

    pub fn draft(&self) -> MessageDraft {
        MessageDraft {
            role: self.role,
            content: self.content.clone(),
            context: self.context.clone(),
            is_error: self.is_error,
        }
    }
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        Self {
            id: Identity::Persisted(stored.id),
            session_id: Some(stored.session_id),
            role: stored.role,
            content: stored.content,
            context: stored.context,
            is_error: stored.is_error,
            created_at: stored.created_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub context: Option<String>,
    pub is_error: bool,
}

/// Result of persisting a message; the session may have been created lazily.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub session: Session,
    pub message: StoredMessage,
}

/// Lifecycle of an inline edit comment. Ordered: pending < sent < applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    Pending,
    Sent,
    Applied,
}

impl CommentStatus {
    /// Status only moves forward; staying put is allowed.
    pub fn can_advance_to(self, next: CommentStatus) -> bool {
        next >= self
    }

    pub fn advance(&mut self, next: CommentStatus) -> Result<(), EngineError> {
        if !self.can_advance_to(next) {
            return Err(EngineError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for CommentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommentStatus::Pending => "pending",
            CommentStatus::Sent => "sent",
            CommentStatus::Applied => "applied",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredComment {
    pub id: CommentId,
    pub document: DocumentPath,
    pub selected_text: String,
    pub instruction: String,
    #[serde(default)]
    pub line_hint: Option<u32>,
    pub status: CommentStatus,
    #[serde(default)]
    pub request_id: Option<RequestId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Comment {
    pub id: Identity<CommentId>,
    pub document: DocumentPath,
    pub selected_text: String,
    pub instruction: String,
    pub line_hint: Option<u32>,
    pub status: CommentStatus,
    pub request_id: Option<RequestId>,
}

impl Comment {
    pub fn optimistic(local: LocalId, document: DocumentPath, draft: &CommentDraft) -> Self {
        Self {
            id: Identity::Local(local),
            document,
            selected_text: draft.selected_text.clone(),
            instruction: draft.instruction.clone(),
            line_hint: draft.line_hint,
            status: CommentStatus::Pending,
            request_id: None,
        }
    }
}

impl From<StoredComment> for Comment {
    fn from(stored: StoredComment) -> Self {
        Self {
            id: Identity::Persisted(stored.id),
            document: stored.document,
            selected_text: stored.selected_text,
            instruction: stored.instruction,
            line_hint: stored.line_hint,
            status: stored.status,
            request_id: stored.request_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommentDraft {
    pub selected_text: String,
    pub instruction: String,
    pub line_hint: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommentPatch {
    pub status: CommentStatus,
    pub request_id: Option<RequestId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangelogStatus {
    Running,
    Completed,
    Error,
}

impl ChangelogStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ChangelogStatus::Running)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub id: ChangelogId,
    pub document: DocumentPath,
    pub request_id: Option<RequestId>,
    pub status: ChangelogStatus,
    pub summary: String,
    pub stream_log: String,
    pub comments_snapshot: Vec<StoredComment>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangelogDraft {
    pub request_id: Option<RequestId>,
    pub status: ChangelogStatus,
    pub summary: String,
    pub stream_log: String,
    pub comments_snapshot: Vec<StoredComment>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangelogPatch {
    pub status: ChangelogStatus,
    pub summary: String,
    pub stream_log: String,
}

/// One prior exchange forwarded to the agent with a chat request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}
