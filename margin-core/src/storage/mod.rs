//! Persistence gateway abstraction
//!
//! The engine never talks to a store directly. Every durable write goes
//! through [`PersistenceGateway`], wrapped in a [`RetryPolicy`].
//!
//! - `MemoryGateway` - in-process store (tests, offline host)
//! - `HttpGateway` - REST client for the served application's store

mod http;
mod memory;
mod retry;

pub use http::HttpGateway;
pub use memory::MemoryGateway;
pub use retry::RetryPolicy;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::ids::{ChangelogId, CommentId, SessionId};
use crate::types::{
    ChangelogDraft, ChangelogEntry, ChangelogPatch, CommentDraft, CommentPatch, DocumentPath,
    MessageDraft, MessageReceipt, Session, StoredComment, StoredMessage,
};

/// Durable store for sessions, messages, comments and changelog entries.
///
/// All operations are keyed by document path and return authoritative ids and
/// timestamps.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Sessions for a document, most recently updated first
    async fn list_sessions(&self, document: &DocumentPath) -> Result<Vec<Session>, GatewayError>;

    async fn create_session(&self, document: &DocumentPath) -> Result<Session, GatewayError>;

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), GatewayError>;

    async fn list_messages(&self, session_id: &SessionId)
    -> Result<Vec<StoredMessage>, GatewayError>;

    /// Persist a message. With `session_id = None` a new session is created
    /// for the document and returned in the receipt.
    async fn create_message(
        &self,
        document: &DocumentPath,
        session_id: Option<&SessionId>,
        draft: &MessageDraft,
    ) -> Result<MessageReceipt, GatewayError>;

    async fn list_comments(&self, document: &DocumentPath)
    -> Result<Vec<StoredComment>, GatewayError>;

    async fn create_comment(
        &self,
        document: &DocumentPath,
        draft: &CommentDraft,
    ) -> Result<StoredComment, GatewayError>;

    /// Apply one patch to several comments atomically
    async fn patch_comments(
        &self,
        ids: &[CommentId],
        patch: &CommentPatch,
    ) -> Result<Vec<StoredComment>, GatewayError>;

    async fn delete_comment(&self, id: &CommentId) -> Result<(), GatewayError>;

    async fn list_changelog(
        &self,
        document: &DocumentPath,
    ) -> Result<Vec<ChangelogEntry>, GatewayError>;

    async fn create_changelog(
        &self,
        document: &DocumentPath,
        draft: &ChangelogDraft,
    ) -> Result<ChangelogEntry, GatewayError>;

    async fn patch_changelog(
        &self,
        id: &ChangelogId,
        patch: &ChangelogPatch,
    ) -> Result<ChangelogEntry, GatewayError>;
}
