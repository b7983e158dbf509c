//! Session store: client-held state read by the UI
//!
//! One [`DocumentView`] per document plus the pending-invocation slots. Only
//! the engine mutates it (`update` is crate-private); readers take snapshots
//! and watch the revision counter returned by [`SessionStore::subscribe`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::ids::{CommentId, Identity, InvocationId, LocalId, SessionId};
use crate::pending::{PendingInvocation, PendingSlots};
use crate::types::{ChangelogEntry, Comment, DocumentPath, Message, Session, StoredComment, StoredMessage};

/// Everything the UI shows for one document
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentView {
    /// Most recently updated first
    pub sessions: Vec<Session>,
    pub active_session_id: Option<SessionId>,
    /// Messages of the active session, oldest first
    pub messages: Vec<Message>,
    pub comments: Vec<Comment>,
    /// Newest first
    pub changelog: Vec<ChangelogEntry>,
    /// Accumulated output of the running invocation, never persisted
    pub stream_output: String,
    pub is_streaming: bool,
    pub last_error: Option<String>,
    pub pending: Option<PendingInvocation>,
}

impl DocumentView {
    pub(crate) fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Swap an optimistic message for its stored counterpart.
    pub(crate) fn confirm_message(&mut self, local: &LocalId, stored: StoredMessage) -> bool {
        match self.messages.iter_mut().find(|m| m.id.is_local(local)) {
            Some(message) => {
                *message = Message::from(stored);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_message(&mut self, local: &LocalId) {
        self.messages.retain(|m| !m.id.is_local(local));
    }

    pub(crate) fn upsert_session(&mut self, session: Session) {
        match self.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => self.sessions.push(session),
        }
        self.sessions
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }

    /// Replace the stream output with a newer snapshot. Returns false when
    /// nothing changed.
    pub(crate) fn set_stream_output(&mut self, content: &str) -> bool {
        if self.stream_output == content {
            return false;
        }
        self.stream_output.clear();
        self.stream_output.push_str(content);
        true
    }

    pub(crate) fn begin_stream(&mut self) {
        self.stream_output.clear();
        self.is_streaming = true;
        self.last_error = None;
    }

    pub(crate) fn end_stream(&mut self) {
        self.stream_output.clear();
        self.is_streaming = false;
    }

    pub(crate) fn confirm_comment(&mut self, local: &LocalId, stored: StoredComment) -> bool {
        match self.comments.iter_mut().find(|c| c.id.is_local(local)) {
            Some(comment) => {
                *comment = Comment::from(stored);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_comment(&mut self, id: &Identity<CommentId>) {
        self.comments.retain(|c| &c.id != id);
    }

    /// Fold gateway results into cached comments. Status never moves back.
    pub(crate) fn merge_comments(&mut self, stored: &[StoredComment]) {
        for update in stored {
            let Some(comment) = self
                .comments
                .iter_mut()
                .find(|c| c.id.persisted() == Some(&update.id))
            else {
                self.comments.push(Comment::from(update.clone()));
                continue;
            };
            if let Err(e) = comment.status.advance(update.status) {
                debug!(comment = %update.id, "Ignoring comment update: {}", e);
                continue;
            }
            if update.request_id.is_some() {
                comment.request_id = update.request_id.clone();
            }
        }
    }

    pub(crate) fn upsert_changelog(&mut self, entry: ChangelogEntry) {
        match self.changelog.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.changelog.insert(0, entry),
        }
    }
}

pub struct SessionStore {
    documents: Mutex<HashMap<DocumentPath, DocumentView>>,
    slots: PendingSlots,
    revision: watch::Sender<u64>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            documents: Mutex::new(HashMap::new()),
            slots: PendingSlots::new(),
            revision,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocumentPath, DocumentView>> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current state of `document`
    pub fn snapshot(&self, document: &DocumentPath) -> DocumentView {
        let mut view = self.lock().get(document).cloned().unwrap_or_default();
        view.pending = self.slots.current(document);
        view
    }

    /// Receiver whose value is bumped after every change
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn is_pending(&self, document: &DocumentPath) -> bool {
        self.slots.is_pending(document)
    }

    pub(crate) fn slots(&self) -> &PendingSlots {
        &self.slots
    }

    pub(crate) fn read<R>(&self, document: &DocumentPath, inspect: impl FnOnce(&DocumentView) -> R) -> R {
        match self.lock().get(document) {
            Some(view) => inspect(view),
            None => inspect(&DocumentView::default()),
        }
    }

    pub(crate) fn update<R>(
        &self,
        document: &DocumentPath,
        mutate: impl FnOnce(&mut DocumentView) -> R,
    ) -> R {
        let result = {
            let mut documents = self.lock();
            mutate(documents.entry(document.clone()).or_default())
        };
        self.notify();
        result
    }

    /// Apply the final change for `invocation` and free its slot in one step,
    /// so no dispatch can start against a half-finished view.
    pub(crate) fn settle(
        &self,
        document: &DocumentPath,
        invocation: InvocationId,
        mutate: impl FnOnce(&mut DocumentView),
    ) {
        {
            let mut documents = self.lock();
            mutate(documents.entry(document.clone()).or_default());
            self.slots.release(document, invocation);
        }
        self.notify();
    }

    pub(crate) fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}
