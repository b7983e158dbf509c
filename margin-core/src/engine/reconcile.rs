//! Completion reconciler
//!
//! The pending slot moves to reconciling before any side effect, so a repeated
//! or stale terminal signal finds nothing to reconcile and is dropped. The slot
//! is released together with the final view update, which keeps the next
//! dispatch out until the outcome is stored.

use tracing::{debug, error, info, warn};

use super::EngineInner;
use crate::ids::{ChangelogId, CommentId, InvocationId, LocalId, RequestId, SessionId};
use crate::pending::InvocationContext;
use crate::transport::{Terminal, TerminalSignal};
use crate::types::{
    ChangelogDraft, ChangelogEntry, ChangelogPatch, ChangelogStatus, CommentPatch, CommentStatus, DocumentPath,
    Message, Role, StoredComment,
};

const SUMMARY_LIMIT: usize = 200;

/// Edit batch being finished
struct EditOutcome {
    request_id: RequestId,
    comment_ids: Vec<CommentId>,
    changelog_id: Option<ChangelogId>,
    snapshot: Vec<StoredComment>,
}

impl EngineInner {
    pub(crate) async fn reconcile(&self, terminal: Terminal) {
        let Terminal {
            document,
            invocation,
            signal,
        } = terminal;

        let Some(pending) = self.store.slots().begin_reconcile(&document, invocation) else {
            debug!(%document, %invocation, "Discarding stale terminal signal");
            return;
        };
        self.store.notify();

        match pending.context {
            InvocationContext::Chat { session_id } => {
                let (content, is_error) = match signal {
                    TerminalSignal::Complete { content } => (content, false),
                    TerminalSignal::Error { message } => (format!("Error: {}", message), true),
                };
                self.finish_chat(&document, invocation, session_id, content, is_error)
                    .await;
            }
            InvocationContext::Edit {
                request_id,
                comment_ids,
                changelog_id,
                snapshot,
            } => {
                let outcome = EditOutcome {
                    request_id,
                    comment_ids,
                    changelog_id,
                    snapshot,
                };
                match signal {
                    TerminalSignal::Complete { content } => {
                        self.finish_edit(&document, invocation, outcome, content).await
                    }
                    TerminalSignal::Error { message } => {
                        self.fail_edit(&document, invocation, outcome, message).await
                    }
                }
            }
        }
    }

    /// Persist the assistant reply, then show it in place of the stream.
    async fn finish_chat(
        &self,
        document: &DocumentPath,
        invocation: InvocationId,
        session_id: Option<SessionId>,
        content: String,
        is_error: bool,
    ) {
        let local = LocalId::new();
        let mut message = Message::optimistic(local, Role::Assistant, content, None);
        message.is_error = is_error;
        message.session_id = session_id.clone();
        let draft = message.draft();

        let persisted = self
            .retry
            .run("create_message", || {
                self.gateway
                    .create_message(document, session_id.as_ref(), &draft)
            })
            .await;

        self.store.settle(document, invocation, |view| {
            view.end_stream();
            match persisted {
                Ok(receipt) => {
                    view.push_message(Message::from(receipt.message));
                    view.upsert_session(receipt.session);
                    if is_error {
                        view.last_error = Some(draft.content.clone());
                    }
                }
                Err(e) => {
                    // Keep the reply visible even though it is not stored
                    error!(%document, %invocation, "Assistant message not persisted: {}", e);
                    view.push_message(message);
                    view.last_error = Some(e.to_string());
                }
            }
        });
        info!(%document, %invocation, is_error, "Chat reconciled");
    }

    async fn finish_edit(
        &self,
        document: &DocumentPath,
        invocation: InvocationId,
        outcome: EditOutcome,
        content: String,
    ) {
        let patch = CommentPatch {
            status: CommentStatus::Applied,
            request_id: Some(outcome.request_id.clone()),
        };
        let applied = self
            .retry
            .run("patch_comments", || {
                self.gateway.patch_comments(&outcome.comment_ids, &patch)
            })
            .await;

        let summary = summarize(&content);
        let entry = self
            .write_changelog(document, &outcome, ChangelogStatus::Completed, summary, content)
            .await;

        self.store.settle(document, invocation, |view| {
            view.end_stream();
            match applied {
                Ok(applied) => view.merge_comments(&applied),
                Err(e) => {
                    error!(%document, %invocation, "Comments not marked applied: {}", e);
                    view.last_error = Some(e.to_string());
                }
            }
            if let Some(entry) = entry {
                view.upsert_changelog(entry);
            }
        });
        info!(%document, %invocation, comments = outcome.comment_ids.len(), "Edit batch reconciled");
    }

    /// Comments stay "sent"; the changelog entry records the failure.
    async fn fail_edit(
        &self,
        document: &DocumentPath,
        invocation: InvocationId,
        outcome: EditOutcome,
        message: String,
    ) {
        let streamed = self.store.read(document, |view| view.stream_output.clone());
        let stream_log = if streamed.is_empty() {
            format!("Error: {}", message)
        } else {
            format!("{}\n\nError: {}", streamed, message)
        };

        let entry = self
            .write_changelog(document, &outcome, ChangelogStatus::Error, message.clone(), stream_log)
            .await;

        self.store.settle(document, invocation, |view| {
            view.end_stream();
            view.last_error = Some(message);
            if let Some(entry) = entry {
                view.upsert_changelog(entry);
            }
        });
        warn!(%document, %invocation, "Edit batch failed");
    }

    /// Close the running changelog entry, or create one if setup never did.
    async fn write_changelog(
        &self,
        document: &DocumentPath,
        outcome: &EditOutcome,
        status: ChangelogStatus,
        summary: String,
        stream_log: String,
    ) -> Option<ChangelogEntry> {
        let result = match &outcome.changelog_id {
            Some(changelog_id) => {
                let patch = ChangelogPatch {
                    status,
                    summary,
                    stream_log,
                };
                self.retry
                    .run("patch_changelog", || {
                        self.gateway.patch_changelog(changelog_id, &patch)
                    })
                    .await
            }
            None => {
                let draft = ChangelogDraft {
                    request_id: Some(outcome.request_id.clone()),
                    status,
                    summary,
                    stream_log,
                    comments_snapshot: outcome.snapshot.clone(),
                };
                self.retry
                    .run("create_changelog", || {
                        self.gateway.create_changelog(document, &draft)
                    })
                    .await
            }
        };
        match result {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!(%document, request_id = %outcome.request_id, "Changelog not updated: {}", e);
                None
            }
        }
    }
}

/// First non-empty line of the agent output, shortened
fn summarize(content: &str) -> String {
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Edits applied");
    if line.chars().count() <= SUMMARY_LIMIT {
        return line.to_string();
    }
    let mut summary: String = line.chars().take(SUMMARY_LIMIT).collect();
    summary.push('…');
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_uses_first_line() {
        assert_eq!(summarize("\n  Fixed typo.\nDetails follow"), "Fixed typo.");
        assert_eq!(summarize(""), "Edits applied");
    }

    #[test]
    fn test_summary_is_bounded() {
        let long = "x".repeat(500);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), SUMMARY_LIMIT + 1);
    }
}
