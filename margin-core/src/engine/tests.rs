//! Engine tests with a scripted transport and a recording gateway

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::*;
use crate::error::{GatewayError, TransportError};
use crate::ids::{ChangelogId, InvocationId};
use crate::storage::MemoryGateway;
use crate::transport::{AgentRequest, IncrementHandler, Invocation, Listeners, TerminalHandler, TerminalSignal};
use crate::types::{
    ChangelogDraft, ChangelogEntry, ChangelogPatch, ChangelogStatus, CommentPatch, CommentStatus,
    MessageDraft, MessageReceipt, Role, Session, StoredComment, StoredMessage,
};

type CallLog = Arc<Mutex<Vec<String>>>;

// ============================================================================
// Scripted transport
// ============================================================================

#[derive(Default)]
struct ScriptedTransport {
    listeners: Listeners,
    started: Mutex<Vec<Invocation>>,
    cancelled: Mutex<Vec<InvocationId>>,
    fail_start: AtomicBool,
    log: CallLog,
}

impl ScriptedTransport {
    fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            ..Default::default()
        })
    }

    fn last_started(&self) -> Invocation {
        self.started
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("nothing started")
    }

    fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    fn increment(&self, invocation: &Invocation, content: &str) {
        self.listeners.emit_increment(Increment {
            document: invocation.document.clone(),
            invocation: invocation.id,
            content: content.to_string(),
        });
    }

    fn terminal(&self, invocation: &Invocation, signal: TerminalSignal) {
        self.listeners.emit_terminal(Terminal {
            document: invocation.document.clone(),
            invocation: invocation.id,
            signal,
        });
    }

    fn complete(&self, invocation: &Invocation, content: &str) {
        self.terminal(
            invocation,
            TerminalSignal::Complete {
                content: content.to_string(),
            },
        );
    }

    fn fail(&self, invocation: &Invocation, message: &str) {
        self.terminal(
            invocation,
            TerminalSignal::Error {
                message: message.to_string(),
            },
        );
    }
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ipc
    }

    async fn start(&self, invocation: Invocation) -> std::result::Result<(), TransportError> {
        let kind = match invocation.request {
            AgentRequest::Chat { .. } => "chat",
            AgentRequest::Edit { .. } => "edit",
        };
        self.log.lock().unwrap().push(format!("start:{}", kind));
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("agent offline".into()));
        }
        self.started.lock().unwrap().push(invocation);
        Ok(())
    }

    fn on_increment(&self, handler: IncrementHandler) {
        self.listeners.add_increment(handler);
    }

    fn on_terminal(&self, handler: TerminalHandler) {
        self.listeners.add_terminal(handler);
    }

    async fn cancel(&self, _document: &DocumentPath, invocation: InvocationId) {
        self.log.lock().unwrap().push("cancel".to_string());
        self.cancelled.lock().unwrap().push(invocation);
    }
}

// ============================================================================
// Recording gateway
// ============================================================================

#[derive(Default)]
struct RecordingGateway {
    store: MemoryGateway,
    log: CallLog,
    /// Failures returned by the next create_message calls, in order
    message_failures: Mutex<VecDeque<GatewayError>>,
    /// When set, create_message waits for a notification
    message_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, patch_comments waits for a notification
    comment_gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingGateway {
    fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            ..Default::default()
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.log.lock().unwrap().push(call.into());
    }

    fn fail_next_message(&self, error: GatewayError) {
        self.message_failures.lock().unwrap().push_back(error);
    }

    fn gate_messages(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.message_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn gate_comment_patches(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.comment_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn count(&self, call: &str) -> usize {
        self.log.lock().unwrap().iter().filter(|c| *c == call).count()
    }
}

#[async_trait]
impl PersistenceGateway for RecordingGateway {
    async fn list_sessions(&self, document: &DocumentPath) -> std::result::Result<Vec<Session>, GatewayError> {
        self.record("list_sessions");
        self.store.list_sessions(document).await
    }

    async fn create_session(&self, document: &DocumentPath) -> std::result::Result<Session, GatewayError> {
        self.record("create_session");
        self.store.create_session(document).await
    }

    async fn delete_session(&self, session_id: &SessionId) -> std::result::Result<(), GatewayError> {
        self.record("delete_session");
        self.store.delete_session(session_id).await
    }

    async fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> std::result::Result<Vec<StoredMessage>, GatewayError> {
        self.record("list_messages");
        self.store.list_messages(session_id).await
    }

    async fn create_message(
        &self,
        document: &DocumentPath,
        session_id: Option<&SessionId>,
        draft: &MessageDraft,
    ) -> std::result::Result<MessageReceipt, GatewayError> {
        self.record("create_message");
        let gate = self.message_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let failure = self.message_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.store.create_message(document, session_id, draft).await
    }

    async fn list_comments(
        &self,
        document: &DocumentPath,
    ) -> std::result::Result<Vec<StoredComment>, GatewayError> {
        self.record("list_comments");
        self.store.list_comments(document).await
    }

    async fn create_comment(
        &self,
        document: &DocumentPath,
        draft: &CommentDraft,
    ) -> std::result::Result<StoredComment, GatewayError> {
        self.record("create_comment");
        self.store.create_comment(document, draft).await
    }

    async fn patch_comments(
        &self,
        ids: &[CommentId],
        patch: &CommentPatch,
    ) -> std::result::Result<Vec<StoredComment>, GatewayError> {
        self.record(format!("patch_comments:{}", patch.status));
        let gate = self.comment_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.store.patch_comments(ids, patch).await
    }

    async fn delete_comment(&self, id: &CommentId) -> std::result::Result<(), GatewayError> {
        self.record("delete_comment");
        self.store.delete_comment(id).await
    }

    async fn list_changelog(
        &self,
        document: &DocumentPath,
    ) -> std::result::Result<Vec<ChangelogEntry>, GatewayError> {
        self.record("list_changelog");
        self.store.list_changelog(document).await
    }

    async fn create_changelog(
        &self,
        document: &DocumentPath,
        draft: &ChangelogDraft,
    ) -> std::result::Result<ChangelogEntry, GatewayError> {
        self.record("create_changelog");
        self.store.create_changelog(document, draft).await
    }

    async fn patch_changelog(
        &self,
        id: &ChangelogId,
        patch: &ChangelogPatch,
    ) -> std::result::Result<ChangelogEntry, GatewayError> {
        self.record("patch_changelog");
        self.store.patch_changelog(id, patch).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    engine: AgentEngine,
    gateway: Arc<RecordingGateway>,
    transport: Arc<ScriptedTransport>,
    log: CallLog,
}

fn harness() -> Harness {
    harness_with(RetryPolicy::immediate(3))
}

fn harness_with(retry: RetryPolicy) -> Harness {
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let gateway = RecordingGateway::new(Arc::clone(&log));
    let transport = ScriptedTransport::new(Arc::clone(&log));
    let engine = AgentEngine::new(
        gateway.clone(),
        transport.clone(),
        EngineOptions { retry, model: None },
    );
    Harness {
        engine,
        gateway,
        transport,
        log,
    }
}

fn doc() -> DocumentPath {
    DocumentPath::from("notes/a.md")
}

async fn wait_for(
    engine: &AgentEngine,
    document: &DocumentPath,
    done: impl Fn(&DocumentView) -> bool,
) -> DocumentView {
    let mut changes = engine.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = engine.snapshot(document);
            if done(&view) {
                return view;
            }
            changes.changed().await.unwrap();
        }
    })
    .await
    .expect("store never reached the expected state")
}

async fn settled(engine: &AgentEngine, document: &DocumentPath) -> DocumentView {
    wait_for(engine, document, |view| view.pending.is_none() && !view.is_streaming).await
}

/// Let the event loop drain anything still queued
async fn drain() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn add_comment(engine: &AgentEngine, selected: &str, instruction: &str) -> CommentId {
    engine
        .add_comment(
            &doc(),
            CommentDraft {
                selected_text: selected.into(),
                instruction: instruction.into(),
                line_hint: None,
            },
        )
        .await
        .unwrap()
}

// ============================================================================
// Chat
// ============================================================================

#[tokio::test]
async fn test_summarize_section_end_to_end() {
    let h = harness();

    h.engine
        .send_message(&doc(), "Summarize section 2", None)
        .await
        .unwrap();
    let invocation = h.transport.last_started();
    assert!(h.engine.snapshot(&doc()).is_streaming);

    h.transport.increment(&invocation, "Sum");
    h.transport.increment(&invocation, "Summary: ...");
    let view = wait_for(&h.engine, &doc(), |v| v.stream_output == "Summary: ...").await;
    assert!(view.is_streaming);
    // Nothing persisted mid-stream
    assert_eq!(h.gateway.store.message_count(), 1);

    h.transport
        .complete(&invocation, "Summary: section 2 covers X.");
    let view = settled(&h.engine, &doc()).await;

    assert_eq!(view.stream_output, "");
    assert!(!view.is_streaming);
    assert_eq!(view.messages.len(), 2);
    assert!(view.messages.iter().all(|m| m.id.is_persisted()));

    let stored = h.gateway.store.messages_for(&doc());
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[0].content, "Summarize section 2");
    assert_eq!(stored[1].role, Role::Assistant);
    assert_eq!(stored[1].content, "Summary: section 2 covers X.");
    assert_eq!(stored[0].session_id, stored[1].session_id);
    assert_eq!(view.active_session_id, Some(stored[0].session_id.clone()));
}

#[tokio::test]
async fn test_concurrent_dispatch_is_rejected() {
    let h = harness();

    let document = doc();
    let (first, second) = tokio::join!(
        h.engine.send_message(&document, "one", None),
        h.engine.send_message(&document, "two", None),
    );
    assert!(first.is_ok());
    assert_eq!(second, Err(EngineError::AlreadyPending(doc())));

    // Edit dispatch shares the slot
    let comment = add_comment(&h.engine, "teh", "fix typo").await;
    let err = h
        .engine
        .send_edit_batch(&doc(), &[Identity::Persisted(comment)])
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyPending(doc()));
    assert_eq!(h.transport.started_count(), 1);

    h.transport.complete(&h.transport.last_started(), "done");
    settled(&h.engine, &doc()).await;
    assert!(h.engine.send_message(&doc(), "three", None).await.is_ok());
}

#[tokio::test]
async fn test_other_documents_are_independent() {
    let h = harness();
    h.engine.send_message(&doc(), "one", None).await.unwrap();
    h.engine
        .send_message(&DocumentPath::from("notes/b.md"), "two", None)
        .await
        .unwrap();
    assert_eq!(h.transport.started_count(), 2);
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let h = harness();
    let err = h.engine.send_message(&doc(), "   ", None).await.unwrap_err();
    assert_eq!(err, EngineError::EmptyMessage);
    assert!(!h.engine.is_pending(&doc()));
    assert_eq!(h.gateway.count("create_message"), 0);
}

#[tokio::test]
async fn test_duplicate_terminal_is_reconciled_once() {
    let h = harness();
    h.engine.send_message(&doc(), "hello", None).await.unwrap();
    let invocation = h.transport.last_started();

    h.transport.complete(&invocation, "hi there");
    h.transport.complete(&invocation, "hi there");
    settled(&h.engine, &doc()).await;
    drain().await;

    let view = h.engine.snapshot(&doc());
    assert_eq!(view.messages.len(), 2);
    assert_eq!(h.gateway.store.message_count(), 2);
}

#[tokio::test]
async fn test_history_is_forwarded() {
    let h = harness();
    h.engine.send_message(&doc(), "first", None).await.unwrap();
    h.transport.complete(&h.transport.last_started(), "reply");
    settled(&h.engine, &doc()).await;

    h.engine
        .send_message(&doc(), "second", Some("selected text".into()))
        .await
        .unwrap();
    let AgentRequest::Chat {
        message,
        session_id,
        context,
        history,
        ..
    } = h.transport.last_started().request
    else {
        panic!("expected chat request");
    };
    assert_eq!(message, "second");
    assert_eq!(context.as_deref(), Some("selected text"));
    assert!(session_id.is_some());
    assert_eq!(
        history
            .iter()
            .map(|e| (e.role, e.content.as_str()))
            .collect::<Vec<_>>(),
        vec![(Role::User, "first"), (Role::Assistant, "reply")]
    );
    // Still one session for the document
    assert_eq!(h.engine.snapshot(&doc()).sessions.len(), 1);
}

#[tokio::test]
async fn test_next_dispatch_waits_for_reply_to_be_stored() {
    let h = harness();
    h.engine.send_message(&doc(), "first", None).await.unwrap();
    let gate = h.gateway.gate_messages();

    h.transport.complete(&h.transport.last_started(), "reply");
    let view = wait_for(&h.engine, &doc(), |v| {
        v.pending
            .as_ref()
            .is_some_and(|p| p.phase == crate::pending::Phase::Reconciling)
    })
    .await;
    assert!(view.is_streaming);

    // The reply is not stored yet, so the document is still busy
    let err = h.engine.send_message(&doc(), "second", None).await.unwrap_err();
    assert_eq!(err, EngineError::AlreadyPending(doc()));
    assert_eq!(
        h.engine.cancel(&doc()).await,
        Err(EngineError::NothingPending(doc()))
    );
    assert!(h.engine.is_pending(&doc()));
    assert_eq!(h.transport.started_count(), 1);

    gate.notify_one();
    settled(&h.engine, &doc()).await;

    h.engine.send_message(&doc(), "second", None).await.unwrap();
    let AgentRequest::Chat { history, .. } = h.transport.last_started().request else {
        panic!("expected chat request");
    };
    assert_eq!(
        history
            .iter()
            .map(|e| e.content.as_str())
            .collect::<Vec<_>>(),
        vec!["first", "reply"]
    );

    h.transport.complete(&h.transport.last_started(), "second reply");
    let view = settled(&h.engine, &doc()).await;
    assert_eq!(
        view.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>(),
        vec!["first", "reply", "second", "second reply"]
    );
    let stored = h.gateway.store.messages_for(&doc());
    assert_eq!(stored[1].content, "reply");
    assert_eq!(stored[2].content, "second");
}

#[tokio::test]
async fn test_agent_error_appends_error_message() {
    let h = harness();
    h.engine.send_message(&doc(), "hello", None).await.unwrap();
    h.transport.fail(&h.transport.last_started(), "agent crashed");

    let view = settled(&h.engine, &doc()).await;
    let last = view.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "Error: agent crashed");
    assert!(last.is_error);
    assert!(last.id.is_persisted());
    assert!(view.pending.is_none());
}

#[tokio::test]
async fn test_rejected_persistence_rolls_back() {
    let h = harness();
    h.gateway
        .fail_next_message(GatewayError::Rejected("quota exceeded".into()));

    let err = h.engine.send_message(&doc(), "hello", None).await.unwrap_err();
    assert!(matches!(err, EngineError::PersistenceRejected(_)));

    let view = h.engine.snapshot(&doc());
    assert!(view.messages.is_empty());
    assert!(!view.is_streaming);
    assert!(view.pending.is_none());
    assert!(view.last_error.is_some());
    // Never retried, and the agent was never called
    assert_eq!(h.gateway.count("create_message"), 1);
    assert_eq!(h.transport.started_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_persistence_failures_are_retried() {
    let h = harness_with(RetryPolicy::default());
    h.gateway
        .fail_next_message(GatewayError::Transient("connection reset".into()));
    h.gateway
        .fail_next_message(GatewayError::Transient("connection reset".into()));

    let started = tokio::time::Instant::now();
    h.engine.send_message(&doc(), "hello", None).await.unwrap();
    assert_eq!(h.gateway.count("create_message"), 3);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(h.transport.started_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_never_invokes_agent() {
    let h = harness_with(RetryPolicy::default());
    for _ in 0..3 {
        h.gateway
            .fail_next_message(GatewayError::Transient("timeout".into()));
    }

    let err = h.engine.send_message(&doc(), "hello", None).await.unwrap_err();
    assert!(matches!(err, EngineError::TransientNetwork(_)));
    assert_eq!(h.transport.started_count(), 0);
    assert!(h.engine.snapshot(&doc()).messages.is_empty());
}

#[tokio::test]
async fn test_start_failure_is_reported_as_agent_error() {
    let h = harness();
    h.transport.fail_start.store(true, Ordering::SeqCst);

    let err = h.engine.send_message(&doc(), "hello", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Agent(_)));

    let view = h.engine.snapshot(&doc());
    assert!(view.pending.is_none());
    assert!(!view.is_streaming);
    assert!(view.messages.last().unwrap().is_error);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_before_any_increment() {
    let h = harness();
    h.engine.send_message(&doc(), "hello", None).await.unwrap();
    let invocation = h.transport.last_started();

    h.engine.cancel(&doc()).await.unwrap();
    let view = h.engine.snapshot(&doc());
    assert!(!view.is_streaming);
    assert!(view.pending.is_none());
    assert_eq!(*h.transport.cancelled.lock().unwrap(), vec![invocation.id]);

    // The agent finishes anyway: nothing is applied
    h.transport.increment(&invocation, "late");
    h.transport.complete(&invocation, "late reply");
    drain().await;

    let view = h.engine.snapshot(&doc());
    assert_eq!(view.stream_output, "");
    assert_eq!(view.messages.len(), 1);
    assert!(view.messages.iter().all(|m| m.role == Role::User));
    assert_eq!(h.gateway.store.message_count(), 1);
}

#[tokio::test]
async fn test_cancel_without_pending_invocation() {
    let h = harness();
    assert_eq!(
        h.engine.cancel(&doc()).await,
        Err(EngineError::NothingPending(doc()))
    );
}

#[tokio::test]
async fn test_stale_terminal_does_not_touch_new_invocation() {
    let h = harness();
    h.engine.send_message(&doc(), "first", None).await.unwrap();
    let old = h.transport.last_started();
    h.engine.cancel(&doc()).await.unwrap();

    h.engine.send_message(&doc(), "second", None).await.unwrap();
    let new = h.transport.last_started();
    assert!(new.id > old.id);

    h.transport.complete(&old, "orphaned");
    drain().await;
    assert!(h.engine.is_pending(&doc()));

    h.transport.complete(&new, "answer");
    let view = settled(&h.engine, &doc()).await;
    let contents: Vec<&str> = view.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second", "answer"]);
}

#[tokio::test]
async fn test_cancel_while_dispatching() {
    let h = harness();
    let gate = h.gateway.gate_messages();

    let engine = h.engine.clone();
    let dispatch = tokio::spawn(async move { engine.send_message(&doc(), "hello", None).await });
    wait_for(&h.engine, &doc(), |v| v.pending.is_some()).await;

    h.engine.cancel(&doc()).await.unwrap();
    assert!(!h.engine.snapshot(&doc()).is_streaming);
    // Slot stays held until the setup call settles
    assert!(h.engine.is_pending(&doc()));

    gate.notify_one();
    assert_eq!(dispatch.await.unwrap(), Err(EngineError::Cancelled));
    assert!(!h.engine.is_pending(&doc()));
    assert_eq!(h.transport.started_count(), 0);
    assert!(!h.log.lock().unwrap().iter().any(|c| c.starts_with("start:")));
}

// ============================================================================
// Edit batches
// ============================================================================

#[tokio::test]
async fn test_edit_batch_marks_sent_before_invoking_agent() {
    let h = harness();
    let first = add_comment(&h.engine, "teh cat", "fix typo").await;
    let second = add_comment(&h.engine, "Section 2", "make it a heading").await;

    h.engine
        .send_edit_batch(
            &doc(),
            &[
                Identity::Persisted(first.clone()),
                Identity::Persisted(second.clone()),
            ],
        )
        .await
        .unwrap();

    let log = h.log.lock().unwrap().clone();
    let sent_at = log.iter().position(|c| c == "patch_comments:sent").unwrap();
    let start_at = log.iter().position(|c| c == "start:edit").unwrap();
    assert!(sent_at < start_at, "call order: {:?}", log);

    let a = h.gateway.store.comment(&first).unwrap();
    let b = h.gateway.store.comment(&second).unwrap();
    assert_eq!(a.status, CommentStatus::Sent);
    assert_eq!(b.status, CommentStatus::Sent);
    assert!(a.request_id.is_some());
    assert_eq!(a.request_id, b.request_id);

    let AgentRequest::Edit { instruction, .. } = h.transport.last_started().request else {
        panic!("expected edit request");
    };
    assert!(instruction.contains("teh cat"));
    assert!(instruction.contains("make it a heading"));

    let view = h.engine.snapshot(&doc());
    assert_eq!(view.changelog.len(), 1);
    assert_eq!(view.changelog[0].status, ChangelogStatus::Running);
    assert_eq!(view.changelog[0].comments_snapshot.len(), 2);
}

#[tokio::test]
async fn test_edit_success_applies_comments() {
    let h = harness();
    let comment = add_comment(&h.engine, "teh", "fix typo").await;
    h.engine
        .send_edit_batch(&doc(), &[Identity::Persisted(comment.clone())])
        .await
        .unwrap();
    let invocation = h.transport.last_started();

    h.transport.increment(&invocation, "Fixing");
    h.transport.complete(&invocation, "Fixed the typo.\nChanged teh -> the");
    let view = settled(&h.engine, &doc()).await;

    assert_eq!(view.comments[0].status, CommentStatus::Applied);
    assert_eq!(
        h.gateway.store.comment(&comment).unwrap().status,
        CommentStatus::Applied
    );
    let entry = &view.changelog[0];
    assert_eq!(entry.status, ChangelogStatus::Completed);
    assert_eq!(entry.summary, "Fixed the typo.");
    assert_eq!(entry.stream_log, "Fixed the typo.\nChanged teh -> the");
}

#[tokio::test]
async fn test_edit_failure_keeps_comments_sent() {
    let h = harness();
    let comment = add_comment(&h.engine, "teh", "fix typo").await;
    h.engine
        .send_edit_batch(&doc(), &[Identity::Persisted(comment.clone())])
        .await
        .unwrap();
    let invocation = h.transport.last_started();

    h.transport.increment(&invocation, "Working");
    h.transport.fail(&invocation, "file locked");
    let view = settled(&h.engine, &doc()).await;

    assert_eq!(
        h.gateway.store.comment(&comment).unwrap().status,
        CommentStatus::Sent
    );
    let entry = &view.changelog[0];
    assert_eq!(entry.status, ChangelogStatus::Error);
    assert_eq!(entry.stream_log, "Working\n\nError: file locked");
    assert_eq!(view.last_error.as_deref(), Some("file locked"));

    // Sent comments can be retried by hand
    h.engine
        .send_edit_batch(&doc(), &[Identity::Persisted(comment)])
        .await
        .unwrap();
    assert_eq!(h.transport.started_count(), 2);
}

#[tokio::test]
async fn test_applied_comment_cannot_go_back() {
    let h = harness();
    let comment = add_comment(&h.engine, "teh", "fix typo").await;
    h.engine
        .send_edit_batch(&doc(), &[Identity::Persisted(comment.clone())])
        .await
        .unwrap();
    h.transport.complete(&h.transport.last_started(), "done");
    settled(&h.engine, &doc()).await;

    let err = h
        .engine
        .send_edit_batch(&doc(), &[Identity::Persisted(comment.clone())])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::InvalidTransition {
            from: CommentStatus::Applied,
            to: CommentStatus::Sent
        }
    );

    let regress = CommentPatch {
        status: CommentStatus::Pending,
        request_id: None,
    };
    assert!(h
        .gateway
        .patch_comments(std::slice::from_ref(&comment), &regress)
        .await
        .is_err());
    assert_eq!(
        h.gateway.store.comment(&comment).unwrap().status,
        CommentStatus::Applied
    );
}

#[tokio::test]
async fn test_edit_batch_validation() {
    let h = harness();
    assert_eq!(
        h.engine.send_edit_batch(&doc(), &[]).await,
        Err(EngineError::EmptyBatch)
    );

    let unknown = Identity::Persisted(CommentId::from_string("missing"));
    assert!(matches!(
        h.engine.send_edit_batch(&doc(), &[unknown]).await,
        Err(EngineError::UnknownComment(_))
    ));
    assert!(!h.engine.is_pending(&doc()));
}

#[tokio::test]
async fn test_cancelled_edit_closes_changelog() {
    let h = harness();
    let comment = add_comment(&h.engine, "teh", "fix typo").await;
    h.engine
        .send_edit_batch(&doc(), &[Identity::Persisted(comment.clone())])
        .await
        .unwrap();

    h.engine.cancel(&doc()).await.unwrap();
    let view = h.engine.snapshot(&doc());
    assert_eq!(view.changelog[0].status, ChangelogStatus::Error);
    assert_eq!(view.changelog[0].summary, "Cancelled by user");
    assert_eq!(view.changelog[0].stream_log, "");
    assert_eq!(
        h.gateway.store.comment(&comment).unwrap().status,
        CommentStatus::Sent
    );
}

#[tokio::test]
async fn test_cancel_while_marking_sent_creates_no_changelog() {
    let h = harness();
    let comment = add_comment(&h.engine, "teh", "fix typo").await;
    let gate = h.gateway.gate_comment_patches();

    let engine = h.engine.clone();
    let batch = [Identity::Persisted(comment.clone())];
    let dispatch = tokio::spawn(async move { engine.send_edit_batch(&doc(), &batch).await });
    wait_for(&h.engine, &doc(), |v| v.pending.is_some()).await;

    h.engine.cancel(&doc()).await.unwrap();
    assert!(h.engine.is_pending(&doc()));

    gate.notify_one();
    assert_eq!(dispatch.await.unwrap(), Err(EngineError::Cancelled));

    let view = settled(&h.engine, &doc()).await;
    assert!(view.changelog.is_empty());
    assert!(view.last_error.is_none());
    assert_eq!(h.gateway.count("create_changelog"), 0);
    assert_eq!(h.gateway.count("patch_changelog"), 0);
    assert_eq!(h.transport.started_count(), 0);
    // The durability point was reached, so the comment stays sent
    assert_eq!(
        h.gateway.store.comment(&comment).unwrap().status,
        CommentStatus::Sent
    );
    assert_eq!(view.comments[0].status, CommentStatus::Sent);
}

// ============================================================================
// Documents, sessions, comments
// ============================================================================

#[tokio::test]
async fn test_open_document_loads_latest_session() {
    let h = harness();
    let draft = MessageDraft {
        role: Role::User,
        content: "earlier".into(),
        context: None,
        is_error: false,
    };
    let receipt = h
        .gateway
        .store
        .create_message(&doc(), None, &draft)
        .await
        .unwrap();

    h.engine.open_document(&doc()).await.unwrap();
    let view = h.engine.snapshot(&doc());
    assert_eq!(view.active_session_id, Some(receipt.session.id));
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].content, "earlier");
}

#[tokio::test]
async fn test_session_management_waits_for_idle() {
    let h = harness();
    h.engine.send_message(&doc(), "hello", None).await.unwrap();

    assert_eq!(
        h.engine.new_session(&doc()),
        Err(EngineError::AlreadyPending(doc()))
    );

    h.transport.complete(&h.transport.last_started(), "hi");
    settled(&h.engine, &doc()).await;

    h.engine.new_session(&doc()).unwrap();
    let view = h.engine.snapshot(&doc());
    assert!(view.active_session_id.is_none());
    assert!(view.messages.is_empty());

    // Next message lazily creates a second session
    h.engine.send_message(&doc(), "again", None).await.unwrap();
    assert_eq!(h.engine.snapshot(&doc()).sessions.len(), 2);
}

#[tokio::test]
async fn test_delete_active_session_clears_messages() {
    let h = harness();
    h.engine.send_message(&doc(), "hello", None).await.unwrap();
    h.transport.complete(&h.transport.last_started(), "hi");
    let view = settled(&h.engine, &doc()).await;
    let session_id = view.active_session_id.unwrap();

    h.engine.delete_session(&doc(), &session_id).await.unwrap();
    let view = h.engine.snapshot(&doc());
    assert!(view.sessions.is_empty());
    assert!(view.active_session_id.is_none());
    assert!(view.messages.is_empty());

    let err = h
        .engine
        .select_session(&doc(), &session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownSession(_)));
}

#[tokio::test]
async fn test_comment_add_and_remove() {
    let h = harness();
    let id = add_comment(&h.engine, "teh", "fix typo").await;
    let view = h.engine.snapshot(&doc());
    assert_eq!(view.comments.len(), 1);
    assert_eq!(view.comments[0].id, Identity::Persisted(id.clone()));
    assert_eq!(view.comments[0].status, CommentStatus::Pending);

    h.engine.remove_comment(&doc(), &id).await.unwrap();
    assert!(h.engine.snapshot(&doc()).comments.is_empty());
    assert!(h.gateway.store.comment(&id).is_none());
}

#[tokio::test]
async fn test_comment_in_running_batch_cannot_be_removed() {
    let h = harness();
    let id = add_comment(&h.engine, "teh", "fix typo").await;
    h.engine
        .send_edit_batch(&doc(), &[Identity::Persisted(id.clone())])
        .await
        .unwrap();

    assert_eq!(
        h.engine.remove_comment(&doc(), &id).await,
        Err(EngineError::AlreadyPending(doc()))
    );
}
