//! Per-document pending invocation slots
//!
//! At most one invocation (chat or edit) may be in flight per document. The
//! slot is claimed synchronously, before the caller awaits anything, so two
//! dispatches racing on the same document cannot both get through.
//!
//! A terminal signal is only reconciled when its invocation id still matches
//! the slot; [`PendingSlots::begin_reconcile`] is that check. The slot stays
//! held while the reconciler persists the outcome and is released only once
//! the final view is in place.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::EngineError;
use crate::ids::{ChangelogId, CommentId, InvocationId, RequestId, SessionId};
use crate::transport::TransportKind;
use crate::types::{DocumentPath, StoredComment};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationKind {
    Chat,
    Edit,
}

/// Dispatching: persistence setup still running, transport not started.
/// Streaming: the transport owns the invocation.
/// Reconciling: the terminal signal arrived and its outcome is being stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Dispatching,
    Streaming,
    Reconciling,
}

/// What the reconciler needs to finish the invocation
#[derive(Clone, Debug, PartialEq)]
pub enum InvocationContext {
    Chat {
        session_id: Option<SessionId>,
    },
    Edit {
        request_id: RequestId,
        comment_ids: Vec<CommentId>,
        changelog_id: Option<ChangelogId>,
        snapshot: Vec<StoredComment>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingInvocation {
    pub id: InvocationId,
    pub kind: InvocationKind,
    pub transport: TransportKind,
    pub started_at: DateTime<Utc>,
    pub phase: Phase,
    /// Cancel arrived while still dispatching
    pub cancelled: bool,
    pub context: InvocationContext,
}

#[derive(Debug, Default)]
pub struct PendingSlots {
    slots: Mutex<HashMap<DocumentPath, PendingInvocation>>,
    next_id: AtomicU64,
}

impl PendingSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocumentPath, PendingInvocation>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for `document`, allocating a fresh invocation id.
    pub fn try_begin(
        &self,
        document: &DocumentPath,
        kind: InvocationKind,
        transport: TransportKind,
        context: InvocationContext,
    ) -> Result<InvocationId, EngineError> {
        let mut slots = self.lock();
        if slots.contains_key(document) {
            return Err(EngineError::AlreadyPending(document.clone()));
        }
        let id = InvocationId::new(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        slots.insert(
            document.clone(),
            PendingInvocation {
                id,
                kind,
                transport,
                started_at: Utc::now(),
                phase: Phase::Dispatching,
                cancelled: false,
                context,
            },
        );
        Ok(id)
    }

    /// Replace the reconciliation context once setup produced real ids.
    pub fn update_context(&self, document: &DocumentPath, id: InvocationId, context: InvocationContext) {
        if let Some(slot) = self.lock().get_mut(document).filter(|s| s.id == id) {
            slot.context = context;
        }
    }

    /// Hand the invocation to the transport. Returns false when the slot was
    /// cancelled or replaced meanwhile.
    pub fn set_streaming(&self, document: &DocumentPath, id: InvocationId) -> bool {
        match self.lock().get_mut(document) {
            Some(slot) if slot.id == id && !slot.cancelled => {
                slot.phase = Phase::Streaming;
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, document: &DocumentPath, id: InvocationId) -> bool {
        self.lock()
            .get(document)
            .is_some_and(|slot| slot.id == id && !slot.cancelled)
    }

    /// Whether output for `id` should still reach the view.
    pub fn accepts_output(&self, document: &DocumentPath, id: InvocationId) -> bool {
        self.lock()
            .get(document)
            .is_some_and(|slot| slot.id == id && !slot.cancelled && slot.phase == Phase::Streaming)
    }

    pub fn is_cancelled(&self, document: &DocumentPath, id: InvocationId) -> bool {
        !self.is_current(document, id)
    }

    /// Move the live invocation `id` into reconciliation and return it.
    ///
    /// Returns `None` for a stale id or when reconciliation already began,
    /// so a repeated terminal signal is dropped. The slot stays held until
    /// [`PendingSlots::release`].
    pub fn begin_reconcile(
        &self,
        document: &DocumentPath,
        id: InvocationId,
    ) -> Option<PendingInvocation> {
        match self.lock().get_mut(document) {
            Some(slot) if slot.id == id && !slot.cancelled && slot.phase != Phase::Reconciling => {
                slot.phase = Phase::Reconciling;
                Some(slot.clone())
            }
            _ => None,
        }
    }

    /// Cancel whatever is pending. A streaming invocation is removed at
    /// once; a dispatching one is flagged and left for dispatch to release.
    /// An invocation already being reconciled has finished and is left alone.
    pub fn request_cancel(&self, document: &DocumentPath) -> Option<PendingInvocation> {
        let mut slots = self.lock();
        let slot = slots.get_mut(document)?;
        if slot.cancelled {
            return None;
        }
        match slot.phase {
            Phase::Streaming => slots.remove(document),
            Phase::Dispatching => {
                slot.cancelled = true;
                Some(slot.clone())
            }
            Phase::Reconciling => None,
        }
    }

    /// Release the slot held by `id`, cancelled or not.
    pub fn release(&self, document: &DocumentPath, id: InvocationId) -> Option<PendingInvocation> {
        let mut slots = self.lock();
        match slots.get(document) {
            Some(slot) if slot.id == id => slots.remove(document),
            _ => None,
        }
    }

    pub fn current(&self, document: &DocumentPath) -> Option<PendingInvocation> {
        self.lock().get(document).cloned()
    }

    pub fn is_pending(&self, document: &DocumentPath) -> bool {
        self.lock().contains_key(document)
    }
}
