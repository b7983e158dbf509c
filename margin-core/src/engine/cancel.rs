use tracing::info;

use super::AgentEngine;
use crate::error::{EngineError, Result};
use crate::pending::{InvocationContext, Phase};
use crate::types::DocumentPath;

impl AgentEngine {
    /// Cancel the invocation pending for `document`.
    ///
    /// The store goes idle immediately. A streaming invocation is handed to
    /// the transport for teardown; one still dispatching is flagged and its
    /// dispatch releases the slot once the in-flight setup call settles.
    /// Nothing the agent produced is persisted. Once the agent has finished
    /// and its outcome is being stored there is nothing left to cancel.
    pub async fn cancel(&self, document: &DocumentPath) -> Result<()> {
        let inner = &self.inner;
        let Some(pending) = inner.store.slots().request_cancel(document) else {
            return Err(EngineError::NothingPending(document.clone()));
        };

        inner.store.update(document, |view| view.end_stream());
        info!(
            %document,
            invocation = %pending.id,
            phase = ?pending.phase,
            transport = %pending.transport,
            "Invocation cancelled"
        );

        if pending.phase == Phase::Streaming {
            inner.transport.cancel(document, pending.id).await;
            if let InvocationContext::Edit {
                changelog_id: Some(changelog_id),
                ..
            } = &pending.context
            {
                self.close_cancelled_changelog(document, changelog_id).await;
            }
        }
        Ok(())
    }
}
