//! REST client for the served application's store
//!
//! Connection failures, timeouts, 429 and 5xx map to `GatewayError::Transient`;
//! any other non-success status is a rejection.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::instrument;

use super::PersistenceGateway;
use crate::error::GatewayError;
use crate::ids::{ChangelogId, CommentId, RequestId, SessionId};
use crate::types::{
    ChangelogDraft, ChangelogEntry, ChangelogPatch, CommentDraft, CommentPatch, CommentStatus,
    DocumentPath, MessageDraft, MessageReceipt, Session, StoredComment, StoredMessage,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct PathBody<'a> {
    path: &'a DocumentPath,
}

#[derive(Serialize)]
struct CreateMessageBody<'a> {
    path: &'a DocumentPath,
    session_id: Option<&'a SessionId>,
    #[serde(flatten)]
    draft: &'a MessageDraft,
}

#[derive(Serialize)]
struct CreateCommentBody<'a> {
    path: &'a DocumentPath,
    #[serde(flatten)]
    draft: &'a CommentDraft,
}

#[derive(Serialize)]
struct PatchCommentsBody<'a> {
    ids: &'a [CommentId],
    status: CommentStatus,
    request_id: Option<&'a RequestId>,
}

#[derive(Serialize)]
struct CreateChangelogBody<'a> {
    path: &'a DocumentPath,
    #[serde(flatten)]
    draft: &'a ChangelogDraft,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Rejected(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, GatewayError> {
        let response = Self::execute(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Rejected(format!("malformed store response: {}", e)))
    }

    async fn send_empty(request: RequestBuilder) -> Result<(), GatewayError> {
        Self::execute(request).await.map(|_| ())
    }

    async fn execute(request: RequestBuilder) -> Result<reqwest::Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        let message = format!("store returned {}: {}", status, body);
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(GatewayError::Transient(message))
        } else {
            Err(GatewayError::Rejected(message))
        }
    }
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    #[instrument(level = "trace", skip(self))]
    async fn list_sessions(&self, document: &DocumentPath) -> Result<Vec<Session>, GatewayError> {
        Self::send(
            self.client
                .get(self.url("/api/sessions"))
                .query(&[("path", document.as_str())]),
        )
        .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn create_session(&self, document: &DocumentPath) -> Result<Session, GatewayError> {
        Self::send(
            self.client
                .post(self.url("/api/sessions"))
                .json(&PathBody { path: document }),
        )
        .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn delete_session(&self, session_id: &SessionId) -> Result<(), GatewayError> {
        Self::send_empty(
            self.client
                .delete(self.url(&format!("/api/sessions/{}", session_id))),
        )
        .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn list_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<StoredMessage>, GatewayError> {
        Self::send(
            self.client
                .get(self.url(&format!("/api/sessions/{}/messages", session_id))),
        )
        .await
    }

    #[instrument(level = "trace", skip(self, draft))]
    async fn create_message(
        &self,
        document: &DocumentPath,
        session_id: Option<&SessionId>,
        draft: &MessageDraft,
    ) -> Result<MessageReceipt, GatewayError> {
        Self::send(self.client.post(self.url("/api/messages")).json(&CreateMessageBody {
            path: document,
            session_id,
            draft,
        }))
        .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn list_comments(
        &self,
        document: &DocumentPath,
    ) -> Result<Vec<StoredComment>, GatewayError> {
        Self::send(
            self.client
                .get(self.url("/api/comments"))
                .query(&[("path", document.as_str())]),
        )
        .await
    }

    #[instrument(level = "trace", skip(self, draft))]
    async fn create_comment(
        &self,
        document: &DocumentPath,
        draft: &CommentDraft,
    ) -> Result<StoredComment, GatewayError> {
        Self::send(
            self.client
                .post(self.url("/api/comments"))
                .json(&CreateCommentBody { path: document, draft }),
        )
        .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn patch_comments(
        &self,
        ids: &[CommentId],
        patch: &CommentPatch,
    ) -> Result<Vec<StoredComment>, GatewayError> {
        Self::send(self.client.patch(self.url("/api/comments")).json(&PatchCommentsBody {
            ids,
            status: patch.status,
            request_id: patch.request_id.as_ref(),
        }))
        .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn delete_comment(&self, id: &CommentId) -> Result<(), GatewayError> {
        Self::send_empty(self.client.delete(self.url(&format!("/api/comments/{}", id)))).await
    }

    #[instrument(level = "trace", skip(self))]
    async fn list_changelog(
        &self,
        document: &DocumentPath,
    ) -> Result<Vec<ChangelogEntry>, GatewayError> {
        Self::send(
            self.client
                .get(self.url("/api/changelog"))
                .query(&[("path", document.as_str())]),
        )
        .await
    }

    #[instrument(level = "trace", skip(self, draft))]
    async fn create_changelog(
        &self,
        document: &DocumentPath,
        draft: &ChangelogDraft,
    ) -> Result<ChangelogEntry, GatewayError> {
        Self::send(
            self.client
                .post(self.url("/api/changelog"))
                .json(&CreateChangelogBody { path: document, draft }),
        )
        .await
    }

    #[instrument(level = "trace", skip(self, patch))]
    async fn patch_changelog(
        &self,
        id: &ChangelogId,
        patch: &ChangelogPatch,
    ) -> Result<ChangelogEntry, GatewayError> {
        Self::send(
            self.client
                .patch(self.url(&format!("/api/changelog/{}", id)))
                .json(patch),
        )
        .await
    }
}
