//! Polling transport for hosts without a direct agent channel
//!
//! `start` clears the server-side stream buffer, posts the request and spawns
//! a poller. Every tick fetches the buffer and the status independently; a
//! failed fetch is logged and retried on the next tick. The poller stops on a
//! terminal status or on cancel.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ActiveStreams, AgentRequest, AgentTransport, Increment, IncrementHandler, Invocation,
    Listeners, Terminal, TerminalHandler, TerminalSignal, TransportKind,
};
use crate::error::TransportError;
use crate::ids::{InvocationId, SessionId};
use crate::types::{DocumentPath, HistoryEntry};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub poll_interval: Duration,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    request_id: String,
    path: &'a DocumentPath,
    message: &'a str,
    session_id: Option<&'a SessionId>,
    context: Option<&'a str>,
    history: &'a [HistoryEntry],
    model: Option<&'a str>,
}

#[derive(Serialize)]
struct EditBody<'a> {
    request_id: String,
    path: &'a DocumentPath,
    instruction: &'a str,
    model: Option<&'a str>,
}

#[derive(Serialize)]
struct CancelBody<'a> {
    request_id: String,
    path: &'a DocumentPath,
}

#[derive(Debug, Deserialize)]
struct StreamBuffer {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AgentStatus {
    Pending,
    Complete,
    Error,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: AgentStatus,
    #[serde(default)]
    content: String,
    #[serde(default)]
    request_id: Option<String>,
}

pub struct HttpTransport {
    client: Client,
    config: HttpTransportConfig,
    listeners: Arc<Listeners>,
    active: Arc<ActiveStreams>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            listeners: Arc::new(Listeners::default()),
            active: Arc::new(ActiveStreams::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Failed to read error body".to_string());
        Err(TransportError::Rejected(format!("{}: {}", status, body)))
    }

    async fn reset_stream(&self, document: &DocumentPath) -> Result<(), TransportError> {
        let response = self
            .client
            .delete(self.url("/api/agent/stream"))
            .query(&[("path", document.as_str())])
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Self::check(response).await.map(|_| ())
    }

    async fn post_request(&self, invocation: &Invocation) -> Result<(), TransportError> {
        let request_id = invocation.id.to_string();
        let builder = match &invocation.request {
            AgentRequest::Chat {
                message,
                session_id,
                context,
                history,
                model,
            } => self.client.post(self.url("/api/agent/chat")).json(&ChatBody {
                request_id,
                path: &invocation.document,
                message,
                session_id: session_id.as_ref(),
                context: context.as_deref(),
                history,
                model: model.as_deref(),
            }),
            AgentRequest::Edit { instruction, model } => {
                self.client.post(self.url("/api/agent/edit")).json(&EditBody {
                    request_id,
                    path: &invocation.document,
                    instruction,
                    model: model.as_deref(),
                })
            }
        };
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        Self::check(response).await.map(|_| ())
    }

    fn spawn_poller(&self, document: DocumentPath, id: InvocationId, token: CancellationToken) {
        let poller = Poller {
            client: self.client.clone(),
            base_url: self.config.base_url.clone(),
            document,
        };
        let interval = self.config.poll_interval;
        let listeners = Arc::clone(&self.listeners);
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; wait a full interval before polling
            ticker.tick().await;
            let mut last_output = String::new();

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(invocation = %id, "HTTP poller stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let (stream, status) = tokio::join!(poller.fetch_stream(), poller.fetch_status());
                if token.is_cancelled() {
                    return;
                }

                match stream {
                    Ok(buffer) if !buffer.content.is_empty() && buffer.content != last_output => {
                        last_output = buffer.content.clone();
                        listeners.emit_increment(Increment {
                            document: poller.document.clone(),
                            invocation: id,
                            content: buffer.content,
                        });
                    }
                    Ok(_) => {}
                    Err(e) => warn!(invocation = %id, "Stream poll failed: {}", e),
                }

                let status = match status {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(invocation = %id, "Status poll failed: {}", e);
                        continue;
                    }
                };
                let expected = id.to_string();
                if status.request_id.as_deref().is_some_and(|r| r != expected) {
                    debug!(invocation = %id, request_id = ?status.request_id, "Status belongs to another request");
                    continue;
                }

                let signal = match status.status {
                    AgentStatus::Pending => continue,
                    AgentStatus::Complete => {
                        let content = if status.content.is_empty() {
                            last_output
                        } else {
                            status.content
                        };
                        TerminalSignal::Complete { content }
                    }
                    AgentStatus::Error => TerminalSignal::Error {
                        message: if status.content.is_empty() {
                            "agent failed".to_string()
                        } else {
                            status.content
                        },
                    },
                };

                active.finish(id);
                listeners.emit_terminal(Terminal {
                    document: poller.document,
                    invocation: id,
                    signal,
                });
                return;
            }
        });
    }
}

/// Per-invocation polling state owned by the poll task
struct Poller {
    client: Client,
    base_url: String,
    document: DocumentPath,
}

impl Poller {
    async fn fetch_stream(&self) -> Result<StreamBuffer, reqwest::Error> {
        self.client
            .get(format!("{}/api/agent/stream", self.base_url))
            .query(&[("path", self.document.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn fetch_status(&self) -> Result<StatusResponse, reqwest::Error> {
        self.client
            .get(format!("{}/api/agent/status", self.base_url))
            .query(&[("path", self.document.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn start(&self, invocation: Invocation) -> Result<(), TransportError> {
        self.reset_stream(&invocation.document).await?;
        self.post_request(&invocation).await?;

        let token = self.active.register(invocation.id);
        self.spawn_poller(invocation.document.clone(), invocation.id, token);
        debug!(invocation = %invocation.id, document = %invocation.document, "HTTP invocation started");
        Ok(())
    }

    fn on_increment(&self, handler: IncrementHandler) {
        self.listeners.add_increment(handler);
    }

    fn on_terminal(&self, handler: TerminalHandler) {
        self.listeners.add_terminal(handler);
    }

    async fn cancel(&self, document: &DocumentPath, invocation: InvocationId) {
        // Local polling stops before the server hears about it
        self.active.stop(invocation);

        let result = self
            .client
            .post(self.url("/api/agent/cancel"))
            .json(&CancelBody {
                request_id: invocation.to_string(),
                path: document,
            })
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(%document, %invocation, status = %response.status(), "Server-side cancel refused")
            }
            Ok(_) => {}
            Err(e) => warn!(%document, %invocation, "Server-side cancel failed: {}", e),
        }
    }
}
