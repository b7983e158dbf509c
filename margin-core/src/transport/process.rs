//! Agent channel backed by a child process speaking JSON lines
//!
//! Requests go to the child's stdin, one JSON object per line, tagged with
//! `type` (`chat`, `edit`, `cancel`). Every stdout line is decoded as a
//! [`ChannelEvent`]; anything else is logged and dropped.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::ipc::{AgentChannel, ChannelEvent, ChatCall, EditCall};
use crate::error::TransportError;
use crate::ids::InvocationId;

const EVENT_CAPACITY: usize = 256;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ChannelRequest<'a> {
    Chat(&'a ChatCall),
    Edit(&'a EditCall),
    Cancel { invocation: InvocationId },
}

pub struct ProcessChannel {
    stdin: tokio::sync::Mutex<ChildStdin>,
    events: broadcast::Sender<ChannelEvent>,
    in_flight: Arc<Mutex<HashSet<InvocationId>>>,
    // Held so the child is killed when the channel is dropped
    _child: Child,
}

impl ProcessChannel {
    /// Spawn `command_line` (program followed by whitespace-separated args).
    pub fn spawn(command_line: &str) -> Result<Self, TransportError> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| TransportError::Unavailable("agent command is empty".to_string()))?;
        let mut command = Command::new(program);
        command.args(parts);
        Self::spawn_command(command)
    }

    pub fn spawn_command(mut command: Command) -> Result<Self, TransportError> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Unavailable(format!("failed to spawn agent: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Unavailable("agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Unavailable("agent stdout unavailable".to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let in_flight = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(read_events(stdout, events.clone(), Arc::clone(&in_flight)));

        info!(pid = ?child.id(), "Agent process started");
        Ok(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            events,
            in_flight,
            _child: child,
        })
    }

    async fn write(&self, request: &ChannelRequest<'_>) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| TransportError::Protocol(format!("failed to encode request: {}", e)))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Unavailable(format!("agent stdin closed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Unavailable(format!("agent stdin closed: {}", e)))
    }

    async fn send_tracked(
        &self,
        invocation: InvocationId,
        request: &ChannelRequest<'_>,
    ) -> Result<(), TransportError> {
        self.track(invocation, true);
        let result = self.write(request).await;
        if result.is_err() {
            self.track(invocation, false);
        }
        result
    }

    fn track(&self, invocation: InvocationId, live: bool) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if live {
            in_flight.insert(invocation);
        } else {
            in_flight.remove(&invocation);
        }
    }
}

async fn read_events(
    stdout: ChildStdout,
    events: broadcast::Sender<ChannelEvent>,
    in_flight: Arc<Mutex<HashSet<InvocationId>>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some(event) = decode_event(&line) else {
                    continue;
                };
                if !matches!(event, ChannelEvent::Stream { .. }) {
                    in_flight
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .remove(&event.invocation());
                }
                // No subscribers is fine
                let _ = events.send(event);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read agent output: {}", e);
                break;
            }
        }
    }

    // Fail whatever the agent never finished
    let orphaned: Vec<InvocationId> = in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .drain()
        .collect();
    info!(orphaned = orphaned.len(), "Agent process exited");
    for invocation in orphaned {
        let _ = events.send(ChannelEvent::Error {
            invocation,
            message: "agent process exited".to_string(),
        });
    }
}

fn decode_event(line: &str) -> Option<ChannelEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("Ignoring agent output line ({}): {}", e, line);
            None
        }
    }
}

#[async_trait]
impl AgentChannel for ProcessChannel {
    async fn send_chat(&self, call: ChatCall) -> Result<(), TransportError> {
        self.send_tracked(call.invocation, &ChannelRequest::Chat(&call))
            .await
    }

    async fn send_edit(&self, call: EditCall) -> Result<(), TransportError> {
        self.send_tracked(call.invocation, &ChannelRequest::Edit(&call))
            .await
    }

    async fn cancel(&self, invocation: InvocationId) -> Result<(), TransportError> {
        self.track(invocation, false);
        self.write(&ChannelRequest::Cancel { invocation }).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }
}
