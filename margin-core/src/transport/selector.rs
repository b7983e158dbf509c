use std::sync::Arc;
use tracing::info;

use super::{AgentChannel, AgentTransport, HttpTransport, HttpTransportConfig, IpcTransport};
use crate::error::TransportError;

/// What the host can offer the engine
#[derive(Clone, Default)]
pub struct HostCapabilities {
    /// Direct agent channel, present only when the host can run the agent
    pub process_channel: Option<Arc<dyn AgentChannel>>,
}

impl HostCapabilities {
    pub fn with_channel(channel: Arc<dyn AgentChannel>) -> Self {
        Self {
            process_channel: Some(channel),
        }
    }
}

/// IPC when the host exposes a channel, HTTP polling otherwise. Decided once.
pub fn select_transport(
    capabilities: HostCapabilities,
    http: HttpTransportConfig,
) -> Result<Arc<dyn AgentTransport>, TransportError> {
    match capabilities.process_channel {
        Some(channel) => {
            info!("Using IPC agent transport");
            Ok(Arc::new(IpcTransport::new(channel)))
        }
        None => {
            info!(base_url = %http.base_url, "Using HTTP polling agent transport");
            Ok(Arc::new(HttpTransport::new(http)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelEvent, ChatCall, EditCall, TransportKind};
    use crate::ids::InvocationId;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    struct NullChannel(broadcast::Sender<ChannelEvent>);

    #[async_trait]
    impl AgentChannel for NullChannel {
        async fn send_chat(&self, _call: ChatCall) -> Result<(), TransportError> {
            Ok(())
        }
        async fn send_edit(&self, _call: EditCall) -> Result<(), TransportError> {
            Ok(())
        }
        async fn cancel(&self, _invocation: InvocationId) -> Result<(), TransportError> {
            Ok(())
        }
        fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
            self.0.subscribe()
        }
    }

    #[test]
    fn test_channel_selects_ipc() {
        let (tx, _) = broadcast::channel(1);
        let caps = HostCapabilities::with_channel(Arc::new(NullChannel(tx)));
        let transport =
            select_transport(caps, HttpTransportConfig::new("http://localhost:1")).unwrap();
        assert_eq!(transport.kind(), TransportKind::Ipc);
    }

    #[test]
    fn test_no_channel_selects_http() {
        let transport = select_transport(
            HostCapabilities::default(),
            HttpTransportConfig::new("http://localhost:1"),
        )
        .unwrap();
        assert_eq!(transport.kind(), TransportKind::Http);
    }
}
