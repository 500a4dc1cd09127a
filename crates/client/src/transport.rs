//! Outbound transport
//!
//! [`Connector`] opens a link to the server; [`Transport`] emits frames on it.
//! Inbound events arrive on the link's channel, which closes when the socket does.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use helpline_shared::events::{decode_server_event, ClientFrame, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use crate::error::{ClientError, ClientResult};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand a frame to the socket. Success means it was accepted locally, not delivered.
    async fn emit(&self, frame: &ClientFrame) -> ClientResult<()>;
}

/// An open connection
pub struct Link {
    pub transport: Arc<dyn Transport>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> ClientResult<Link>;
}

/// WebSocket connector for `ws://host/ws` style URLs
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> ClientResult<Link> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        tracing::info!(url = %self.url, "WebSocket connected");

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

        // Writer: ends when the transport is dropped or the socket fails
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: dropping inbound_tx tells the session the link is gone
        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                match msg {
                    WsMessage::Text(text) => match decode_server_event(text.as_str()) {
                        Ok(event) => {
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to parse server event"),
                    },
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            tracing::debug!("WebSocket reader finished");
        });

        Ok(Link {
            transport: Arc::new(WsTransport {
                outbound: outbound_tx,
            }),
            inbound: inbound_rx,
        })
    }
}

pub struct WsTransport {
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit(&self, frame: &ClientFrame) -> ClientResult<()> {
        let json = serde_json::to_string(frame)?;
        self.outbound.send(json).map_err(|_| ClientError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpline_shared::events::ClientEvent;

    #[tokio::test]
    async fn test_emit_fails_once_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = WsTransport { outbound: tx };
        let frame = ClientFrame::new(
            "r1",
            ClientEvent::Heartbeat {
                connection_id: "c1".into(),
            },
        );

        transport.emit(&frame).await.unwrap();
        drop(rx);
        assert!(matches!(transport.emit(&frame).await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = WsConnector::new("ws://127.0.0.1:1/ws");
        let err = connector.connect().await.err().unwrap();
        assert!(err.is_transient());
    }
}
