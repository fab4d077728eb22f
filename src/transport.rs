//! Signaling transport: one persistent socket per session room.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::signaling::{encode_outbound, parse_inbound, InboundFrame, OutboundFrame};

/// What the transport delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(InboundFrame),
    /// The connection is gone. Sent at most once, always last.
    Closed { reason: String },
}

/// An open room connection.
pub struct TransportLink {
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    inbound: mpsc::Receiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl TransportLink {
    /// Wrap a pair of channels. Connectors that are not socket based (and tests)
    /// build links with this.
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound: Some(outbound),
            inbound,
            reader: None,
        }
    }

    fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Queue a frame. Fire-and-forget: there is no acknowledgement.
    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        let tx = self.outbound.as_ref().ok_or(Error::TransportClosed)?;
        tx.send(frame).map_err(|_| Error::TransportClosed)
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    pub fn is_open(&self) -> bool {
        self.outbound
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Close the connection. Queued frames are still flushed by the writer.
    pub fn close(&mut self) {
        self.outbound.take();
        self.inbound.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for TransportLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens room connections.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Connect to `room_id` and authenticate with `token`. The auth frame is the
    /// first frame sent on the new connection.
    async fn connect(&self, room_id: &str, token: &str) -> Result<TransportLink>;
}

/// WebSocket room URL for `room_id` under `base_url`.
pub fn room_url(base_url: &str, room_id: &str) -> String {
    format!(
        "{}/ws/sessions/{}/",
        base_url.trim_end_matches('/'),
        urlencoding::encode(room_id)
    )
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    inbound_capacity: usize,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            inbound_capacity: 256,
        }
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, room_id: &str, token: &str) -> Result<TransportLink> {
        let url = room_url(&self.base_url, room_id);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::TransportConnect(format!("{}: {}", url, e)))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let auth = encode_outbound(&OutboundFrame::Auth {
            token: token.to_string(),
        })?;
        ws_write
            .send(Message::Text(auth.into()))
            .await
            .map_err(|e| Error::TransportConnect(format!("auth frame not sent: {}", e)))?;
        info!("Signaling connected to {}", url);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(self.inbound_capacity);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match encode_outbound(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode signaling frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                    debug!("Signaling write failed: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
            debug!("Signaling writer finished");
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                let frame = match ws_read.next().await {
                    Some(Ok(Message::Text(text))) => parse_inbound(&text),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => parse_inbound(text),
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary signaling frame");
                            None
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by server: {}", f.reason))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => None,
                    Some(Err(e)) => break format!("socket error: {}", e),
                    None => break "socket ended".to_string(),
                };
                if let Some(frame) = frame {
                    if in_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                        return;
                    }
                }
            };
            info!("Signaling connection closed: {}", reason);
            let _ = in_tx.send(TransportEvent::Closed { reason }).await;
        });

        Ok(TransportLink::new(out_tx, in_rx).with_reader(reader))
    }
}
