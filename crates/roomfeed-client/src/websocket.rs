//! WebSocket transport.
//!
//! Connects to `{base}/ws/chat/{room}/` and carries frames as binary
//! messages only; text messages are ignored. One spawned task per link bridges the socket and the link
//! channels; dropping the [`TransportLink`] closes the socket.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use roomfeed_core::DisconnectReason;
use roomfeed_proto::RoomId;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{self, Message},
};

use crate::transport::{LinkEvent, LiveTransport, TransportError, TransportLink};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket implementation of [`LiveTransport`].
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    base_url: String,
}

impl WebSocketTransport {
    /// `base_url` is the server root, e.g. `ws://localhost:8000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }

    /// Socket URL for a room.
    pub fn room_url(&self, room_id: &RoomId) -> String {
        format!("{}/ws/chat/{}/", self.base_url.trim_end_matches('/'), room_id)
    }
}

#[async_trait]
impl LiveTransport for WebSocketTransport {
    async fn connect(&self, room_id: &RoomId) -> Result<TransportLink, TransportError> {
        let url = self.room_url(room_id);
        tracing::debug!(%url, "Opening websocket");

        let (socket, _response) =
            tokio_tungstenite::connect_async(url.as_str()).await.map_err(|e| match e {
                tungstenite::Error::Http(response) => {
                    TransportError::Rejected(format!("status {}", response.status()))
                },
                tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
                other => TransportError::Connection(other.to_string()),
            })?;

        let (link, outbound_rx, inbound_tx) = TransportLink::channel();
        tokio::spawn(run_link(socket, outbound_rx, inbound_tx));
        Ok(link)
    }
}

/// Bridge the socket and the link channels until either side goes away.
async fn run_link(
    socket: Socket,
    mut outbound: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<LinkEvent>,
) {
    let (mut writer, mut reader) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) = writer.send(Message::Binary(bytes)).await {
                        tracing::warn!(error = %e, "Websocket write failed");
                        let _ = inbound.send(LinkEvent::Closed(DisconnectReason::NetworkError)).await;
                        break;
                    }
                },
                None => {
                    // Link dropped by the client
                    let _ = writer.close().await;
                    break;
                },
            },
            incoming = reader.next() => {
                let Some(event) = classify(incoming) else { continue };

                let closed = matches!(event, LinkEvent::Closed(_));
                if inbound.send(event).await.is_err() || closed {
                    break;
                }
            },
        }
    }
}

/// Map a socket read to a link event. `None` means nothing to forward.
///
/// Only binary messages carry frames. Text and control messages are skipped.
fn classify(incoming: Option<Result<Message, tungstenite::Error>>) -> Option<LinkEvent> {
    match incoming {
        Some(Ok(Message::Binary(bytes))) => Some(LinkEvent::Frame(bytes)),
        Some(Ok(Message::Text(text))) => {
            tracing::debug!(len = text.len(), "Skipping text message");
            None
        },
        Some(Ok(Message::Close(_))) | None => Some(LinkEvent::Closed(DisconnectReason::RemoteClose)),
        Some(Ok(_)) => None,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "Websocket read failed");
            Some(LinkEvent::Closed(DisconnectReason::NetworkError))
        },
    }
}
