//! Frame transport: the pluggable link between the connection and the
//! collaboration server.
//!
//! The server speaks a STOMP-style frame protocol over WebSocket: every
//! frame is one JSON text message carrying a command, a destination, and
//! an opaque body. [`WsTransport`] bridges a tokio-tungstenite socket into
//! an mpsc-backed [`FrameLink`]; [`MemoryTransport`] provides the same
//! link shape in-process so tests can play the server side directly.
//!
//! A [`FrameLink`] closing (the `incoming` receiver yielding `None`)
//! means the transport died; the connection layer owns what happens next.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::event::CollabError;

/// Frame commands, a minimal STOMP subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameCommand {
    /// Client → server: open a session; body carries the bearer token.
    Connect,
    /// Server → client: handshake accepted.
    Connected,
    /// Server → client: handshake or session error; body carries a reason.
    Error,
    /// Client → server: subscribe to a destination.
    Subscribe,
    /// Client → server: drop a subscription.
    Unsubscribe,
    /// Client → server: publish a body to a destination.
    Send,
    /// Server → client: a message delivered on a subscribed destination.
    Message,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub command: FrameCommand,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub body: String,
}

impl Frame {
    pub fn connect(token: &str) -> Self {
        Self {
            command: FrameCommand::Connect,
            destination: String::new(),
            body: token.to_owned(),
        }
    }

    pub fn connected() -> Self {
        Self {
            command: FrameCommand::Connected,
            destination: String::new(),
            body: String::new(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            command: FrameCommand::Error,
            destination: String::new(),
            body: reason.into(),
        }
    }

    pub fn subscribe(destination: impl Into<String>) -> Self {
        Self {
            command: FrameCommand::Subscribe,
            destination: destination.into(),
            body: String::new(),
        }
    }

    pub fn unsubscribe(destination: impl Into<String>) -> Self {
        Self {
            command: FrameCommand::Unsubscribe,
            destination: destination.into(),
            body: String::new(),
        }
    }

    pub fn send(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            command: FrameCommand::Send,
            destination: destination.into(),
            body: body.into(),
        }
    }

    pub fn message(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            command: FrameCommand::Message,
            destination: destination.into(),
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Result<String, CollabError> {
        serde_json::to_string(self).map_err(|e| CollabError::Malformed(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, CollabError> {
        serde_json::from_str(text).map_err(|e| CollabError::Malformed(e.to_string()))
    }
}

/// A live bidirectional frame pipe.
///
/// Dropping `outgoing` (or the peer dropping its side) closes the link;
/// `incoming` then drains and yields `None`.
pub struct FrameLink {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
}

/// The transport seam: anything that can open a [`FrameLink`] to a server.
pub trait FrameTransport: Send + Sync + 'static {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameLink, CollabError>>;
}

/// Channel capacity for the socket bridge tasks.
const LINK_CAPACITY: usize = 256;

/// WebSocket transport over tokio-tungstenite.
///
/// `open` spawns a writer task (drains outgoing frames into the socket)
/// and a reader task (decodes text messages into inbound frames). Either
/// task exiting tears the link down: the reader dropping its sender is
/// what the connection observes as a transport close.
pub struct WsTransport;

impl FrameTransport for WsTransport {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameLink, CollabError>> {
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| CollabError::Protocol(e.to_string()))?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Frame>(LINK_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<Frame>(LINK_CAPACITY);

            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!("dropping unencodable frame: {e}");
                            continue;
                        }
                    };
                    if ws_writer
                        .send(tokio_tungstenite::tungstenite::Message::Text(text.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                            match Frame::decode(text.as_str()) {
                                Ok(frame) => {
                                    if in_tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("dropping undecodable frame: {e}"),
                            }
                        }
                        Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
                // in_tx drops here; the connection sees the link close.
            });

            Ok(FrameLink {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory transport for tests
// ───────────────────────────────────────────────────────────────────

/// The server side of one in-memory connection.
pub struct ServerEnd {
    /// Frames the client sent.
    pub from_client: mpsc::Receiver<Frame>,
    /// Sender delivering frames to the client. Dropping it simulates a
    /// transport close.
    pub to_client: mpsc::Sender<Frame>,
}

/// In-memory [`FrameTransport`]: every `open` call hands the matching
/// [`ServerEnd`] to the paired [`MemoryServer`].
pub struct MemoryTransport {
    accepts: mpsc::Sender<ServerEnd>,
}

/// Accept side of a [`MemoryTransport`] pair.
pub struct MemoryServer {
    accepts: mpsc::Receiver<ServerEnd>,
}

impl MemoryServer {
    /// Wait for the next client connection attempt.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accepts.recv().await
    }
}

/// Create a connected transport/server pair.
pub fn memory_pair() -> (MemoryTransport, MemoryServer) {
    let (accepts_tx, accepts_rx) = mpsc::channel(8);
    (
        MemoryTransport { accepts: accepts_tx },
        MemoryServer { accepts: accepts_rx },
    )
}

impl FrameTransport for MemoryTransport {
    fn open<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<FrameLink, CollabError>> {
        Box::pin(async move {
            let (c2s_tx, c2s_rx) = mpsc::channel(LINK_CAPACITY);
            let (s2c_tx, s2c_rx) = mpsc::channel(LINK_CAPACITY);
            self.accepts
                .send(ServerEnd {
                    from_client: c2s_rx,
                    to_client: s2c_tx,
                })
                .await
                .map_err(|_| CollabError::Protocol("no server accepting connections".into()))?;
            Ok(FrameLink {
                outgoing: c2s_tx,
                incoming: s2c_rx,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::send("/app/diagram/abc/event", r#"{"type":"TABLE_CREATED"}"#);
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_frame_command_wire_strings() {
        let frame = Frame::subscribe("/topic/x");
        let json: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["command"], "SUBSCRIBE");

        let frame = Frame::connect("tok");
        let json: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["command"], "CONNECT");
        assert_eq!(json["body"], "tok");
    }

    #[test]
    fn test_frame_decode_defaults() {
        // destination/body optional on the wire
        let frame = Frame::decode(r#"{"command":"CONNECTED"}"#).unwrap();
        assert_eq!(frame.command, FrameCommand::Connected);
        assert!(frame.destination.is_empty());
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_frame_decode_garbage() {
        assert!(Frame::decode("nope").is_err());
        assert!(Frame::decode(r#"{"command":"NOT_A_COMMAND"}"#).is_err());
    }

    #[tokio::test]
    async fn test_memory_transport_pairs_endpoints() {
        let (transport, mut server) = memory_pair();

        let mut link = transport.open("mem://test").await.unwrap();
        let mut end = server.accept().await.unwrap();

        link.outgoing.send(Frame::connect("token")).await.unwrap();
        let received = end.from_client.recv().await.unwrap();
        assert_eq!(received.command, FrameCommand::Connect);

        end.to_client.send(Frame::connected()).await.unwrap();
        let received = link.incoming.recv().await.unwrap();
        assert_eq!(received.command, FrameCommand::Connected);
    }

    #[tokio::test]
    async fn test_memory_transport_close_propagates() {
        let (transport, mut server) = memory_pair();
        let mut link = transport.open("mem://test").await.unwrap();
        let end = server.accept().await.unwrap();

        drop(end); // server goes away
        assert!(link.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_without_server_fails() {
        let (transport, server) = memory_pair();
        drop(server);
        let result = transport.open("mem://test").await;
        assert!(matches!(result, Err(CollabError::Protocol(_))));
    }
}
