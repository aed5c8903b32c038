// mux-test-utils: Shared test utilities for the RPC channel suites.
//
// Provides a raw WebSocket probe speaking bare protocol frames, used
// to exercise the server handshake gate and wire behavior beneath the
// client API.

use futures_util::{SinkExt, StreamExt};
use mux_protocol::Frame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A raw frame-level WebSocket client.
///
/// Unlike the real client it performs no handshake bookkeeping, no
/// task management and no reconnection, which makes it suitable for
/// asserting on the exact frames a server emits.
pub struct RawClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

/// Outcome of a raw connection attempt.
pub enum RawConnect {
    Open(RawClient),
    /// The server rejected the upgrade with this HTTP status.
    Rejected(u16),
    Failed(String),
}

impl RawClient {
    /// Connect without any frame exchange; the caller usually reads
    /// the `[CONNECT, serverId]` frame first.
    pub async fn connect(url: &str) -> RawConnect {
        use tokio_tungstenite::tungstenite::Error;
        match tokio_tungstenite::connect_async(url).await {
            Ok((ws_stream, _response)) => {
                let (write, read) = ws_stream.split();
                RawConnect::Open(RawClient { write, read })
            }
            Err(Error::Http(response)) => RawConnect::Rejected(response.status().as_u16()),
            Err(e) => RawConnect::Failed(e.to_string()),
        }
    }

    /// Connect and panic unless the server accepts.
    pub async fn connect_ok(url: &str) -> RawClient {
        match Self::connect(url).await {
            RawConnect::Open(client) => client,
            RawConnect::Rejected(status) => panic!("server rejected upgrade: HTTP {status}"),
            RawConnect::Failed(e) => panic!("connect failed: {e}"),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Text(frame.encode().into()))
            .await?;
        Ok(())
    }

    /// Send raw text (for malformed-frame scenarios).
    pub async fn send_text(&mut self, text: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write
            .send(Message::Text(text.to_owned().into()))
            .await?;
        Ok(())
    }

    /// Next protocol frame, skipping WebSocket control messages.
    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Frame::decode(&text)
                        .ok_or_else(|| format!("malformed frame: {text}").into());
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
