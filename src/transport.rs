//! WebSocket Transport Layer
//!
//! Single responsibility: Dial the device RPC endpoint and hand out the two
//! halves of the socket. No knowledge of correlation, retries, or auth.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use std::time::Duration;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{http::Request, protocol::Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

use crate::error::{Result, RpcError};

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// A connected WebSocket transport.
///
/// Only constructed by a successful [`Transport::connect`].
pub struct Transport {
    sink: WsSink,
    stream: WsStream,
}

impl Transport {
    /// Dial `url`, giving up after `dial_timeout`.
    pub async fn connect(url: &str, dial_timeout: Duration) -> Result<Self> {
        debug!(url = %url, "Dialing device");

        let request = Request::builder()
            .uri(url)
            .header("Host", extract_host(url))
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .body(())
            .map_err(|e| RpcError::Transport(format!("Failed to build request: {}", e)))?;

        let (ws, _) = tokio::time::timeout(
            dial_timeout,
            connect_async_with_config(request, None, false),
        )
        .await
        .map_err(|_| RpcError::Transport(format!("Timeout dialing {}", url)))?
        .map_err(|e| RpcError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Self { sink, stream })
    }

    /// Split into separate sink and stream for the egress and ingress tasks.
    pub fn split(self) -> (WsSink, WsStream) {
        (self.sink, self.stream)
    }
}

/// Extract host from URL for Host header
fn extract_host(url: &str) -> &str {
    url.split("//")
        .nth(1)
        .and_then(|s| s.split('/').next())
        .unwrap_or("localhost")
}
