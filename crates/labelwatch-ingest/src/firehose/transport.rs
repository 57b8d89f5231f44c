//! Frame transports for the firehose subscription.
//!
//! The stream only needs "give me the next binary frame", so the transport
//! is a small trait. [`WebSocketConnector`] is the production implementation;
//! tests drive the stream with scripted in-memory transports.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::Result;

/// XRPC method of the repository event subscription.
pub const SUBSCRIBE_REPOS: &str = "com.atproto.sync.subscribeRepos";

/// An open subscription yielding raw binary frames.
#[async_trait]
pub trait FrameTransport: Send {
    /// Next binary frame, `None` once the remote has closed the subscription.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>>>;
}

/// Opens subscriptions, optionally resuming after a cursor.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, cursor: Option<i64>) -> Result<Box<dyn FrameTransport>>;
}

/// Build the subscription URL for a service and optional cursor.
///
/// `service` may be given with an `https://`/`http://` scheme, which is
/// mapped to `wss://`/`ws://`.
pub fn subscription_url(service: &str, cursor: Option<i64>) -> String {
    let base = service.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };

    match cursor {
        Some(seq) if seq >= 0 => format!("{base}/xrpc/{SUBSCRIBE_REPOS}?cursor={seq}"),
        _ => format!("{base}/xrpc/{SUBSCRIBE_REPOS}"),
    }
}

/// Connects to a firehose service over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    service: String,
}

impl WebSocketConnector {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, cursor: Option<i64>) -> Result<Box<dyn FrameTransport>> {
        let url = subscription_url(&self.service, cursor);
        tracing::info!("Connecting to firehose {}", url);
        let (socket, response) = connect_async(url.as_str()).await?;
        tracing::debug!("Firehose handshake status {}", response.status());
        Ok(Box::new(WebSocketTransport { socket }))
    }
}

struct WebSocketTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(frame)) => {
                    tracing::info!("Firehose closed by remote: {:?}", frame);
                    return None;
                }
                Ok(Message::Text(text)) => {
                    tracing::debug!("Ignoring text frame ({} bytes)", text.len());
                }
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
