//! Transport capability and the default tokio-tungstenite implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::protocol::{ProtocolMessage, SUBPROTOCOL, decode_msg, encode_msg};
use crate::types::{BoxError, Error};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by a [`Transport`].
///
/// The run loop keys its recovery policy off these variants: a dropped
/// stream triggers a reset, a normal closure ends the loop cleanly, and
/// everything else is handed to the caller-supplied error policy.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The inbound stream ended without a close handshake.
    #[error("stream ended without a close frame")]
    StreamEnd,

    /// The peer completed a normal close handshake.
    #[error("connection closed")]
    NormalClosure,

    /// The peer closed the connection with a non-normal status.
    #[error("connection closed abnormally: {0}")]
    AbnormalClosure(String),

    /// The operation did not finish within the configured bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// An inbound message exceeded the configured size cap.
    #[error("inbound message of {size} bytes exceeds the {limit} byte cap")]
    MessageTooLarge { size: usize, limit: usize },

    /// Frame encoding or decoding failed.
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Any other channel-level failure.
    #[error("websocket error: {0}")]
    Other(BoxError),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                TransportError::NormalClosure
            }
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                TransportError::StreamEnd
            }
            other => TransportError::Other(Box::new(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// Abstract bidirectional message channel the engine is built against.
///
/// `send` may be called from registration and cancellation tasks while the
/// run loop is blocked in `receive`; implementations must serialize access
/// to the underlying socket internally. Only the run loop calls `receive`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame, bounded by the write timeout.
    async fn send(&self, msg: &ProtocolMessage) -> Result<(), TransportError>;
    /// Receive the next frame, bounded by the read timeout.
    async fn receive(&self) -> Result<ProtocolMessage, TransportError>;
    /// Close the underlying channel.
    async fn close(&self) -> Result<(), TransportError>;
    /// Bound the maximum size of an inbound message.
    fn set_read_limit(&self, limit: usize);
}

pub type BoxTransport = Arc<dyn Transport>;

/// Engine configuration handed to a [`TransportFactory`] on every
/// (re)connect attempt.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_size: usize,
}

/// A future resolving to a freshly connected transport.
pub type TransportFuture = Pin<Box<dyn Future<Output = Result<BoxTransport, Error>> + Send>>;

/// Injectable connection factory, so tests can substitute fake channels.
pub type TransportFactory = Box<dyn Fn(TransportConfig) -> TransportFuture + Send + Sync>;

pub(crate) fn default_transport_factory() -> TransportFactory {
    Box::new(|config| {
        Box::pin(async move {
            let transport = WsTransport::connect(config).await?;
            Ok(Arc::new(transport) as BoxTransport)
        })
    })
}

// ---------------------------------------------------------------------------
// Endpoint URL handling
// ---------------------------------------------------------------------------

/// Normalize an endpoint URL to a WebSocket scheme, so callers may pass the
/// HTTP form of their GraphQL endpoint.
pub(crate) fn resolve_ws_url(raw: &str) -> Result<url::Url, Error> {
    let mut url = url::Url::parse(raw)?;
    let scheme = url.scheme().to_string();
    let replacement = match scheme.as_str() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        _ => return Err(Error::UnsupportedScheme(scheme)),
    };
    if let Some(ws_scheme) = replacement
        && url.set_scheme(ws_scheme).is_err()
    {
        return Err(Error::UnsupportedScheme(scheme));
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// Default implementation
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

/// Default [`Transport`] over tokio-tungstenite.
pub struct WsTransport {
    writer: tokio::sync::Mutex<WsWrite>,
    reader: tokio::sync::Mutex<WsRead>,
    read_limit: AtomicUsize,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl WsTransport {
    /// Dial the endpoint and perform the WebSocket upgrade, offering the
    /// `graphql-ws` subprotocol.
    pub async fn connect(config: TransportConfig) -> Result<Self, Error> {
        let url = resolve_ws_url(&config.url)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(TransportError::from)?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );
        let (ws, _response) = tokio::time::timeout(
            config.write_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.write_timeout))?
        .map_err(TransportError::from)?;
        let (writer, reader) = ws.split();
        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            reader: tokio::sync::Mutex::new(reader),
            read_limit: AtomicUsize::new(config.max_message_size),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        })
    }

    fn check_limit(&self, size: usize) -> Result<(), TransportError> {
        let limit = self.read_limit.load(Ordering::Relaxed);
        if limit > 0 && size > limit {
            return Err(TransportError::MessageTooLarge { size, limit });
        }
        Ok(())
    }
}

fn closure_error(frame: Option<tungstenite::protocol::CloseFrame>) -> TransportError {
    match frame {
        // An empty close frame carries no status; treat it as normal closure.
        None => TransportError::NormalClosure,
        Some(f) if f.code == CloseCode::Normal => TransportError::NormalClosure,
        Some(f) => TransportError::AbnormalClosure(format!(
            "close code {}: {}",
            u16::from(f.code),
            f.reason.as_str()
        )),
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, msg: &ProtocolMessage) -> Result<(), TransportError> {
        let text = encode_msg(msg)?;
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(
            self.write_timeout,
            writer.send(tungstenite::Message::Text(text.into())),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.write_timeout))?
        .map_err(TransportError::from)
    }

    async fn receive(&self) -> Result<ProtocolMessage, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            let frame = tokio::time::timeout(self.read_timeout, reader.next())
                .await
                .map_err(|_| TransportError::Timeout(self.read_timeout))?;
            match frame {
                None => return Err(TransportError::StreamEnd),
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(tungstenite::Message::Text(text))) => {
                    self.check_limit(text.len())?;
                    return Ok(decode_msg(text.as_str())?);
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    self.check_limit(data.len())?;
                    return Ok(serde_json::from_slice(&data)?);
                }
                Some(Ok(tungstenite::Message::Close(frame))) => return Err(closure_error(frame)),
                // Ping/pong frames are handled by tungstenite itself.
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.close().await.map_err(TransportError::from)
    }

    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_ws_url_normalizes_http_schemes() {
        assert_eq!(
            resolve_ws_url("http://localhost:8080/graphql").unwrap().as_str(),
            "ws://localhost:8080/graphql"
        );
        assert_eq!(
            resolve_ws_url("https://api.example.com/graphql").unwrap().as_str(),
            "wss://api.example.com/graphql"
        );
    }

    #[test]
    fn resolve_ws_url_keeps_ws_schemes() {
        assert_eq!(
            resolve_ws_url("ws://localhost:8080/graphql").unwrap().as_str(),
            "ws://localhost:8080/graphql"
        );
        assert_eq!(
            resolve_ws_url("wss://api.example.com/graphql").unwrap().as_str(),
            "wss://api.example.com/graphql"
        );
    }

    #[test]
    fn resolve_ws_url_rejects_other_schemes() {
        assert!(matches!(
            resolve_ws_url("ftp://example.com"),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!(resolve_ws_url("not a url"), Err(Error::Url(_))));
    }

    #[test]
    fn closure_error_distinguishes_normal_from_abnormal() {
        assert!(matches!(closure_error(None), TransportError::NormalClosure));
        let normal = tungstenite::protocol::CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert!(matches!(
            closure_error(Some(normal)),
            TransportError::NormalClosure
        ));
        let away = tungstenite::protocol::CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".into(),
        };
        assert!(matches!(
            closure_error(Some(away)),
            TransportError::AbnormalClosure(_)
        ));
    }
}
