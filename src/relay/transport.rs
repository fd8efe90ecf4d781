//! Abstracts the outbound relay WebSocket so [`super::connection::Connection`]
//! is testable without a real network. `ewebsock` is callback/poll-based,
//! built for a redraw-loop UI; `tokio-tungstenite` is the async-native
//! equivalent used here for persistent outbound sockets run from a plain
//! tokio runtime. The sink and stream halves are returned separately
//! (mirroring `WebSocketStream::split`) so a writer can hold the sink behind
//! a short-lived lock while a dedicated reader task owns the stream outright.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("send failed: {0}")]
    Send(String),
}

#[async_trait]
pub trait RelaySink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait RelayStream: Send {
    /// `None` once the peer has closed the connection.
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>>;
}

/// Dials new sockets. A trait so tests can substitute an in-memory relay.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn RelaySink>, Box<dyn RelayStream>), TransportError>;
}

pub struct TungsteniteTransport;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[async_trait]
impl RelayTransport for TungsteniteTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn RelaySink>, Box<dyn RelayStream>), TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        let (sink, stream): (
            futures_util::stream::SplitSink<WsStream, WsMessage>,
            futures_util::stream::SplitStream<WsStream>,
        ) = stream.split();
        Ok((
            Box::new(TungsteniteSink { sink }),
            Box::new(TungsteniteStream { stream }),
        ))
    }
}

struct TungsteniteSink {
    sink: futures_util::stream::SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl RelaySink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

struct TungsteniteStream {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl RelayStream for TungsteniteStream {
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            return match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => Some(Ok(text.to_string())),
                Ok(WsMessage::Close(_)) => None,
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Binary(_)) => {
                    continue
                }
                Ok(WsMessage::Frame(_)) => continue,
                Err(e) => Some(Err(TransportError::Send(e.to_string()))),
            };
        }
    }
}
