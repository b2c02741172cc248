//! The websocket transport.
//!
//! Relays speak json text frames over a websocket.  [`WsTransport`] dials the relay url
//! directly, `wss` relays are connected using TLS with the webpki roots.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures_lite::Stream;
use futures_util::{
    Sink, StreamExt,
    stream::{SplitSink, SplitStream},
};
use murmur_base::RelayUrl;
use tokio::net::TcpStream;
use tokio_websockets::{ClientBuilder, MaybeTlsStream, Message, WebSocketStream};
use tracing::{debug, trace, warn};

use crate::{
    protos::message::{ClientMessage, RelayMessage},
    transport::{BoxFuture, Conn, Transport, TransportError},
};

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A [`Transport`] connecting to relays over websockets.
#[derive(Debug, Clone, Default)]
pub struct WsTransport {
    _private: (),
}

impl WsTransport {
    /// Creates a new websocket transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WsTransport {
    fn connect(&self, url: RelayUrl) -> BoxFuture<Result<Conn, TransportError>> {
        Box::pin(async move {
            debug!(%url, "dialing relay by websocket");
            let builder = ClientBuilder::new()
                .uri(url.as_str())
                .map_err(|err| TransportError::Dial { source: err.into() })?;
            let (ws, _response) = builder
                .connect()
                .await
                .map_err(|err| TransportError::Dial { source: err.into() })?;
            let (sink, stream) = ws.split();
            Ok(Conn::new(WsReader(stream), WsWriter(sink)))
        })
    }
}

/// Receiving half of a websocket connection, decoding json text frames.
struct WsReader(SplitStream<WebSocket>);

/// Sending half of a websocket connection, encoding json text frames.
struct WsWriter(SplitSink<WebSocket, Message>);

impl Stream for WsReader {
    type Item = Result<RelayMessage, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let msg = match Pin::new(&mut self.0).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => msg,
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Some(Err(TransportError::Recv { source: err.into() })));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            };
            if msg.is_close() {
                trace!("relay closed the websocket");
                return Poll::Ready(None);
            }
            let Some(text) = msg.as_text() else {
                // Pings are answered by the websocket implementation, binary frames are not
                // part of the protocol.
                if !msg.is_ping() && !msg.is_pong() {
                    warn!("skipping non-text websocket message");
                }
                continue;
            };
            let res = RelayMessage::from_json(text)
                .map_err(|source| TransportError::Protocol { source });
            return Poll::Ready(Some(res));
        }
    }
}

impl Sink<ClientMessage> for WsWriter {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0)
            .poll_ready(cx)
            .map_err(|err| TransportError::Send { source: err.into() })
    }

    fn start_send(mut self: Pin<&mut Self>, item: ClientMessage) -> Result<(), Self::Error> {
        Pin::new(&mut self.0)
            .start_send(Message::text(item.to_json()))
            .map_err(|err| TransportError::Send { source: err.into() })
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0)
            .poll_flush(cx)
            .map_err(|err| TransportError::Send { source: err.into() })
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0)
            .poll_close(cx)
            .map_err(|err| TransportError::Send { source: err.into() })
    }
}
