//! The transport capability: how a connection to a relay is established.
//!
//! A [`Transport`] dials a relay and returns a [`Conn`], a [`Stream`] of
//! [`RelayMessage`]s and a [`Sink`] of [`ClientMessage`]s.  The connection pool is the only
//! consumer, it does not care whether the messages travel over a websocket or stay in
//! memory, see [`crate::test_utils::MemoryRelay`].

use std::{fmt, pin::Pin, sync::Arc};

use futures_lite::Stream;
use futures_util::Sink;
use murmur_base::RelayUrl;
use snafu::Snafu;

use crate::protos::message::{ClientMessage, ProtocolError, RelayMessage};

/// A boxed future, as returned by [`Transport::connect`].
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// The receiving half of a [`Conn`].
pub type ConnStream = Pin<Box<dyn Stream<Item = Result<RelayMessage, TransportError>> + Send>>;

/// The sending half of a [`Conn`].
pub type ConnSink = Pin<Box<dyn Sink<ClientMessage, Error = TransportError> + Send>>;

/// Errors of a relay transport.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("failed to connect to relay"))]
    Dial {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("relay is unreachable"))]
    Unreachable {},
    #[snafu(display("failed to send to relay"))]
    Send {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("failed to receive from relay"))]
    Recv {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(display("relay sent an invalid message"))]
    Protocol { source: ProtocolError },
    #[snafu(display("connection closed"))]
    Closed {},
}

/// An established connection to a relay.
pub struct Conn {
    stream: ConnStream,
    sink: ConnSink,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

impl Conn {
    /// Creates a connection from its two halves.
    pub fn new(
        stream: impl Stream<Item = Result<RelayMessage, TransportError>> + Send + 'static,
        sink: impl Sink<ClientMessage, Error = TransportError> + Send + 'static,
    ) -> Self {
        Self {
            stream: Box::pin(stream),
            sink: Box::pin(sink),
        }
    }

    /// Splits the connection into its receiving and sending halves.
    pub fn split(self) -> (ConnStream, ConnSink) {
        (self.stream, self.sink)
    }
}

/// Dials relays.
///
/// Implementations must be cheap to call repeatedly: the pool dials again, with
/// exponential backoff, whenever a connection is lost.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Connects to the relay at `url`.
    fn connect(&self, url: RelayUrl) -> BoxFuture<Result<Conn, TransportError>>;
}

impl<T: Transport> Transport for Arc<T> {
    fn connect(&self, url: RelayUrl) -> BoxFuture<Result<Conn, TransportError>> {
        self.as_ref().connect(url)
    }
}

impl<T: Transport> Transport for Box<T> {
    fn connect(&self, url: RelayUrl) -> BoxFuture<Result<Conn, TransportError>> {
        self.as_ref().connect(url)
    }
}
