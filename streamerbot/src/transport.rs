//! The socket the client talks through.
//!
//! [`WsTransport`] opens real WebSocket connections. [`memory`] provides an
//! in-process pair whose other end is driven by hand, which is how the client
//! is tested and how it can be embedded next to a fake server.

pub mod memory;

use futures::{Sink, Stream, StreamExt, future::BoxFuture, stream::BoxStream};
use std::pin::Pin;
use tungstenite::{Error as WsError, Message as WsMessage};

pub type BoxSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;

/// Both halves of an open socket.
pub struct Socket {
    pub sink: BoxSink,
    pub stream: BoxStream<'static, Result<WsMessage, WsError>>,
}

impl Socket {
    /// Splits a combined sink/stream, such as an async-tungstenite
    /// `WebSocketStream`.
    pub fn new<S>(ws: S) -> Self
    where
        S: Sink<WsMessage, Error = WsError>
            + Stream<Item = Result<WsMessage, WsError>>
            + Send
            + 'static,
    {
        let (sink, stream) = ws.split();
        Socket {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

/// Something that can open sockets to a URL.
pub trait Transport: Send + Sync + 'static {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Socket, WsError>>;
}

/// async-tungstenite on the tokio runtime. `wss://` needs the `tls` feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl Transport for WsTransport {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Socket, WsError>> {
        Box::pin(async move {
            let (ws, _response) = async_tungstenite::tokio::connect_async(url).await?;
            Ok(Socket::new(ws))
        })
    }
}
