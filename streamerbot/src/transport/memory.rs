use super::{Socket, Transport};

use futures::{
    SinkExt, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::{self, BoxFuture},
};
use serde_json::Value;
use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tungstenite::{
    Error as WsError, Message as WsMessage,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

#[derive(Debug, Default)]
struct Shared {
    refuse: AtomicBool,
    stall: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
}

/// Client side of an in-memory connection. Each `open` hands a
/// [`MemoryPeer`] to the paired [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: UnboundedSender<MemoryPeer>,
    shared: Arc<Shared>,
}

/// Server side: accepts the peers opened through the paired transport.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: UnboundedReceiver<MemoryPeer>,
}

pub fn pair() -> (MemoryTransport, MemoryListener) {
    let (tx, rx) = unbounded();
    let shared = Arc::new(Shared::default());
    (
        MemoryTransport {
            incoming: tx,
            shared,
        },
        MemoryListener { incoming: rx },
    )
}

fn refused() -> WsError {
    WsError::Io(io::Error::from(io::ErrorKind::ConnectionRefused))
}

impl Transport for MemoryTransport {
    fn open<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Socket, WsError>> {
        Box::pin(async move {
            if let Ok(mut attempts) = self.shared.attempts.lock() {
                attempts.push(Instant::now());
            }
            if self.shared.refuse.load(Ordering::SeqCst) {
                return Err(refused());
            }
            if self.shared.stall.load(Ordering::SeqCst) {
                future::pending::<()>().await;
            }
            let (to_server, from_client) = unbounded::<WsMessage>();
            let (to_client, from_server) = unbounded::<Result<WsMessage, WsError>>();
            let peer = MemoryPeer {
                tx: to_client,
                rx: from_client,
            };
            self.incoming.unbounded_send(peer).map_err(|_| refused())?;
            Ok(Socket {
                sink: Box::pin(to_server.sink_map_err(|_| WsError::ConnectionClosed)),
                stream: from_server.boxed(),
            })
        })
    }
}

impl MemoryListener {
    /// Waits for the next connection. `None` once every transport is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.next().await
    }
}

impl MemoryTransport {
    /// While set, `open` fails as if nothing were listening.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }
    /// While set, `open` never completes, like a host that drops packets.
    pub fn stall_connections(&self, stall: bool) {
        self.shared.stall.store(stall, Ordering::SeqCst);
    }
    /// When each `open` was attempted, refused ones included.
    pub fn attempts(&self) -> Vec<Instant> {
        self.shared
            .attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

/// The server end of one in-memory socket. Dropping it looks like an
/// abnormal closure to the client.
#[derive(Debug)]
pub struct MemoryPeer {
    tx: UnboundedSender<Result<WsMessage, WsError>>,
    rx: UnboundedReceiver<WsMessage>,
}

impl MemoryPeer {
    /// Returns false if the client side is gone.
    pub fn send(&self, message: WsMessage) -> bool {
        self.tx.unbounded_send(Ok(message)).is_ok()
    }
    pub fn send_json(&self, value: &Value) -> bool {
        self.send(WsMessage::text(value.to_string()))
    }
    /// Sends a close frame and stops sending.
    pub fn close(&self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.send(WsMessage::Close(Some(frame)));
        self.tx.close_channel();
    }
    /// Next raw frame from the client. A client close frame is echoed back
    /// before being returned, as a WebSocket server would.
    pub async fn recv(&mut self) -> Option<WsMessage> {
        let message = self.rx.next().await?;
        if let WsMessage::Close(frame) = &message {
            self.send(WsMessage::Close(frame.clone()));
            self.tx.close_channel();
        }
        Some(message)
    }
    /// Next text frame, parsed. `None` when the client closed or went away.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).ok(),
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
