//! The connection state machine and everything hanging off one socket.
//!
//! Each open socket gets a reader task and a writer task. The reader handles
//! frames strictly in arrival order, so user callbacks for one message finish
//! before the next message is looked at. Every socket owns a
//! [`CancellationToken`]; per-request waits use child tokens of it, so
//! losing the socket cancels everything that was waiting on it.

use crate::{
    auth::{AuthStatus, authentication_secret},
    catalog::EventCatalog,
    correlator::PendingRequests,
    dispatch::{self, Callback, ListenerId, Listeners},
    error::{Error, Result, close_reason},
    handlers::EventHandlers,
    message::{
        Event, EventEnvelope, Hello, InstanceInfo, IntoWsMessageJson, Request, Response,
        ServerMessage, WsMessageExt, hello, kind,
    },
    options::ClientOptions,
    subscription::{EventPattern, SubscriptionSet, SubscriptionSpec},
    transport::{BoxSink, Transport, WsTransport},
};

use futures::{SinkExt, StreamExt, stream::BoxStream};
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tungstenite::{
    Error as WsError, Message as WsMessage,
    protocol::{CloseFrame, frame::coding::CloseCode},
};

const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Authenticating,
    Subscribing,
    Ready,
    /// Waiting out the backoff between automatic reconnect attempts.
    Reconnecting,
}

struct SocketHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<WsMessage>,
    /// Lifetime of this socket. Parent of every per-request token.
    token: CancellationToken,
    /// Cancelled by the reader once the stream has ended.
    finished: CancellationToken,
}

impl SocketHandle {
    fn send_close(&self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: String::new().into(),
        };
        let _ = self.outbound.send(WsMessage::Close(Some(frame)));
    }
    /// Closes without waiting for the other side.
    fn abandon(self) {
        self.send_close(NORMAL_CLOSURE);
        self.token.cancel();
    }
}

#[derive(Default)]
struct Session {
    state: ConnectionState,
    /// Bumped on every connect attempt and every explicit close, so work
    /// belonging to an older socket can tell it has been superseded.
    generation: u64,
    socket: Option<SocketHandle>,
    info: Option<InstanceInfo>,
    auth: AuthStatus,
    retried: u32,
    explicitly_closed: bool,
    reconnect: Option<CancellationToken>,
    subscriptions: SubscriptionSet,
    catalog: Option<EventCatalog>,
    listeners: Listeners,
    pending: PendingRequests,
    hello: Option<oneshot::Sender<Result<Hello>>>,
}

impl Session {
    fn is_current(&self, generation: u64) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|socket| socket.generation == generation)
    }
    /// Terminal cleanup: nothing survives except the cached catalog.
    fn reset(&mut self) {
        if let Some(token) = self.reconnect.take() {
            token.cancel();
        }
        self.state = ConnectionState::Disconnected;
        self.listeners.clear();
        self.subscriptions = SubscriptionSet::default();
        self.pending.clear();
        self.hello = None;
        self.retried = 0;
    }

    /// Enters `Reconnecting` with a fresh token for the backoff loop,
    /// cancelling any loop already running.
    fn start_reconnecting(&mut self) -> CancellationToken {
        self.state = ConnectionState::Reconnecting;
        let token = CancellationToken::new();
        if let Some(previous) = self.reconnect.replace(token.clone()) {
            previous.cancel();
        }
        token
    }
}

struct Inner {
    options: ClientOptions,
    handlers: EventHandlers,
    transport: Box<dyn Transport>,
    session: Mutex<Session>,
    /// Serializes connect attempts.
    connecting: tokio::sync::Mutex<()>,
}

/// A client for one Streamer.bot instance. Cloning is cheap and every clone
/// drives the same connection.
#[derive(Clone)]
pub struct StreamerbotClient {
    inner: Arc<Inner>,
}

pub struct ClientBuilder {
    options: ClientOptions,
    handlers: EventHandlers,
    transport: Option<Box<dyn Transport>>,
}

impl ClientBuilder {
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }
    pub fn handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }
    /// Replaces the default async-tungstenite transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }
    /// Builds the client. With `immediate` set, a connect is started in the
    /// background; that needs a tokio runtime to be running.
    pub fn build(self) -> StreamerbotClient {
        let client = StreamerbotClient {
            inner: Arc::new(Inner {
                transport: self.transport.unwrap_or_else(|| Box::new(WsTransport)),
                options: self.options,
                handlers: self.handlers,
                session: Mutex::new(Session::default()),
                connecting: tokio::sync::Mutex::new(()),
            }),
        };
        if client.inner.options.immediate {
            match Handle::try_current() {
                Ok(handle) => {
                    let background = client.clone();
                    handle.spawn(async move {
                        // Failures already went to on_error.
                        let _ = background.connect().await;
                    });
                }
                Err(_) => warn!("no tokio runtime, not connecting immediately; call connect()"),
            }
        }
        client
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("options", &self.options)
            .field("handlers", &self.handlers)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

impl fmt::Debug for StreamerbotClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamerbotClient")
            .field("url", &self.inner.options.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl StreamerbotClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            options: ClientOptions::default(),
            handlers: EventHandlers::default(),
            transport: None,
        }
    }

    pub fn new(options: ClientOptions) -> Self {
        Self::builder().options(options).build()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Opens a socket, completes the handshake and (re)issues subscriptions.
    ///
    /// Any existing socket is torn down first. A pending automatic reconnect
    /// is cancelled. If the attempt fails for a transient reason and
    /// auto-reconnect is on, the error is still returned but retries are
    /// scheduled in the background.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut session = self.inner.session();
            if let Some(token) = session.reconnect.take() {
                token.cancel();
            }
            session.explicitly_closed = false;
            session.retried = 0;
        }
        let result = self.inner.connect_once().await;
        if result.as_ref().is_err_and(Error::is_transient) {
            self.inner.retry_in_background();
        }
        result
    }

    /// Closes with a normal closure code and the configured timeout.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with(NORMAL_CLOSURE, self.inner.options.timeouts.disconnect)
            .await
    }

    /// Closes the socket and waits up to `wait` for the close handshake.
    ///
    /// Listeners, subscriptions and pending requests are cleared whether or
    /// not the server acknowledged.
    pub async fn disconnect_with(&self, code: u16, wait: Duration) -> Result<()> {
        let (was_ready, result) = self.inner.close_socket(code, wait).await;
        self.inner.session().reset();
        if was_ready {
            self.inner.handlers.emit_disconnect();
        }
        info!(code, "disconnected");
        result
    }

    /// Disconnects and connects again, keeping listeners and subscriptions.
    pub async fn reconnect(&self) -> Result<()> {
        let (was_ready, result) = self
            .inner
            .close_socket(NORMAL_CLOSURE, self.inner.options.timeouts.disconnect)
            .await;
        if was_ready {
            self.inner.handlers.emit_disconnect();
        }
        if let Err(err) = result {
            debug!(error = %err, "close handshake did not complete");
        }
        self.connect().await
    }

    /// Sends a raw message without waiting for anything.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let outbound = self
            .inner
            .session()
            .socket
            .as_ref()
            .map(|socket| socket.outbound.clone())
            .ok_or(Error::NotConnected)?;
        outbound
            .send(message.to_ws_message_json()?)
            .map_err(|_| Error::NotConnected)
    }

    /// Sends `request` and waits for the response with the default timeout.
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.inner
            .request(request, self.inner.options.timeouts.request)
            .await
    }

    pub async fn request_with_timeout(&self, request: Request, wait: Duration) -> Result<Response> {
        self.inner.request(request, wait).await
    }

    /// Registers `callback` for events matching any of `patterns`
    /// (`"*"`, `"Source.*"` or `"Source.Type"`).
    ///
    /// If the session is ready, the patterns are folded into the
    /// subscription set right away and a full `Subscribe` is sent. Otherwise
    /// that happens during the next connect. A failed `Subscribe` is logged
    /// and does not unregister the listener.
    pub async fn on<I, P, F>(&self, patterns: I, callback: F) -> Result<ListenerId>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let patterns = patterns
            .into_iter()
            .map(|pattern| pattern.as_ref().parse())
            .collect::<Result<Vec<EventPattern>>>()?;
        if patterns.is_empty() {
            return Err(Error::InvalidEventPattern(String::new()));
        }
        let (id, resubscribe) = self.add_listener(patterns, Arc::new(callback), true);
        if let Some(set) = resubscribe {
            if let Err(err) = self.inner.send_subscribe(&set).await {
                warn!(listener = %id, error = %err, "could not update subscriptions");
            }
        }
        Ok(id)
    }

    /// Removes a listener. The server side subscription is left alone.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.session().listeners.remove(id)
    }

    /// Adds `spec` to the subscription set and sends the whole set.
    ///
    /// Unknown sources are dropped with a warning. The set is updated even
    /// when the request fails, so it is sent again on the next connect.
    pub async fn subscribe(&self, spec: SubscriptionSpec) -> Result<Response> {
        let catalog = self.inner.catalog().await;
        let set = {
            let mut session = self.inner.session();
            session.subscriptions.merge(&spec.resolve(&catalog));
            session.subscriptions.clone()
        };
        self.inner.send_subscribe(&set).await
    }

    /// Removes `spec` from the subscription set and sends only what was
    /// removed.
    pub async fn unsubscribe(&self, spec: SubscriptionSpec) -> Result<Response> {
        let catalog = self.inner.catalog().await;
        let removed = spec.resolve(&catalog);
        self.inner.session().subscriptions.remove_all(&removed);
        let request =
            Request::new(kind::UNSUBSCRIBE).param("events", serde_json::to_value(&removed)?);
        self.request(request).await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session().state
    }
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }
    /// Identity from the last Hello.
    pub fn instance_info(&self) -> Option<InstanceInfo> {
        self.inner.session().info.clone()
    }
    pub fn auth_status(&self) -> AuthStatus {
        self.inner.session().auth
    }
    pub fn listener_count(&self) -> usize {
        self.inner.session().listeners.len()
    }
    pub fn pending_requests(&self) -> usize {
        self.inner.session().pending.len()
    }
    pub fn subscriptions(&self) -> SubscriptionSet {
        self.inner.session().subscriptions.clone()
    }
    /// The catalog fetched during the last handshake, if any.
    pub fn catalog(&self) -> Option<EventCatalog> {
        self.inner.session().catalog.clone()
    }

    /// Adds a listener without waiting on the network. Returns the set to
    /// send if the session is ready and `always` is set or the set grew.
    pub(crate) fn add_listener(
        &self,
        patterns: Vec<EventPattern>,
        callback: Callback,
        always: bool,
    ) -> (ListenerId, Option<SubscriptionSet>) {
        let mut session = self.inner.session();
        let mut resubscribe = None;
        if session.state == ConnectionState::Ready {
            if let Some(catalog) = session.catalog.clone() {
                let mut set = session.subscriptions.clone();
                let mut changed = false;
                for pattern in &patterns {
                    changed |= pattern.fold_into(&mut set, &catalog);
                }
                if changed || always {
                    session.subscriptions = set.clone();
                    resubscribe = Some(set);
                }
            }
        }
        let id = session.listeners.add(patterns, callback);
        debug!(listener = %id, "listener added");
        (id, resubscribe)
    }

    pub(crate) async fn send_subscriptions(&self, set: &SubscriptionSet) -> Result<Response> {
        self.inner.send_subscribe(set).await
    }

    /// A token cancelled when the current socket goes away.
    pub(crate) fn connection_token(&self) -> Option<CancellationToken> {
        self.inner
            .session()
            .socket
            .as_ref()
            .map(|socket| socket.token.child_token())
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        let _connecting = self.connecting.lock().await;
        match self.establish().await {
            Ok(info) => {
                info!(name = %info.name, version = %info.version, "connected");
                self.handlers.emit_connect(&info);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "connection attempt failed");
                self.handlers.emit_error(&err);
                Err(err)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<InstanceInfo> {
        let (generation, previous) = {
            let mut session = self.session();
            session.generation += 1;
            let was_ready = session.state == ConnectionState::Ready;
            session.state = ConnectionState::Connecting;
            session.info = None;
            session.auth = AuthStatus::NotRequired;
            session.hello = None;
            session.pending.clear();
            (
                session.generation,
                session.socket.take().map(|s| (s, was_ready)),
            )
        };
        if let Some((previous, was_ready)) = previous {
            debug!("tearing down previous socket");
            previous.abandon();
            if was_ready {
                self.handlers.emit_disconnect();
            }
        }

        let url = self.options.url();
        let connect_timeout = self.options.timeouts.connect;
        debug!(%url, "opening socket");
        let socket = match timeout(connect_timeout, self.transport.open(&url)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => return self.abort(generation, err.into()),
            Err(_) => return self.abort(generation, Error::ConnectionTimeout(connect_timeout)),
        };

        let token = CancellationToken::new();
        let finished = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (hello_tx, hello_rx) = oneshot::channel();
        {
            let mut session = self.session();
            if session.generation != generation {
                return Err(Error::ConnectionClosed("the socket to open"));
            }
            session.socket = Some(SocketHandle {
                generation,
                outbound,
                token: token.clone(),
                finished: finished.clone(),
            });
            session.state = ConnectionState::Handshaking;
            session.hello = Some(hello_tx);
        }
        tokio::spawn(write_loop(socket.sink, outbound_rx, token.clone()));
        tokio::spawn(read_loop(
            Arc::downgrade(self),
            generation,
            socket.stream,
            token,
            finished,
        ));

        let handshake_timeout = self.options.timeouts.handshake;
        let hello = match timeout(handshake_timeout, hello_rx).await {
            Ok(Ok(Ok(hello))) => hello,
            Ok(Ok(Err(err))) => return self.abort(generation, err),
            Ok(Err(_)) => {
                return self.abort(generation, Error::ConnectionClosed("the Hello message"));
            }
            Err(_) => {
                let err = Error::HandshakeFailed(format!("no Hello within {handshake_timeout:?}"));
                return self.abort(generation, err);
            }
        };
        debug!(
            instance = %hello.info.instance_id,
            version = %hello.info.version,
            authentication = hello.authentication.is_some(),
            "received Hello"
        );
        self.session().info = Some(hello.info.clone());

        if let Some(challenge) = &hello.authentication {
            {
                let mut session = self.session();
                session.state = ConnectionState::Authenticating;
                session.auth = AuthStatus::Pending;
            }
            match self.authenticate(challenge).await {
                Ok(status) => self.session().auth = status,
                Err(err) => return self.abort(generation, err),
            }
        }

        self.session().state = ConnectionState::Subscribing;
        let catalog = match self.fetch_catalog().await {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(error = %err, "could not fetch the event catalog, using the built-in one");
                EventCatalog::fallback()
            }
        };
        self.session().catalog = Some(catalog.clone());
        if let Err(err) = self.subscription_phase(&catalog).await {
            return self.abort(generation, err);
        }

        let ready = {
            let mut session = self.session();
            let current = session.generation == generation && session.is_current(generation);
            if current {
                session.state = ConnectionState::Ready;
                session.retried = 0;
            }
            current
        };
        if !ready {
            return self.abort(
                generation,
                Error::ConnectionClosed("the subscription phase"),
            );
        }
        Ok(hello.info)
    }

    async fn authenticate(&self, challenge: &hello::Authentication) -> Result<AuthStatus> {
        let wait = self.options.timeouts.handshake;
        match &self.options.password {
            Some(password) => {
                let secret =
                    authentication_secret(password, &challenge.salt, &challenge.challenge);
                let request = Request::new(kind::AUTHENTICATE).param("authentication", secret);
                match self.request(request, wait).await {
                    Ok(_) => Ok(AuthStatus::Authenticated),
                    Err(err) => Err(Error::AuthenticationFailed(err.to_string())),
                }
            }
            // Try a harmless request to find out whether the
            // challenge is actually enforced.
            None => match self.request(Request::new(kind::GET_INFO), wait).await {
                Ok(_) => {
                    warn!("server sent an authentication challenge but answers without a password");
                    Ok(AuthStatus::NotRequired)
                }
                Err(err) => Err(Error::AuthenticationFailed(format!(
                    "server requires a password and none is configured ({err})"
                ))),
            },
        }
    }

    async fn fetch_catalog(&self) -> Result<EventCatalog> {
        let response = self
            .request(
                Request::new(kind::GET_EVENTS),
                self.options.timeouts.request,
            )
            .await?;
        Ok(EventCatalog::from_response(&response)?)
    }

    /// The cached catalog, or a freshly fetched one. Falls back to the
    /// built-in table without caching it.
    async fn catalog(&self) -> EventCatalog {
        let cached = self.session().catalog.clone();
        if let Some(catalog) = cached {
            return catalog;
        }
        match self.fetch_catalog().await {
            Ok(catalog) => {
                self.session().catalog = Some(catalog.clone());
                catalog
            }
            Err(err) => {
                warn!(error = %err, "could not fetch the event catalog, using the built-in one");
                EventCatalog::fallback()
            }
        }
    }

    /// Sends configured subscriptions plus whatever listeners imply, until
    /// no listener registered in the meantime adds anything.
    async fn subscription_phase(&self, catalog: &EventCatalog) -> Result<()> {
        let mut sent: Option<SubscriptionSet> = None;
        loop {
            let desired = {
                let mut session = self.session();
                let mut desired = self.options.subscribe.resolve(catalog);
                desired.merge(&session.subscriptions);
                for pattern in session.listeners.patterns() {
                    pattern.fold_into(&mut desired, catalog);
                }
                session.subscriptions = desired.clone();
                desired
            };
            if desired.is_empty() || sent.as_ref() == Some(&desired) {
                return Ok(());
            }
            match self.send_subscribe(&desired).await {
                Ok(_) => {}
                Err(err @ Error::RequestFailed { .. }) => {
                    warn!(error = %err, "server rejected the subscription request");
                }
                Err(err) => return Err(err),
            }
            sent = Some(desired);
        }
    }

    async fn send_subscribe(&self, set: &SubscriptionSet) -> Result<Response> {
        debug!(pairs = set.len(), "subscribing");
        let request = Request::new(kind::SUBSCRIBE).param("events", serde_json::to_value(set)?);
        self.request(request, self.options.timeouts.request).await
    }

    async fn request(&self, mut request: Request, wait: Duration) -> Result<Response> {
        let (id, rx, outbound, token) = {
            let mut session = self.session();
            let Some(socket) = &session.socket else {
                return Err(Error::NotConnected);
            };
            let outbound = socket.outbound.clone();
            let token = socket.token.child_token();
            let id = match &request.id {
                Some(id) => id.clone(),
                None => session.pending.unused_id(),
            };
            let rx = session.pending.insert(id.clone(), request.kind.clone())?;
            (id, rx, outbound, token)
        };
        request.id = Some(id.clone());
        let mut guard = PendingGuard {
            inner: self,
            id: &id,
            armed: true,
        };
        trace!(%id, kind = %request.kind, "sending request");
        outbound
            .send(request.to_ws_message_json()?)
            .map_err(|_| Error::NotConnected)?;

        tokio::select! {
            response = rx => {
                guard.armed = false;
                match response {
                    Ok(response) if response.is_ok() => Ok(response),
                    Ok(response) => Err(Error::RequestFailed {
                        kind: request.kind,
                        response: Box::new(response),
                    }),
                    Err(_) => Err(Error::ConnectionClosed("a response")),
                }
            }
            _ = sleep(wait) => {
                debug!(%id, kind = %request.kind, "request timed out");
                Err(Error::RequestTimeout {
                    request: Box::new(request),
                    timeout: wait,
                })
            }
            _ = token.cancelled() => Err(Error::ConnectionClosed("a response")),
        }
    }

    /// Gives up on a connect attempt, closing its socket if it is still the
    /// current one.
    fn abort<T>(&self, generation: u64, err: Error) -> Result<T> {
        let socket = {
            let mut session = self.session();
            if session.generation == generation {
                session.state = ConnectionState::Disconnected;
                session.hello = None;
                session.pending.clear();
                session.socket.take()
            } else {
                None
            }
        };
        if let Some(socket) = socket {
            socket.abandon();
        }
        Err(err)
    }

    /// Explicit close. Returns whether the session had been ready, and
    /// whether the close handshake completed in time.
    async fn close_socket(&self, code: u16, wait: Duration) -> (bool, Result<()>) {
        let (socket, was_ready) = {
            let mut session = self.session();
            session.explicitly_closed = true;
            session.generation += 1;
            if let Some(token) = session.reconnect.take() {
                token.cancel();
            }
            let was_ready = session.state == ConnectionState::Ready;
            session.state = ConnectionState::Disconnected;
            session.pending.clear();
            session.hello = None;
            (session.socket.take(), was_ready)
        };
        let Some(socket) = socket else {
            return (was_ready, Ok(()));
        };
        debug!(code, "closing socket");
        socket.send_close(code);
        let acknowledged = timeout(wait, socket.finished.cancelled()).await.is_ok();
        socket.token.cancel();
        if acknowledged {
            (was_ready, Ok(()))
        } else {
            (was_ready, Err(Error::DisconnectTimeout(wait)))
        }
    }

    /// Starts the backoff loop after a failed explicit connect, unless the
    /// caller closed in the meantime or a newer attempt is under way.
    fn retry_in_background(self: &Arc<Self>) {
        let token = {
            let mut session = self.session();
            if !self.options.auto_reconnect
                || !self.options.retry_allowed(1)
                || session.explicitly_closed
                || session.state != ConnectionState::Disconnected
            {
                return;
            }
            session.start_reconnecting()
        };
        debug!("scheduling reconnect after failed connect");
        tokio::spawn(reconnect_loop(Arc::downgrade(self), token));
    }

    fn take_hello_waiter(&self, generation: u64) -> Option<oneshot::Sender<Result<Hello>>> {
        let mut session = self.session();
        if session.is_current(generation) {
            session.hello.take()
        } else {
            None
        }
    }

    fn handle_text(&self, generation: u64, frame: &WsMessage) {
        let value = match frame.json_value() {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "ignoring message that is not JSON");
                return;
            }
        };
        let message = match ServerMessage::from_value(&value) {
            Ok(message) => message,
            Err(err) => {
                match self.take_hello_waiter(generation) {
                    Some(waiter) => {
                        let _ = waiter.send(Err(Error::HandshakeFailed(err.to_string())));
                    }
                    None => warn!(error = %err, "malformed message"),
                }
                self.handlers.emit_data(&value);
                return;
            }
        };
        if !matches!(message, ServerMessage::Hello(_)) {
            if let Some(waiter) = self.take_hello_waiter(generation) {
                let err = Error::HandshakeFailed("first message was not a Hello".into());
                let _ = waiter.send(Err(err));
                return;
            }
        }

        match message {
            ServerMessage::Hello(hello) => {
                match self.take_hello_waiter(generation) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(hello));
                    }
                    None => debug!("unexpected Hello"),
                }
                self.handlers.emit_data(&value);
            }
            ServerMessage::Response(mut response) => {
                let waiter = self.session().pending.take(&response.id);
                match waiter {
                    Some((kind, tx)) => {
                        trace!(id = %response.id, status = %response.status, "response");
                        response.event = Some(EventEnvelope::request(kind));
                        if self.handlers.has_data_handler() {
                            if let Ok(tagged) = serde_json::to_value(&response) {
                                self.handlers.emit_data(&tagged);
                            }
                        }
                        let _ = tx.send(response);
                    }
                    None => {
                        trace!(id = %response.id, "response nobody is waiting for");
                        self.handlers.emit_data(&value);
                    }
                }
            }
            ServerMessage::Event(event) => {
                self.handlers.emit_data(&value);
                let callbacks = self.session().listeners.matching(&event);
                trace!(event = %event.event, listeners = callbacks.len(), "dispatching");
                dispatch::dispatch(&callbacks, &event);
            }
            ServerMessage::Other(_) => self.handlers.emit_data(&value),
        }
    }

    fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: String) {
        let (was_ready, reconnect) = {
            let mut session = self.session();
            if !session.is_current(generation) {
                return;
            }
            if let Some(socket) = session.socket.take() {
                socket.token.cancel();
            }
            session.pending.clear();
            session.hello = None;
            let was_ready = session.state == ConnectionState::Ready;
            session.state = ConnectionState::Disconnected;
            let reconnect = if was_ready
                && !session.explicitly_closed
                && self.options.auto_reconnect
            {
                Some(session.start_reconnecting())
            } else {
                if was_ready {
                    session.reset();
                }
                None
            };
            (was_ready, reconnect)
        };
        if !was_ready {
            debug!(code, "socket closed before the session was ready");
            return;
        }
        let reason = if reason.is_empty() {
            close_reason(code).to_owned()
        } else {
            reason
        };
        if code == NORMAL_CLOSURE {
            info!(code, %reason, "connection closed by server");
        } else {
            warn!(code, %reason, "connection lost");
            self.handlers
                .emit_error(&Error::ConnectionLost { code, reason });
        }
        self.handlers.emit_disconnect();
        if let Some(token) = reconnect {
            tokio::spawn(reconnect_loop(Arc::downgrade(self), token));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = session.reconnect.take() {
            token.cancel();
        }
        if let Some(socket) = session.socket.take() {
            socket.abandon();
        }
    }
}

/// Removes a pending entry when a request stops waiting for any reason
/// other than its response arriving.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.session().pending.remove(self.id);
        }
    }
}

async fn write_loop(
    mut sink: BoxSink,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
    token: CancellationToken,
) {
    loop {
        // Drain queued frames (a final close frame in particular) before
        // honouring cancellation.
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            _ = token.cancelled() => None,
        };
        let Some(message) = message else { break };
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut stream: BoxStream<'static, Result<WsMessage, WsError>>,
    token: CancellationToken,
    finished: CancellationToken,
) {
    let mut close_frame: Option<(u16, String)> = None;
    let ended = loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break false,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(frame @ WsMessage::Text(_))) => match inner.upgrade() {
                Some(inner) => inner.handle_text(generation, &frame),
                None => break false,
            },
            Some(Ok(WsMessage::Close(frame))) => {
                let (code, reason) = frame
                    .map(|frame| (u16::from(frame.code), frame.reason.as_str().to_owned()))
                    .unwrap_or((NO_STATUS, String::new()));
                debug!(code, "received close frame");
                close_frame.get_or_insert((code, reason));
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                debug!(error = %err, "read failed");
                break true;
            }
            None => break true,
        }
    };
    finished.cancel();
    if ended {
        if let Some(inner) = inner.upgrade() {
            let (code, reason) = close_frame.unwrap_or((ABNORMAL_CLOSURE, String::new()));
            inner.handle_close(generation, code, reason);
        }
    }
}

async fn reconnect_loop(inner: Weak<Inner>, token: CancellationToken) {
    loop {
        let (attempt, delay) = {
            let Some(inner) = inner.upgrade() else { return };
            let attempt = {
                let mut session = inner.session();
                session.retried += 1;
                session.retried
            };
            if !inner.options.retry_allowed(attempt) {
                let attempts = attempt - 1;
                inner.session().reset();
                warn!(attempts, "giving up on reconnecting");
                inner.handlers.emit_error(&Error::RetriesExhausted(attempts));
                return;
            }
            (attempt, inner.options.reconnect.delay(attempt))
        };
        info!(attempt, ?delay, "reconnecting");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(delay) => {}
        }
        let Some(inner) = inner.upgrade() else { return };
        if token.is_cancelled() {
            return;
        }
        match inner.connect_once().await {
            Ok(()) => {
                // A replacement loop would have cancelled this token first.
                if !token.is_cancelled() {
                    inner.session().reconnect = None;
                }
                return;
            }
            Err(_) if token.is_cancelled() => return,
            Err(_) => inner.session().state = ConnectionState::Reconnecting,
        }
    }
}
