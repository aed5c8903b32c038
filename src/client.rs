//! RPC client channel.
//!
//! Dials the server, performs the `[CONNECT, serverId]` handshake, and
//! runs two long-lived tasks per connection: a read pump routing
//! incoming frames to task slots and topic handlers, and a write pump
//! draining the outbound queue into the socket.
//!
//! An unexpected close flips every registered remote handle to
//! not-ready (so routed traffic goes elsewhere or fails fast), flushes
//! all in-flight awaiters, and enters a supervisor loop that redials
//! every two seconds until the channel reopens or the user closes it.

use crate::call::{RemoteCall, TaskSlot};
use crate::channel::{
    write_pump, ChannelAddr, ChannelConfig, ChannelState, ErrorHandler, ErrorHook, RpcError,
    Scheme, TlsContext,
};
use crate::proxy::{ModuleProxy, RemoteHandle};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use indexmap::IndexMap;
use mux_protocol::{now_millis, normalize_millis, ErrorObject, Event, Frame, TaskId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Handler invoked for every message published on a subscribed topic.
/// Errors are reported to the channel error hook; they do not stop
/// later handlers.
pub type TopicHandler = Arc<dyn Fn(Value) -> Result<(), RpcError> + Send + Sync>;

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// A client channel to one RPC server.
pub struct RpcClient {
    inner: Arc<ClientShared>,
}

impl RpcClient {
    /// Build a client without dialing; call [`RpcClient::open`] to
    /// connect.
    pub fn new(addr: impl Into<ChannelAddr>) -> Result<RpcClient, RpcError> {
        let mut config = ChannelConfig::from_addr(addr)?;
        if config.id.is_empty() {
            config.id = uuid::Uuid::new_v4().simple().to_string();
        }
        let server_id = if config.server_id.is_empty() {
            config.dsn()
        } else {
            config.server_id.clone()
        };
        Ok(RpcClient {
            inner: Arc::new(ClientShared {
                config,
                state: Mutex::new(ChannelState::Initiated),
                server_id: Mutex::new(server_id),
                next_task: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                topics: Mutex::new(IndexMap::new()),
                registry: Mutex::new(IndexMap::new()),
                outbound: Mutex::new(None),
                errors: ErrorHandler::new(),
            }),
        })
    }

    /// Dial and perform the handshake.
    pub async fn open(&self) -> Result<(), RpcError> {
        ClientShared::open(&self.inner).await
    }

    /// Close the channel for good; a closed channel never redials.
    pub async fn close(&self) {
        *self.inner.state.lock().expect("state lock poisoned") = ChannelState::Closed;
        self.inner.flush_ready(false);
        let tx = self
            .inner
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(Message::Close(None));
        }
    }

    /// Flip this channel's remote handles to not-ready so routed calls
    /// go to other channels.
    pub fn pause(&self) {
        self.inner.flush_ready(false);
    }

    /// Resume handling traffic on this channel.
    pub fn resume(&self) {
        self.inner.flush_ready(true);
    }

    pub fn connecting(&self) -> bool {
        self.inner.state() == ChannelState::Connecting
    }

    pub fn connected(&self) -> bool {
        self.inner.state() == ChannelState::Connected
    }

    pub fn closed(&self) -> bool {
        self.inner.state() == ChannelState::Closed
    }

    /// The client identity sent during the handshake.
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// The server identity learned from the `CONNECT` frame (the DSN
    /// until the first handshake completes).
    pub fn server_id(&self) -> String {
        self.inner.server_id()
    }

    pub fn dsn(&self) -> String {
        self.inner.config.dsn()
    }

    /// Declare that this client routes calls for the proxied module.
    ///
    /// Inserts a [`RemoteHandle`] keyed by this channel's server id
    /// into the proxy's singleton table; the handle's readiness tracks
    /// the connection state from then on.
    pub fn register(&self, proxy: &Arc<ModuleProxy>) {
        let server_id = self.inner.server_id();
        let mut registry = self.inner.registry.lock().expect("registry lock poisoned");
        if !registry.contains_key(proxy.name()) {
            registry.insert(proxy.name().to_owned(), proxy.clone());
            let handle = Arc::new(RemoteHandle::new(
                proxy.name().to_owned(),
                self.inner.clone(),
            ));
            handle.set_ready(self.connected());
            proxy.insert_handle(&server_id, handle);
        }
    }

    /// Start a remote call on this channel, bypassing proxy routing.
    pub fn invoke(&self, module: &str, method: &str, args: Vec<Value>) -> RemoteCall {
        RemoteCall::start(
            self.inner.clone(),
            module.to_owned(),
            method.to_owned(),
            args,
        )
    }

    /// Subscribe a handler to a topic; returns the handle accepted by
    /// [`RpcClient::unsubscribe_handler`].
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(Value) -> Result<(), RpcError> + Send + Sync + 'static,
    ) -> TopicHandler {
        let handler: TopicHandler = Arc::new(handler);
        self.inner
            .topics
            .lock()
            .expect("topic lock poisoned")
            .entry(topic.to_owned())
            .or_default()
            .push(handler.clone());
        handler
    }

    /// Remove every handler bound to the topic.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.inner
            .topics
            .lock()
            .expect("topic lock poisoned")
            .shift_remove(topic)
            .is_some()
    }

    /// Remove one handler (by identity) from the topic.
    pub fn unsubscribe_handler(&self, topic: &str, handler: &TopicHandler) -> bool {
        let mut topics = self.inner.topics.lock().expect("topic lock poisoned");
        let Some(handlers) = topics.get_mut(topic) else {
            return false;
        };
        let Some(index) = handlers.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        handlers.remove(index);
        true
    }

    /// Count of handlers currently bound to the topic.
    pub fn topic_handlers(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .expect("topic lock poisoned")
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Replace the channel error hook.
    pub fn on_error(&self, hook: ErrorHook) {
        self.inner.errors.set(hook);
    }
}

// ---------------------------------------------------------------------------
// Shared connection state
// ---------------------------------------------------------------------------

pub(crate) struct ClientShared {
    pub(crate) config: ChannelConfig,
    state: Mutex<ChannelState>,
    server_id: Mutex<String>,
    next_task: AtomicU64,
    tasks: Mutex<HashMap<u64, Arc<TaskSlot>>>,
    topics: Mutex<IndexMap<String, Vec<TopicHandler>>>,
    registry: Mutex<IndexMap<String, Arc<ModuleProxy>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pub(crate) errors: ErrorHandler,
}

impl ClientShared {
    fn state(&self) -> ChannelState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub(crate) fn server_id(&self) -> String {
        self.server_id
            .lock()
            .expect("server id lock poisoned")
            .clone()
    }

    /// Task ids are unique and strictly increasing per channel,
    /// starting at 1.
    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_task(&self, task_id: u64, slot: Arc<TaskSlot>) {
        self.tasks
            .lock()
            .expect("task table poisoned")
            .entry(task_id)
            .or_insert(slot);
    }

    pub(crate) fn remove_task(&self, task_id: u64) {
        self.tasks
            .lock()
            .expect("task table poisoned")
            .remove(&task_id);
    }

    pub(crate) fn call_timeout(&self) -> u64 {
        self.config.timeout
    }

    /// Queue a frame for the writer; silently dropped while the
    /// channel is not open (the per-call timeout reports the failure).
    pub(crate) fn send_frame(&self, frame: Frame) {
        self.send_message(Message::Text(frame.encode().into()));
    }

    fn send_message(&self, message: Message) {
        if let Some(tx) = self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .as_ref()
        {
            let _ = tx.send(message);
        }
    }

    // -----------------------------------------------------------------------
    // Opening
    // -----------------------------------------------------------------------

    async fn open(self: &Arc<Self>) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            match *state {
                ChannelState::Connected => {
                    return Err(RpcError::AlreadyOpen(self.server_id()));
                }
                ChannelState::Closed => {
                    return Err(RpcError::ChannelClosed(self.server_id()));
                }
                _ => *state = ChannelState::Connecting,
            }
        }

        let url = self.config.request_url();
        match self.config.scheme {
            Scheme::Ws => {
                let (ws, _response) = tokio_tungstenite::connect_async(url)
                    .await
                    .map_err(|e| RpcError::Ws(e.to_string()))?;
                self.finish_open(ws).await
            }
            Scheme::Wss => {
                let connector = match &self.config.tls {
                    Some(TlsContext::Client(tls)) => {
                        tokio_tungstenite::Connector::Rustls(tls.clone())
                    }
                    _ => {
                        return Err(RpcError::Config(
                            "'tls' must be provided for 'wss:' protocol".to_owned(),
                        ));
                    }
                };
                let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
                    url,
                    None,
                    false,
                    Some(connector),
                )
                .await
                .map_err(|e| RpcError::Ws(e.to_string()))?;
                self.finish_open(ws).await
            }
            #[cfg(unix)]
            Scheme::WsUnix => {
                let stream = tokio::net::UnixStream::connect(&self.config.pathname)
                    .await
                    .map_err(|e| RpcError::Ws(e.to_string()))?;
                let (ws, _response) = tokio_tungstenite::client_async(url, stream)
                    .await
                    .map_err(|e| RpcError::Ws(e.to_string()))?;
                self.finish_open(ws).await
            }
            #[cfg(not(unix))]
            Scheme::WsUnix => Err(RpcError::Config(
                "IPC on this platform is currently not supported".to_owned(),
            )),
        }
    }

    async fn finish_open<S>(self: &Arc<Self>, mut ws: WebSocketStream<S>) -> Result<(), RpcError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // The server speaks first: `[CONNECT, serverId]`.
        let handshake_window = Duration::from_millis(self.config.timeout);
        let first = tokio::time::timeout(handshake_window, ws.next())
            .await
            .map_err(|_| RpcError::HandshakeFailed(self.config.dsn()))?;
        let frame = match first {
            Some(Ok(Message::Text(text))) => Frame::decode(&text),
            _ => None,
        };
        let frame = frame.ok_or_else(|| RpcError::HandshakeFailed(self.config.dsn()))?;
        if frame.event != Event::Connect {
            return Err(RpcError::HandshakeFailed(self.config.dsn()));
        }
        let server_id = match &frame.task {
            TaskId::Name(name) => name.clone(),
            TaskId::Seq(n) => n.to_string(),
        };
        self.update_server_id(server_id);

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().expect("outbound lock poisoned") = Some(tx);
        tokio::spawn(write_pump(sink, rx));

        *self.state.lock().expect("state lock poisoned") = ChannelState::Connected;
        self.flush_ready(true);
        info!(server_id = %self.server_id(), "channel connected");

        let shared = self.clone();
        tokio::spawn(async move {
            shared.read_pump(stream).await;
            shared.on_disconnect();
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pumps
    // -----------------------------------------------------------------------

    async fn read_pump<S>(&self, mut stream: SplitStream<WebSocketStream<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Text(text)) => {
                    let Some(frame) = Frame::decode(&text) else {
                        debug!("dropping malformed frame");
                        continue;
                    };
                    if !self.handle_frame(frame) {
                        break;
                    }
                }
                Ok(Message::Ping(data)) => self.send_message(Message::Pong(data)),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "read pump error");
                    break;
                }
            }
        }
    }

    /// Route one frame; returns false when the connection must drop.
    fn handle_frame(&self, frame: Frame) -> bool {
        match frame.event {
            // Replies resolve the head of the task's awaiter queue.
            // An INVOKE reply is the generator ack and resolves like
            // RETURN.
            Event::Return | Event::Invoke | Event::Yield => {
                if let Some(slot) = frame.task.seq().and_then(|id| self.task_slot(id)) {
                    slot.resolve_next(frame.data());
                }
            }
            Event::Throw => {
                if let Some(id) = frame.task.seq() {
                    if let Some(slot) = self.task_slot(id) {
                        slot.reject_next(RpcError::from_object(ErrorObject::from_value(
                            &frame.data(),
                        )));
                        self.remove_task(id);
                    }
                }
            }
            Event::Ping => {
                let now = now_millis();
                let ts = normalize_millis(frame.task.seq().unwrap_or(now));
                if now.saturating_sub(ts) > self.config.max_delay {
                    warn!("keepalive delay exceeded, dropping connection");
                    self.send_message(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: "Slow Connection".into(),
                    })));
                    return false;
                }
                self.send_frame(Frame::pong(now));
            }
            Event::Publish => {
                if let Some(topic) = frame.task.name() {
                    let handlers: Vec<TopicHandler> = self
                        .topics
                        .lock()
                        .expect("topic lock poisoned")
                        .get(topic)
                        .cloned()
                        .unwrap_or_default();
                    for handler in handlers {
                        if let Err(err) = handler(frame.data()) {
                            self.errors.report(err);
                        }
                    }
                }
            }
            // A CONNECT after the handshake carries nothing new; PONG
            // never flows server -> client.
            Event::Connect | Event::Pong => {}
        }
        true
    }

    fn task_slot(&self, task_id: u64) -> Option<Arc<TaskSlot>> {
        self.tasks
            .lock()
            .expect("task table poisoned")
            .get(&task_id)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Disconnect handling
    // -----------------------------------------------------------------------

    fn on_disconnect(self: &Arc<Self>) {
        *self.outbound.lock().expect("outbound lock poisoned") = None;

        // Nothing may stay pending across a disconnect.
        let slots: Vec<Arc<TaskSlot>> = self
            .tasks
            .lock()
            .expect("task table poisoned")
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            slot.close();
        }

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Connecting;
        }

        self.flush_ready(false);
        info!(server_id = %self.server_id(), "connection lost, reconnecting");

        let shared = self.clone();
        tokio::spawn(async move {
            loop {
                if shared.state() == ChannelState::Closed {
                    break;
                }
                match ClientShared::open(&shared).await {
                    Ok(()) => break,
                    Err(err) => {
                        debug!(error = %err, "reconnect attempt failed");
                        tokio::time::sleep(RECONNECT_INTERVAL).await;
                    }
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Readiness and identity
    // -----------------------------------------------------------------------

    fn flush_ready(&self, ready: bool) {
        let server_id = self.server_id();
        for (_, proxy) in self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .iter()
        {
            proxy.set_handle_ready(&server_id, ready);
        }
    }

    /// Re-key every proxy's singleton table when the server identifies
    /// itself differently than configured (or than before a reconnect).
    fn update_server_id(&self, new_id: String) {
        let mut current = self.server_id.lock().expect("server id lock poisoned");
        if *current != new_id {
            for (_, proxy) in self
                .registry
                .lock()
                .expect("registry lock poisoned")
                .iter()
            {
                proxy.rekey(&current, &new_id);
            }
            *current = new_id;
        }
    }
}

