//! RPC server channel.
//!
//! Listens on TCP (plain or TLS) or a unix domain socket, gates the
//! WebSocket upgrade on pathname and query-string credentials, and
//! runs one read pump per accepted client.  Unary invocations are
//! dispatched on their own tasks; generator traffic is driven inline
//! by the pump, which owns the connection's open generators.
//!
//! A shared interval task pings every client each 30 seconds and
//! drops the ones that stopped answering.

use crate::channel::{
    parse_query, write_pump, ChannelAddr, ChannelConfig, ErrorHandler, ErrorHook, RpcError,
    Scheme, TlsContext,
};
use crate::module::{Dispatch, Generator, Module, ModuleRecord};
use futures_util::StreamExt;
use indexmap::IndexMap;
use mux_protocol::{now_millis, normalize_millis, ErrorObject, Event, Frame};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const SLOW_CONNECTION: &str = "Slow Connection";

// ---------------------------------------------------------------------------
// Server states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Initiating,
    Listening,
    Closed,
}

// ---------------------------------------------------------------------------
// RpcServer
// ---------------------------------------------------------------------------

/// A server channel hosting module singletons for remote invocation.
pub struct RpcServer {
    inner: Arc<ServerShared>,
}

impl RpcServer {
    /// Build a server without binding; call [`RpcServer::open`] to
    /// listen.  The server identity defaults to the DSN.
    pub fn new(addr: impl Into<ChannelAddr>) -> Result<RpcServer, RpcError> {
        let config = ChannelConfig::from_addr(addr)?;
        let id = if config.id.is_empty() {
            config.dsn()
        } else {
            config.id.clone()
        };
        let (shutdown, _) = watch::channel(false);
        Ok(RpcServer {
            inner: Arc::new(ServerShared {
                config,
                id,
                state: Mutex::new(ServerState::Initiating),
                registry: Mutex::new(IndexMap::new()),
                clients: RwLock::new(IndexMap::new()),
                next_conn: AtomicU64::new(1),
                lifecycle: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                errors: ErrorHandler::new(),
            }),
        })
    }

    /// The server identity announced in `CONNECT` frames.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn dsn(&self) -> String {
        self.inner.config.dsn()
    }

    /// Actual bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("addr lock poisoned")
    }

    /// Register a module under its name.  The factory runs once, when
    /// the singleton is first needed.
    pub fn register<M, F>(&self, name: &str, factory: F)
    where
        M: Module,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let record = Arc::new(ModuleRecord::new(Box::new(move || {
            Arc::new(factory()) as Arc<dyn Module>
        })));
        // Modules registered while already listening skip the
        // lifecycle phase and dispatch immediately.
        if *self.inner.state.lock().expect("state lock poisoned") == ServerState::Listening {
            record.set_ready(true);
        }
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .insert(name.to_owned(), record);
    }

    /// Bind and start serving.
    ///
    /// With `lifecycle` enabled, every registered module is
    /// materialized and its `init` hook awaited, in registration
    /// order, before the listener opens; failures go to the error
    /// hook and do not abort startup.
    pub async fn open(&self, lifecycle: bool) -> Result<(), RpcError> {
        {
            let state = self.inner.state.lock().expect("state lock poisoned");
            match *state {
                ServerState::Listening => return Err(RpcError::AlreadyOpen(self.inner.id.clone())),
                ServerState::Closed => {
                    return Err(RpcError::ChannelClosed(self.inner.id.clone()));
                }
                ServerState::Initiating => {}
            }
        }

        if lifecycle {
            self.inner.lifecycle.store(true, Ordering::Release);
            let records: Vec<Arc<ModuleRecord>> = self
                .inner
                .registry
                .lock()
                .expect("registry lock poisoned")
                .values()
                .cloned()
                .collect();
            for record in records {
                if let Err(err) = record.instance().init().await {
                    self.inner.errors.report(err);
                }
                record.set_ready(true);
            }
        } else {
            for record in self
                .inner
                .registry
                .lock()
                .expect("registry lock poisoned")
                .values()
            {
                record.set_ready(true);
            }
        }

        let tls = match (self.inner.config.scheme, &self.inner.config.tls) {
            (Scheme::Wss, Some(TlsContext::Server(tls))) => {
                Some(tokio_rustls::TlsAcceptor::from(tls.clone()))
            }
            (Scheme::Wss, _) => {
                return Err(RpcError::Config(
                    "'tls' must be provided for 'wss:' protocol".to_owned(),
                ));
            }
            _ => None,
        };

        match self.inner.config.scheme {
            #[cfg(unix)]
            Scheme::WsUnix => {
                let path = std::path::Path::new(&self.inner.config.pathname);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| RpcError::Ws(format!("cannot create socket dir: {e}")))?;
                }
                // A stale socket file means a previous process died
                // without unbinding.
                if path.exists() {
                    std::fs::remove_file(path)
                        .map_err(|e| RpcError::Ws(format!("cannot unlink stale socket: {e}")))?;
                }
                let listener = tokio::net::UnixListener::bind(path)
                    .map_err(|e| RpcError::Ws(e.to_string()))?;
                let shared = self.inner.clone();
                let handle = tokio::spawn(accept_unix_loop(shared, listener));
                self.inner.track(handle);
            }
            #[cfg(not(unix))]
            Scheme::WsUnix => {
                return Err(RpcError::Config(
                    "IPC on this platform is currently not supported".to_owned(),
                ));
            }
            _ => {
                let listener = TcpListener::bind((
                    self.inner.config.hostname.as_str(),
                    self.inner.config.port,
                ))
                .await
                .map_err(|e| RpcError::Ws(e.to_string()))?;
                *self.inner.local_addr.lock().expect("addr lock poisoned") =
                    listener.local_addr().ok();
                let shared = self.inner.clone();
                let handle = tokio::spawn(accept_tcp_loop(shared, listener, tls));
                self.inner.track(handle);
            }
        }

        let shared = self.inner.clone();
        self.inner.track(tokio::spawn(keepalive_loop(shared)));

        *self.inner.state.lock().expect("state lock poisoned") = ServerState::Listening;
        info!(id = %self.inner.id, "server listening");
        Ok(())
    }

    /// Broadcast to the listed clients, or to every client when the
    /// list is empty.  Best-effort; returns whether anything was sent.
    pub fn publish(&self, topic: &str, data: Value, client_ids: &[String]) -> bool {
        let frame = Frame::publish(topic, data);
        let text = frame.encode();
        let mut sent = false;
        for entry in self
            .inner
            .clients
            .read()
            .expect("client table poisoned")
            .values()
        {
            if client_ids.is_empty() || client_ids.iter().any(|id| *id == entry.id) {
                sent |= entry.tx.send(Message::Text(text.clone().into())).is_ok();
            }
        }
        sent
    }

    /// Ids of the currently connected clients, in accept order.
    pub fn clients(&self) -> Vec<String> {
        self.inner
            .clients
            .read()
            .expect("client table poisoned")
            .values()
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Stop listening, drop every connection (closing its open
    /// generators), and run the `destroy` hooks when the lifecycle
    /// phase was enabled.  Individual destroy failures are reported
    /// and do not stop later destroys.
    pub async fn close(&self) {
        *self.inner.state.lock().expect("state lock poisoned") = ServerState::Closed;
        let _ = self.inner.shutdown.send(true);

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }

        let records: Vec<Arc<ModuleRecord>> = self
            .inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        let lifecycle = self.inner.lifecycle.load(Ordering::Acquire);
        for record in records {
            record.set_ready(false);
            if lifecycle {
                if let Some(instance) = record.materialized() {
                    if let Err(err) = instance.destroy().await {
                        self.inner.errors.report(err);
                    }
                }
            }
        }

        self.inner
            .clients
            .write()
            .expect("client table poisoned")
            .clear();
        info!(id = %self.inner.id, "server closed");
    }

    /// Replace the channel error hook.
    pub fn on_error(&self, hook: ErrorHook) {
        self.inner.errors.set(hook);
    }
}

// ---------------------------------------------------------------------------
// Shared server state
// ---------------------------------------------------------------------------

struct ConnEntry {
    id: String,
    alive: AtomicBool,
    tx: mpsc::UnboundedSender<Message>,
}

struct ServerShared {
    config: ChannelConfig,
    id: String,
    state: Mutex<ServerState>,
    registry: Mutex<IndexMap<String, Arc<ModuleRecord>>>,
    clients: RwLock<IndexMap<u64, Arc<ConnEntry>>>,
    next_conn: AtomicU64,
    lifecycle: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    errors: ErrorHandler,
}

impl ServerShared {
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

// ---------------------------------------------------------------------------
// Accept loops
// ---------------------------------------------------------------------------

async fn accept_tcp_loop(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    tls: Option<tokio_rustls::TlsAcceptor>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "incoming connection");
                    let conn_shared = shared.clone();
                    let tls = tls.clone();
                    let handle = tokio::spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => handle_connection(conn_shared, stream, false).await,
                                Err(e) => debug!(error = %e, "TLS accept failed"),
                            },
                            None => handle_connection(conn_shared, stream, false).await,
                        }
                    });
                    shared.track(handle);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

#[cfg(unix)]
async fn accept_unix_loop(shared: Arc<ServerShared>, listener: tokio::net::UnixListener) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _peer)) => {
                    let conn_shared = shared.clone();
                    let handle = tokio::spawn(async move {
                        handle_connection(conn_shared, stream, true).await;
                    });
                    shared.track(handle);
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

fn http_error(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

/// Upgrade gate, run before the WebSocket handshake completes: the
/// pathname must match (TCP only), the query string must carry a
/// non-empty `id`, and the secret must match when one is configured.
fn validate_upgrade(
    config: &ChannelConfig,
    is_unix: bool,
    request: &Request,
) -> Result<String, StatusCode> {
    let uri = request.uri();
    if !is_unix && uri.path() != config.pathname {
        return Err(StatusCode::NOT_FOUND);
    }
    let mut client_id = String::new();
    let mut secret = String::new();
    for (key, value) in parse_query(uri.query().unwrap_or("")) {
        match key.as_str() {
            "id" => client_id = value,
            "secret" => secret = value,
            _ => {}
        }
    }
    if client_id.is_empty() || (!config.secret.is_empty() && secret != config.secret) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(client_id)
}

async fn handle_connection<S>(shared: Arc<ServerShared>, stream: S, is_unix: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client_id: Option<String> = None;
    let callback = |request: &Request, response: Response| match validate_upgrade(
        &shared.config,
        is_unix,
        request,
    ) {
        Ok(id) => {
            client_id = Some(id);
            Ok(response)
        }
        Err(status) => Err(http_error(status)),
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "upgrade rejected");
            return;
        }
    };
    let Some(client_id) = client_id else { return };

    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (sink, mut stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_pump(sink, rx));

    let entry = Arc::new(ConnEntry {
        id: client_id.clone(),
        alive: AtomicBool::new(true),
        tx,
    });
    shared
        .clients
        .write()
        .expect("client table poisoned")
        .insert(conn_id, entry.clone());

    // The server speaks first so clients can learn (or re-learn) the
    // server identity.
    let _ = entry
        .tx
        .send(Message::Text(Frame::connect(&shared.id).encode().into()));
    info!(client_id = %entry.id, "client connected");

    // Open generators are owned by this pump; nothing else touches them.
    let mut generators: HashMap<u64, Box<dyn Generator>> = HashMap::new();
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            item = stream.next() => match item {
                None => break,
                Some(Err(e)) => {
                    debug!(client_id = %entry.id, error = %e, "read pump error");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    let Some(frame) = Frame::decode(&text) else {
                        debug!(client_id = %entry.id, "dropping malformed frame");
                        continue;
                    };
                    if !handle_frame(&shared, frame, &entry, &mut generators).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = entry.tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    // Connection teardown cancels every open generator.
    for (_, mut generator) in generators.drain() {
        let _ = generator.close().await;
    }
    shared
        .clients
        .write()
        .expect("client table poisoned")
        .shift_remove(&conn_id);
    info!(client_id = %entry.id, "client disconnected");
}

// ---------------------------------------------------------------------------
// Frame dispatch
// ---------------------------------------------------------------------------

fn parse_call(frame: &Frame) -> (String, String, Vec<Value>) {
    let module = frame
        .payload
        .first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let method = frame
        .payload
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let args = frame
        .payload
        .get(2)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    (module, method, args)
}

fn send_frame(entry: &ConnEntry, frame: Frame) {
    let _ = entry.tx.send(Message::Text(frame.encode().into()));
}

fn send_throw(entry: &ConnEntry, task_id: u64, err: &RpcError) {
    let payload = serde_json::to_value(err.to_object()).unwrap_or(Value::Null);
    send_frame(entry, Frame::reply(Event::Throw, task_id, payload));
}

/// Route one frame; returns false when the connection must drop.
async fn handle_frame(
    shared: &Arc<ServerShared>,
    frame: Frame,
    entry: &Arc<ConnEntry>,
    generators: &mut HashMap<u64, Box<dyn Generator>>,
) -> bool {
    match frame.event {
        Event::Invoke => handle_invoke(shared, &frame, entry, generators),
        Event::Yield | Event::Return | Event::Throw => {
            drive_generator(&frame, entry, generators).await;
        }
        Event::Pong => {
            entry.alive.store(true, Ordering::Release);
            let now = now_millis();
            let ts = normalize_millis(frame.task.seq().unwrap_or(now));
            if now.saturating_sub(ts) > shared.config.max_delay {
                warn!(client_id = %entry.id, "keepalive delay exceeded, dropping connection");
                let _ = entry.tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: SLOW_CONNECTION.into(),
                })));
                return false;
            }
        }
        // Everything else is client-bound or protocol noise.
        _ => {}
    }
    true
}

/// `INVOKE`: resolve module and method, classify the result, reply.
///
/// Unary futures run on their own task so a slow method cannot stall
/// the pump; generators stay with the pump, acked by an `INVOKE` frame
/// the client treats as a plain resolve.
fn handle_invoke(
    shared: &Arc<ServerShared>,
    frame: &Frame,
    entry: &Arc<ConnEntry>,
    generators: &mut HashMap<u64, Box<dyn Generator>>,
) {
    let Some(task_id) = frame.task.seq() else {
        return;
    };
    let (module, method, args) = parse_call(frame);

    let record = shared
        .registry
        .lock()
        .expect("registry lock poisoned")
        .get(&module)
        .cloned();
    let dispatch = match record {
        Some(record) if record.is_ready() => record.instance().dispatch(&method, args),
        _ => Err(RpcError::ServiceUnavailable(module.clone())),
    };

    match dispatch {
        Ok(Dispatch::Value(value)) => {
            send_frame(entry, Frame::reply(Event::Return, task_id, value));
        }
        Ok(Dispatch::Future(fut)) => {
            let entry = entry.clone();
            tokio::spawn(async move {
                match fut.await {
                    Ok(value) => send_frame(&entry, Frame::reply(Event::Return, task_id, value)),
                    Err(err) => send_throw(&entry, task_id, &err),
                }
            });
        }
        Ok(Dispatch::Generator(generator)) => {
            generators.insert(task_id, generator);
            send_frame(entry, Frame::reply(Event::Invoke, task_id, Value::Null));
        }
        Err(err) => send_throw(entry, task_id, &err),
    }
}

/// `YIELD` / `RETURN` / `THROW`: drive the stored generator.
async fn drive_generator(
    frame: &Frame,
    entry: &Arc<ConnEntry>,
    generators: &mut HashMap<u64, Box<dyn Generator>>,
) {
    let Some(task_id) = frame.task.seq() else {
        return;
    };
    let (module, method, args) = parse_call(frame);
    let input = args.into_iter().next().unwrap_or(Value::Null);

    let missing = |entry: &ConnEntry| {
        let err = RpcError::Remote(ErrorObject::new(
            "ReferenceError",
            format!("Failed to call {module}(route).{method}()"),
        ));
        send_throw(entry, task_id, &err);
    };

    match frame.event {
        Event::Yield => match generators.get_mut(&task_id) {
            None => missing(entry),
            Some(generator) => match generator.resume(input).await {
                Ok(Some(value)) => send_frame(
                    entry,
                    Frame::reply(
                        Event::Yield,
                        task_id,
                        json!({"done": false, "value": value}),
                    ),
                ),
                Ok(None) => {
                    generators.remove(&task_id);
                    send_frame(
                        entry,
                        Frame::reply(Event::Yield, task_id, json!({"done": true})),
                    );
                }
                Err(err) => {
                    generators.remove(&task_id);
                    send_throw(entry, task_id, &err);
                }
            },
        },
        Event::Return => match generators.remove(&task_id) {
            None => missing(entry),
            Some(mut generator) => match generator.close().await {
                Ok(()) => send_frame(
                    entry,
                    Frame::reply(Event::Yield, task_id, json!({"done": true})),
                ),
                Err(err) => send_throw(entry, task_id, &err),
            },
        },
        Event::Throw => match generators.remove(&task_id) {
            None => missing(entry),
            Some(mut generator) => {
                match generator.throw(ErrorObject::from_value(&input)).await {
                    Err(err) => send_throw(entry, task_id, &err),
                    // The generator swallowed the error; the task
                    // still terminates on both ends.
                    Ok(_) => send_frame(entry, Frame::reply(Event::Throw, task_id, Value::Null)),
                }
            }
        },
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Keepalive
// ---------------------------------------------------------------------------

/// Every 30 seconds: drop clients that never answered the previous
/// ping, then mark the rest unresponsive and ping them again.
async fn keepalive_loop(shared: Arc<ServerShared>) {
    let mut shutdown = shared.shutdown.subscribe();
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let entries: Vec<Arc<ConnEntry>> = shared
                    .clients
                    .read()
                    .expect("client table poisoned")
                    .values()
                    .cloned()
                    .collect();
                let now = now_millis();
                for entry in entries {
                    if entry.alive.load(Ordering::Acquire) {
                        entry.alive.store(false, Ordering::Release);
                        send_frame(&entry, Frame::ping(now));
                    } else {
                        warn!(client_id = %entry.id, "client unresponsive, dropping");
                        let _ = entry.tx.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: SLOW_CONNECTION.into(),
                        })));
                    }
                }
            }
        }
    }
}
