//! Channel configuration and DSN normalization.
//!
//! Every channel endpoint (server or client) is configured from one of
//! three shapes: a full [`ChannelOptions`] struct, a bare port number
//! (optionally with a host), or a URL string.  All three normalize into
//! a validated [`ChannelConfig`] carrying the scheme, address, identity
//! and timing knobs, plus the canonical DSN used as the default server
//! identity.
//!
//! URL strings that are not `ws:`/`wss:` prefixed are treated as unix
//! socket paths: `"/tmp/app.sock"` and `"run/app.sock"` both become
//! `ws+unix` channels (the latter resolved against the current working
//! directory).

use futures_util::future::BoxFuture;
use mux_protocol::ErrorObject;
use std::sync::{Arc, Mutex};
use tokio_tungstenite::tungstenite::http::Uri;

pub const DEFAULT_MAX_DELAY_MS: u64 = 5000;
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// All errors surfaced by channel operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The named module has no ready instance (local or remote).
    #[error("Service {0} is not available")]
    ServiceUnavailable(String),

    /// A remote call outlived its per-call timeout window.
    #[error("{callee} timeout after {:?}s", *.millis as f64 / 1000.0)]
    Timeout { callee: String, millis: u64 },

    /// An error raised by the remote method, reconstructed from a
    /// `Throw` frame.  Match on [`ErrorObject::kind`] for the canonical
    /// classification.
    #[error("{}", .0.message)]
    Remote(ErrorObject),

    /// The peer did not complete the `[CONNECT, serverId]` handshake.
    #[error("Cannot connect to {0}")]
    HandshakeFailed(String),

    /// `open()` on a channel that is already connected.
    #[error("Channel to {0} is already open")]
    AlreadyOpen(String),

    /// `open()` after `close()`; closed channels never redial.
    #[error("Cannot reconnect to {0} after closing the channel")]
    ChannelClosed(String),

    /// The connection went away while a reply was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid channel configuration.
    #[error("{0}")]
    Config(String),

    /// Transport-level failure (dial, TLS, socket I/O).
    #[error("WebSocket: {0}")]
    Ws(String),
}

impl RpcError {
    /// Reconstruct from a wire error object, mapping the unavailability
    /// shape back onto [`RpcError::ServiceUnavailable`] so callers can
    /// pattern-match it.
    pub fn from_object(obj: ErrorObject) -> RpcError {
        if obj.name == "ReferenceError" {
            if let Some(module) = obj
                .message
                .strip_prefix("Service ")
                .and_then(|rest| rest.strip_suffix(" is not available"))
            {
                return RpcError::ServiceUnavailable(module.to_owned());
            }
        }
        RpcError::Remote(obj)
    }

    /// The wire representation sent in `Throw` frames.
    pub fn to_object(&self) -> ErrorObject {
        match self {
            RpcError::Remote(obj) => obj.clone(),
            RpcError::ServiceUnavailable(_) => ErrorObject::new("ReferenceError", self.to_string()),
            RpcError::Timeout { .. } => ErrorObject::new("TimeoutError", self.to_string()),
            other => ErrorObject::new("Error", other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Error hook
// ---------------------------------------------------------------------------

/// Channel error hook.  Returning a future schedules it fire-and-forget.
pub type ErrorHook = Arc<dyn Fn(RpcError) -> Option<BoxFuture<'static, ()>> + Send + Sync>;

/// Swappable error sink shared by a channel and its background tasks.
/// The default hook logs through `tracing::error!`.
pub(crate) struct ErrorHandler {
    hook: Mutex<ErrorHook>,
}

impl ErrorHandler {
    pub(crate) fn new() -> ErrorHandler {
        let default_hook: ErrorHook = Arc::new(|err: RpcError| {
            tracing::error!(error = %err, "channel error");
            None
        });
        ErrorHandler {
            hook: Mutex::new(default_hook),
        }
    }

    pub(crate) fn set(&self, hook: ErrorHook) {
        *self.hook.lock().expect("error hook poisoned") = hook;
    }

    pub(crate) fn report(&self, err: RpcError) {
        let hook = self.hook.lock().expect("error hook poisoned").clone();
        if let Some(fut) = hook(err) {
            tokio::spawn(fut);
        }
    }
}

// ---------------------------------------------------------------------------
// TLS context
// ---------------------------------------------------------------------------

/// Opaque TLS material.  Loading certificates and keys is the caller's
/// concern; the channel only threads the config through to rustls.
#[derive(Clone)]
pub enum TlsContext {
    Client(Arc<rustls::ClientConfig>),
    Server(Arc<rustls::ServerConfig>),
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsContext::Client(_) => f.write_str("TlsContext::Client"),
            TlsContext::Server(_) => f.write_str("TlsContext::Server"),
        }
    }
}

// ---------------------------------------------------------------------------
// Options and addresses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ws,
    Wss,
    WsUnix,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::WsUnix => "ws+unix",
        }
    }
}

/// Explicit channel options; unset fields fall back to defaults
/// (`ws://localhost:80/`, JSON codec, 5 s timing windows).
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    pub scheme: Option<Scheme>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub pathname: Option<String>,
    pub id: Option<String>,
    pub secret: Option<String>,
    pub codec: Option<String>,
    pub tls: Option<TlsContext>,
    pub max_delay: Option<u64>,
    pub timeout: Option<u64>,
    pub server_id: Option<String>,
}

/// The three accepted configuration shapes.
#[derive(Debug, Clone)]
pub enum ChannelAddr {
    Options(Box<ChannelOptions>),
    Port { port: u16, host: Option<String> },
    Url(String),
}

impl From<ChannelOptions> for ChannelAddr {
    fn from(options: ChannelOptions) -> ChannelAddr {
        ChannelAddr::Options(Box::new(options))
    }
}

impl From<u16> for ChannelAddr {
    fn from(port: u16) -> ChannelAddr {
        ChannelAddr::Port { port, host: None }
    }
}

impl From<&str> for ChannelAddr {
    fn from(url: &str) -> ChannelAddr {
        ChannelAddr::Url(url.to_owned())
    }
}

impl From<String> for ChannelAddr {
    fn from(url: String) -> ChannelAddr {
        ChannelAddr::Url(url)
    }
}

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

/// Normalized, validated channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub scheme: Scheme,
    pub hostname: String,
    pub port: u16,
    pub pathname: String,
    pub id: String,
    pub secret: String,
    pub codec: String,
    pub tls: Option<TlsContext>,
    pub max_delay: u64,
    pub timeout: u64,
    pub server_id: String,
}

impl ChannelConfig {
    pub fn from_addr(addr: impl Into<ChannelAddr>) -> Result<ChannelConfig, RpcError> {
        let mut config = ChannelConfig {
            scheme: Scheme::Ws,
            hostname: "localhost".to_owned(),
            port: 80,
            pathname: "/".to_owned(),
            id: String::new(),
            secret: String::new(),
            codec: "JSON".to_owned(),
            tls: None,
            max_delay: DEFAULT_MAX_DELAY_MS,
            timeout: DEFAULT_TIMEOUT_MS,
            server_id: String::new(),
        };

        match addr.into() {
            ChannelAddr::Options(options) => config.apply_options(*options),
            ChannelAddr::Port { port, host } => {
                config.scheme = Scheme::Ws;
                config.port = port;
                if let Some(host) = host {
                    config.hostname = host;
                }
            }
            ChannelAddr::Url(url) => config.apply_url(&url)?,
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_options(&mut self, options: ChannelOptions) {
        if let Some(scheme) = options.scheme {
            self.scheme = scheme;
        }
        if let Some(hostname) = options.hostname {
            self.hostname = hostname;
        }
        if let Some(port) = options.port {
            self.port = port;
        }
        if let Some(pathname) = options.pathname {
            self.pathname = pathname;
        }
        if let Some(id) = options.id {
            self.id = id;
        }
        if let Some(secret) = options.secret {
            self.secret = secret;
        }
        if let Some(codec) = options.codec {
            self.codec = codec;
        }
        if let Some(max_delay) = options.max_delay {
            self.max_delay = max_delay;
        }
        if let Some(timeout) = options.timeout {
            self.timeout = timeout;
        }
        if let Some(server_id) = options.server_id {
            self.server_id = server_id;
        }
        self.tls = options.tls;
    }

    fn apply_url(&mut self, url: &str) -> Result<(), RpcError> {
        let is_abs_path = url.starts_with('/');
        let full: String = if url.starts_with("ws:") || url.starts_with("wss:") {
            url.to_owned()
        } else {
            // Anything else is a unix socket path, absolute or relative
            // to the current working directory.
            let mut base = "ws+unix://localhost:80".to_owned();
            if !is_abs_path {
                base.push('/');
            }
            base + url
        };

        let uri: Uri = full
            .parse()
            .map_err(|_| RpcError::Config(format!("invalid channel URL: {url}")))?;

        let scheme = match uri.scheme_str() {
            Some("ws") => Scheme::Ws,
            Some("wss") => Scheme::Wss,
            Some("ws+unix") => Scheme::WsUnix,
            other => {
                return Err(RpcError::Config(format!(
                    "unsupported channel scheme: {}",
                    other.unwrap_or("")
                )));
            }
        };
        self.scheme = scheme;

        for (key, value) in parse_query(uri.query().unwrap_or("")) {
            match key.as_str() {
                "id" => self.id = value,
                "secret" => self.secret = value,
                "codec" => self.codec = value,
                _ => {}
            }
        }

        if scheme == Scheme::WsUnix {
            self.hostname = String::new();
            self.port = 0;
            let path = uri.path();
            if is_abs_path {
                self.pathname = path.to_owned();
            } else if path != "/" {
                let cwd = std::env::current_dir()
                    .map_err(|e| RpcError::Config(format!("cannot resolve socket path: {e}")))?;
                self.pathname = cwd
                    .join(path.trim_start_matches('/'))
                    .to_string_lossy()
                    .into_owned();
            } else {
                return Err(RpcError::Config("IPC requires a pathname".to_owned()));
            }
        } else {
            if let Some(host) = uri.host() {
                self.hostname = host.to_owned();
            }
            if let Some(port) = uri.port_u16() {
                self.port = port;
            }
            self.pathname = if uri.path().is_empty() {
                "/".to_owned()
            } else {
                uri.path().to_owned()
            };
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), RpcError> {
        if self.scheme == Scheme::WsUnix && !cfg!(unix) {
            return Err(RpcError::Config(
                "IPC on this platform is currently not supported".to_owned(),
            ));
        }
        if self.codec != "JSON" {
            return Err(RpcError::Config(
                "Only 'JSON' is supported by this implementation".to_owned(),
            ));
        }
        if self.scheme == Scheme::Wss && self.tls.is_none() {
            return Err(RpcError::Config(
                "'tls' must be provided for 'wss:' protocol".to_owned(),
            ));
        }
        if self.scheme == Scheme::WsUnix && self.pathname == "/" {
            return Err(RpcError::Config("IPC requires a pathname".to_owned()));
        }
        Ok(())
    }

    /// Canonical server address: `ipc:<path>` for unix sockets,
    /// `rpc://<host>:<port>` otherwise.  Used as the default identity.
    pub fn dsn(&self) -> String {
        match self.scheme {
            Scheme::WsUnix => format!("ipc:{}", self.pathname),
            _ => format!("rpc://{}:{}", self.hostname, self.port),
        }
    }

    /// The request URL used when dialing this channel.
    pub(crate) fn request_url(&self) -> String {
        let mut url = match self.scheme {
            // Unix sockets perform the WebSocket handshake against a
            // placeholder authority; the stream itself targets the path.
            Scheme::WsUnix => format!("ws://localhost/?id={}", self.id),
            scheme => format!(
                "{}://{}:{}{}?id={}",
                scheme.as_str(),
                self.hostname,
                self.port,
                self.pathname,
                self.id
            ),
        };
        if !self.secret.is_empty() {
            url.push_str("&secret=");
            url.push_str(&self.secret);
        }
        url
    }
}

/// Minimal query-string splitter; channel ids and secrets are URL-safe
/// by contract, so no percent-decoding is applied.
pub(crate) fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_owned(), value.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

/// Connection state shared by both channel roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initiated,
    Connecting,
    Connected,
    Closed,
}

/// Writer half of a connection: drains the outbound queue into the
/// socket and closes the sink when the queue ends or a close frame is
/// flushed.  Dropping every sender tears the connection down.
pub(crate) async fn write_pump<S>(
    mut sink: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<S>,
        tokio_tungstenite::tungstenite::protocol::Message,
    >,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<tokio_tungstenite::tungstenite::protocol::Message>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    use futures_util::SinkExt;
    use tokio_tungstenite::tungstenite::protocol::Message;

    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || is_close {
            break;
        }
    }
    let _ = sink.close().await;
}
