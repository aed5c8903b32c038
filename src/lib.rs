//! muxrpc: multiplexed RPC over WebSockets.
//!
//! Named service modules are hosted as per-server singletons and
//! invoked remotely over a single persistent WebSocket channel (TCP,
//! TLS, or unix domain socket).  A channel multiplexes any number of
//! concurrent tasks: unary calls, two-way generator streams, pub/sub
//! broadcasts, and keepalive traffic.  Clients route each call across
//! the redundant servers registered for a module and reconnect
//! automatically when a server goes away.
//!
//! ```no_run
//! use muxrpc::{App, Dispatch, Module, RpcError};
//! use serde_json::{json, Value};
//!
//! struct Greeter;
//!
//! impl Module for Greeter {
//!     fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Dispatch, RpcError> {
//!         match method {
//!             "greet" => Ok(Dispatch::Value(json!(format!(
//!                 "hello {}",
//!                 args.first().and_then(Value::as_str).unwrap_or("world")
//!             )))),
//!             _ => Err(muxrpc::module::unknown_method("greeter", method)),
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), RpcError> {
//! let server = muxrpc::RpcServer::new("ws://127.0.0.1:18888/svc")?;
//! server.register("greeter", || Greeter);
//! server.open(true).await?;
//!
//! let app = App::new();
//! let client = App::connect("ws://127.0.0.1:18888/svc?id=c1").await?;
//! let greeter = app.proxy("greeter");
//! client.register(&greeter);
//!
//! let reply = greeter.call("greet", vec![json!("mux")])?.result().await?;
//! assert_eq!(reply, json!("hello mux"));
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod channel;
pub mod client;
pub mod module;
pub mod proxy;
pub mod server;

pub use call::RemoteCall;
pub use channel::{
    ChannelAddr, ChannelConfig, ChannelOptions, ErrorHook, RpcError, Scheme, TlsContext,
};
pub use client::{RpcClient, TopicHandler};
pub use module::{Dispatch, Generator, Module, StreamGenerator};
pub use mux_protocol::{now_millis, ErrorKind, ErrorObject, Event, Frame, TaskId};
pub use proxy::{ModuleProxy, RemoteHandle};
pub use server::RpcServer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Application entry points plus a per-app cache of module proxies, so
/// every part of a process shares one proxy (and one remote-singleton
/// table) per module name.
#[derive(Default)]
pub struct App {
    proxies: Mutex<HashMap<String, Arc<ModuleProxy>>>,
}

impl App {
    pub fn new() -> App {
        App::default()
    }

    /// The shared proxy for a module name.
    pub fn proxy(&self, name: &str) -> Arc<ModuleProxy> {
        self.proxies
            .lock()
            .expect("proxy cache poisoned")
            .entry(name.to_owned())
            .or_insert_with(|| ModuleProxy::new(name))
            .clone()
    }

    /// Bind a server and run its lifecycle phase.  Use
    /// [`RpcServer::new`] directly to defer `open()`.
    pub async fn serve(addr: impl Into<ChannelAddr>) -> Result<RpcServer, RpcError> {
        let server = RpcServer::new(addr)?;
        server.open(true).await?;
        Ok(server)
    }

    /// Open a client channel.  Use [`RpcClient::new`] directly to
    /// defer dialing.
    pub async fn connect(addr: impl Into<ChannelAddr>) -> Result<RpcClient, RpcError> {
        let client = RpcClient::new(addr)?;
        client.open().await?;
        Ok(client)
    }
}
