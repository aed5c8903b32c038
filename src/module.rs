//! Service modules and dispatch classification.
//!
//! A module is a named singleton served by an [`crate::server::RpcServer`].
//! Its [`Module::dispatch`] implementation maps a method name plus JSON
//! arguments onto one of three result shapes:
//!
//! - [`Dispatch::Value`]: a plain value, returned as-is.
//! - [`Dispatch::Future`]: an awaitable resolving to the return value.
//! - [`Dispatch::Generator`]: a two-way generator driven by the
//!   client's `Yield`/`Return`/`Throw` frames.
//!
//! Readiness gates dispatch: a record whose singleton has not completed
//! its lifecycle phase rejects invocations with the unavailability
//! error.

use crate::channel::RpcError;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use mux_protocol::ErrorObject;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

// ---------------------------------------------------------------------------
// Module trait
// ---------------------------------------------------------------------------

/// A service module singleton.
///
/// `init` and `destroy` are lifecycle hooks awaited by the server's
/// `open()`/`close()` when the lifecycle phase is enabled; the defaults
/// are no-ops.
pub trait Module: Send + Sync + 'static {
    /// Resolve and start one method call.
    ///
    /// Unknown methods should return [`unknown_method`].
    fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Dispatch, RpcError>;

    fn init(&self) -> BoxFuture<'static, Result<(), RpcError>> {
        Box::pin(async { Ok(()) })
    }

    fn destroy(&self) -> BoxFuture<'static, Result<(), RpcError>> {
        Box::pin(async { Ok(()) })
    }
}

/// The classified outcome of a method invocation.
pub enum Dispatch {
    Value(Value),
    Future(BoxFuture<'static, Result<Value, RpcError>>),
    Generator(Box<dyn Generator>),
}

impl Dispatch {
    /// Convenience for async unary methods.
    pub fn future<F>(fut: F) -> Dispatch
    where
        F: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Dispatch::Future(Box::pin(fut))
    }

    /// Convenience for one-way streams (input values are ignored).
    pub fn stream<S>(stream: S) -> Dispatch
    where
        S: futures_util::Stream<Item = Result<Value, RpcError>> + Send + 'static,
    {
        Dispatch::Generator(Box::new(StreamGenerator {
            stream: stream.boxed(),
        }))
    }
}

/// The error a module returns for a method it does not implement.
pub fn unknown_method(module: &str, method: &str) -> RpcError {
    RpcError::Remote(ErrorObject::new(
        "TypeError",
        format!("{module}.{method} is not a function"),
    ))
}

// ---------------------------------------------------------------------------
// Generators
// ---------------------------------------------------------------------------

/// A server-side generator: the open half of a client's iterator task.
///
/// `resume` advances the generator with the client-sent input and
/// resolves to `Ok(Some(value))` for a step, `Ok(None)` on exhaustion,
/// or `Err` when the generator raises.  `throw` injects an error; the
/// default rethrows it, terminating the generator.  `close` releases
/// resources on explicit shutdown or connection loss.
pub trait Generator: Send {
    fn resume(&mut self, input: Value) -> BoxFuture<'_, Result<Option<Value>, RpcError>>;

    fn throw(&mut self, err: ErrorObject) -> BoxFuture<'_, Result<Option<Value>, RpcError>> {
        let rethrown = RpcError::from_object(err);
        Box::pin(async move { Err(rethrown) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), RpcError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Adapts a one-way `Stream` into a [`Generator`]; client-sent inputs
/// are discarded, which matches plain `yield`-only generators.
pub struct StreamGenerator {
    stream: BoxStream<'static, Result<Value, RpcError>>,
}

impl Generator for StreamGenerator {
    fn resume(&mut self, _input: Value) -> BoxFuture<'_, Result<Option<Value>, RpcError>> {
        Box::pin(async move {
            match self.stream.next().await {
                Some(Ok(value)) => Ok(Some(value)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), RpcError>> {
        // Dropping the stream cancels any pending work.
        self.stream = futures_util::stream::empty().boxed();
        Box::pin(async { Ok(()) })
    }
}

// ---------------------------------------------------------------------------
// Registry records
// ---------------------------------------------------------------------------

/// One registered module: factory, lazily materialized singleton, and
/// the readiness gate.
pub(crate) struct ModuleRecord {
    factory: Box<dyn Fn() -> Arc<dyn Module> + Send + Sync>,
    singleton: OnceLock<Arc<dyn Module>>,
    ready: AtomicBool,
}

impl ModuleRecord {
    pub(crate) fn new(factory: Box<dyn Fn() -> Arc<dyn Module> + Send + Sync>) -> ModuleRecord {
        ModuleRecord {
            factory,
            singleton: OnceLock::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// The singleton, constructing it on first use.
    pub(crate) fn instance(&self) -> Arc<dyn Module> {
        self.singleton.get_or_init(|| (self.factory)()).clone()
    }

    /// The singleton if it has ever been materialized.
    pub(crate) fn materialized(&self) -> Option<Arc<dyn Module>> {
        self.singleton.get().cloned()
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}
