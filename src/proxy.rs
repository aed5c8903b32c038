//! Client-side module proxies and multi-server routing.
//!
//! A [`ModuleProxy`] is the explicit registry entry for one named
//! remote module.  Every client registered for the module contributes
//! a [`RemoteHandle`] keyed by that server's identity; the proxy's
//! call-site selection picks one deterministic handle per route value
//! among the ready subset, so redundant servers share traffic without
//! coordination.

use crate::call::RemoteCall;
use crate::channel::RpcError;
use crate::client::ClientShared;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Remote handles
// ---------------------------------------------------------------------------

/// One server's instance of a module, reachable through one client
/// channel.  Readiness mirrors the channel state (and manual
/// pause/resume); routed calls only consider ready handles.
pub struct RemoteHandle {
    module: String,
    client: Arc<ClientShared>,
    ready: AtomicBool,
}

impl RemoteHandle {
    pub(crate) fn new(module: String, client: Arc<ClientShared>) -> RemoteHandle {
        RemoteHandle {
            module,
            client,
            ready: AtomicBool::new(false),
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Start a call on this handle regardless of readiness (direct,
    /// key-addressed calls intentionally skip the ready filter).
    pub fn call(&self, method: &str, args: Vec<Value>) -> RemoteCall {
        RemoteCall::start(
            self.client.clone(),
            self.module.clone(),
            method.to_owned(),
            args,
        )
    }
}

// ---------------------------------------------------------------------------
// Module proxies
// ---------------------------------------------------------------------------

/// The explicit registry handle for a named remote module.
pub struct ModuleProxy {
    name: String,
    singletons: Mutex<IndexMap<String, Arc<RemoteHandle>>>,
}

impl ModuleProxy {
    pub fn new(name: impl Into<String>) -> Arc<ModuleProxy> {
        Arc::new(ModuleProxy {
            name: name.into(),
            singletons: Mutex::new(IndexMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route and start a remote call.
    ///
    /// The route is `args[0]` when present (empty string otherwise).
    /// A string route that exactly names a server id addresses that
    /// handle directly; anything else selects deterministically among
    /// the ready handles by `route_id(route) % count` over insertion
    /// order.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<RemoteCall, RpcError> {
        let route = args
            .first()
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
        let table = self.singletons.lock().expect("singleton table poisoned");

        if let Value::String(key) = &route {
            if let Some(handle) = table.get(key) {
                return Ok(handle.call(method, args));
            }
        }

        let ready: Vec<Arc<RemoteHandle>> =
            table.values().filter(|h| h.ready()).cloned().collect();
        drop(table);

        match ready.len() {
            0 => Err(RpcError::ServiceUnavailable(self.name.clone())),
            1 => Ok(ready[0].call(method, args)),
            count => {
                let index = (route_id(&route) % count as u64) as usize;
                Ok(ready[index].call(method, args))
            }
        }
    }

    /// The handle contributed by a particular server, if any.
    pub fn handle(&self, server_id: &str) -> Option<Arc<RemoteHandle>> {
        self.singletons
            .lock()
            .expect("singleton table poisoned")
            .get(server_id)
            .cloned()
    }

    /// Server ids currently contributing handles, in insertion order.
    pub fn server_ids(&self) -> Vec<String> {
        self.singletons
            .lock()
            .expect("singleton table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn insert_handle(&self, server_id: &str, handle: Arc<RemoteHandle>) {
        self.singletons
            .lock()
            .expect("singleton table poisoned")
            .insert(server_id.to_owned(), handle);
    }

    pub(crate) fn set_handle_ready(&self, server_id: &str, ready: bool) {
        if let Some(handle) = self
            .singletons
            .lock()
            .expect("singleton table poisoned")
            .get(server_id)
        {
            handle.set_ready(ready);
        }
    }

    /// Move a handle under a new server identity (learned from the
    /// `CONNECT` frame across a reconnect).
    pub(crate) fn rekey(&self, old_id: &str, new_id: &str) {
        let mut table = self.singletons.lock().expect("singleton table poisoned");
        if let Some(handle) = table.shift_remove(old_id) {
            table.insert(new_id.to_owned(), handle);
        }
    }
}

// ---------------------------------------------------------------------------
// Route hashing
// ---------------------------------------------------------------------------

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x1_0000_0001_b3;

/// FNV-1a 64 over a byte string.  Part of the routing contract: every
/// implementation must hash identically for interop.
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic route key evaluation.
///
/// Null maps to 0, booleans and numbers to their (truncated) integer
/// value, strings to the absolute value of their FNV-1a 64 hash, and
/// everything else to the hash of its JSON serialization.
pub fn route_id(route: &Value) -> u64 {
    match route {
        Value::Null => 0,
        Value::Bool(flag) => u64::from(*flag),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0)
            .unsigned_abs(),
        Value::String(s) => (fnv1a_64(s.as_bytes()) as i64).unsigned_abs(),
        other => (fnv1a_64(other.to_string().as_bytes()) as i64).unsigned_abs(),
    }
}
