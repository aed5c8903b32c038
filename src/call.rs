//! Client-side invocation engine.
//!
//! A [`RemoteCall`] is one task on the channel: it is created by
//! sending `[INVOKE, taskId, module, method, args]` and then consumed
//! either as a single awaited result ([`RemoteCall::result`]) or as a
//! two-way iterator ([`RemoteCall::next`] / [`RemoteCall::send_value`]
//! / [`RemoteCall::stop`] / [`RemoteCall::throw`]).  Both shapes share
//! the same frame-exchange primitive: every outgoing frame appends an
//! awaiter to the task's FIFO queue, and each incoming reply resolves
//! the queue head.  A task therefore has at most one frame in flight
//! per pending awaiter, and replies can never be mismatched.

use crate::channel::RpcError;
use crate::client::ClientShared;
use mux_protocol::{ErrorObject, Event, Frame};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Task slots
// ---------------------------------------------------------------------------

pub(crate) struct Awaiter {
    pub(crate) event: Event,
    /// The input the frame carried; used to resolve the awaiter when
    /// the connection drops before the reply arrives.
    pub(crate) data: Value,
    pub(crate) tx: oneshot::Sender<Result<Value, RpcError>>,
}

/// Per-task pending state, shared between the owning [`RemoteCall`]
/// and the connection's read pump.
pub(crate) struct TaskSlot {
    queue: Mutex<VecDeque<Awaiter>>,
    closed: AtomicBool,
}

impl TaskSlot {
    pub(crate) fn new() -> TaskSlot {
        TaskSlot {
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn push(&self, awaiter: Awaiter) {
        self.queue.lock().expect("task queue poisoned").push_back(awaiter);
    }

    fn pop(&self) -> Option<Awaiter> {
        self.queue.lock().expect("task queue poisoned").pop_front()
    }

    /// Resolve the head awaiter with a reply payload.
    pub(crate) fn resolve_next(&self, value: Value) {
        if let Some(awaiter) = self.pop() {
            let _ = awaiter.tx.send(Ok(value));
        }
    }

    /// Reject the head awaiter and close the task; the remaining queue
    /// is flushed with per-event terminal values.
    pub(crate) fn reject_next(&self, err: RpcError) {
        if let Some(awaiter) = self.pop() {
            let _ = awaiter.tx.send(Err(err));
        }
        self.close();
    }

    /// Close the task, resolving every queued awaiter so no caller is
    /// left pending: INVOKE resolves to null, YIELD to end-of-stream,
    /// RETURN to `{done, value}` with its own input, THROW rejects
    /// with its stored error.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<Awaiter> = {
            let mut queue = self.queue.lock().expect("task queue poisoned");
            queue.drain(..).collect()
        };
        for awaiter in drained {
            let outcome = match awaiter.event {
                Event::Invoke => Ok(Value::Null),
                Event::Yield => Ok(json!({"done": true, "value": null})),
                Event::Return => Ok(json!({"done": true, "value": awaiter.data})),
                Event::Throw => Err(RpcError::from_object(ErrorObject::from_value(
                    &awaiter.data,
                ))),
                _ => Ok(Value::Null),
            };
            let _ = awaiter.tx.send(outcome);
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteCall
// ---------------------------------------------------------------------------

/// A handle to one remote invocation.
///
/// Consume it as a future with [`RemoteCall::result`], or iterate the
/// remote generator with [`RemoteCall::next`].  After the task closes
/// (terminal reply, timeout, disconnect, or explicit stop) iterator
/// operations observe end-of-stream and `stop`/`throw` are no-ops.
impl std::fmt::Debug for RemoteCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCall")
            .field("module", &self.module)
            .field("method", &self.method)
            .field("task_id", &self.task_id)
            .finish()
    }
}

pub struct RemoteCall {
    client: Arc<ClientShared>,
    module: String,
    method: String,
    task_id: u64,
    slot: Arc<TaskSlot>,
    first: Option<oneshot::Receiver<Result<Value, RpcError>>>,
}

impl RemoteCall {
    pub(crate) fn start(
        client: Arc<ClientShared>,
        module: String,
        method: String,
        args: Vec<Value>,
    ) -> RemoteCall {
        let task_id = client.next_task_id();
        let mut call = RemoteCall {
            client,
            module,
            method,
            task_id,
            slot: Arc::new(TaskSlot::new()),
            first: None,
        };
        call.first = Some(call.send_op(Event::Invoke, args));
        call
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Await the single return value of the remote method.
    pub async fn result(mut self) -> Result<Value, RpcError> {
        let Some(rx) = self.first.take() else {
            return Err(RpcError::ConnectionClosed);
        };
        let outcome = self.wait(rx).await;
        self.finish();
        outcome
    }

    /// Advance the remote iterator; `Ok(None)` is end-of-stream.
    pub async fn next(&mut self) -> Result<Option<Value>, RpcError> {
        self.send_value(Value::Null).await
    }

    /// Advance the remote iterator, injecting a value.
    pub async fn send_value(&mut self, value: Value) -> Result<Option<Value>, RpcError> {
        if self.slot.is_closed() {
            return Ok(None);
        }
        let rx = self.send_op(Event::Yield, vec![value]);
        match self.wait(rx).await {
            Ok(step) => {
                if step.get("done").and_then(Value::as_bool) == Some(true) {
                    self.finish();
                    Ok(None)
                } else {
                    Ok(Some(step.get("value").cloned().unwrap_or(Value::Null)))
                }
            }
            Err(err) => {
                self.finish();
                Err(err)
            }
        }
    }

    /// Request remote iterator shutdown.
    pub async fn stop(&mut self) -> Result<(), RpcError> {
        if self.slot.is_closed() {
            return Ok(());
        }
        let rx = self.send_op(Event::Return, Vec::new());
        let outcome = self.wait(rx).await;
        self.finish();
        match outcome {
            Ok(step) if step.get("done").and_then(Value::as_bool) == Some(true) => Ok(()),
            Ok(_) => Err(RpcError::Remote(ErrorObject::new(
                "RuntimeError",
                "Generator must be closed after calling 'stop()'",
            ))),
            Err(err) => Err(err),
        }
    }

    /// Inject an error into the remote iterator.  The usual outcome is
    /// `Err` carrying the error the generator terminated with.
    pub async fn throw(&mut self, err: ErrorObject) -> Result<Value, RpcError> {
        if self.slot.is_closed() {
            return Ok(Value::Null);
        }
        let payload = serde_json::to_value(&err).unwrap_or(Value::Null);
        let rx = self.send_op(Event::Throw, vec![payload]);
        let outcome = self.wait(rx).await;
        self.finish();
        outcome
    }

    // -----------------------------------------------------------------------
    // Frame exchange primitive
    // -----------------------------------------------------------------------

    fn send_op(&self, event: Event, args: Vec<Value>) -> oneshot::Receiver<Result<Value, RpcError>> {
        let (tx, rx) = oneshot::channel();
        self.slot.push(Awaiter {
            event,
            data: args.first().cloned().unwrap_or(Value::Null),
            tx,
        });
        // Re-register after a disconnect flush removed the slot; the
        // awaiter must be queued before the frame hits the wire.
        self.client.register_task(self.task_id, self.slot.clone());
        self.client.send_frame(Frame::call(
            event,
            self.task_id,
            &self.module,
            &self.method,
            args,
        ));
        rx
    }

    async fn wait(
        &mut self,
        rx: oneshot::Receiver<Result<Value, RpcError>>,
    ) -> Result<Value, RpcError> {
        let millis = self.client.call_timeout();
        match tokio::time::timeout(Duration::from_millis(millis), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                // The awaiter at the head is ours; drop it so a late
                // reply cannot resolve a caller that already gave up.
                let _ = self.slot.pop();
                self.finish();
                Err(RpcError::Timeout {
                    callee: format!("{}.{}()", self.module, self.method),
                    millis,
                })
            }
        }
    }

    fn finish(&self) {
        self.slot.close();
        self.client.remove_task(self.task_id);
    }
}

impl Drop for RemoteCall {
    fn drop(&mut self) {
        self.finish();
    }
}
