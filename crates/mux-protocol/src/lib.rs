// mux-protocol: RPC channel wire protocol types and serialization.
//
// Every WebSocket text frame carries exactly one message frame: a JSON
// array `[event, taskId, ...payload]` with a small integer event tag at
// the head.  Malformed frames decode to `None` and are dropped by the
// channel pumps; they never abort a connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Event tags
// ---------------------------------------------------------------------------

/// Channel event tags, one per frame kind.
///
/// The numbering is part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Event {
    /// Server -> client, once, immediately after the upgrade.  The task
    /// slot carries the server identity string.
    Connect = 1,
    /// Client -> server: start a task.  Server -> client: ack for a
    /// generator invocation (clients treat it like `Return`).
    Invoke = 2,
    /// Server -> client: terminal value of a single call.  Client ->
    /// server: request generator shutdown.
    Return = 3,
    /// Either direction: an error object for the task.
    Throw = 4,
    /// Client -> server: advance a generator.  Server -> client: one
    /// `{done, value}` iterator step.
    Yield = 5,
    /// Server -> client broadcast; the task slot is the topic string.
    Publish = 6,
    /// Server -> client keepalive; the task slot is a millisecond timestamp.
    Ping = 7,
    /// Client -> server keepalive reply; the task slot is a millisecond
    /// timestamp.
    Pong = 8,
}

impl Event {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u64) -> Option<Event> {
        match tag {
            1 => Some(Event::Connect),
            2 => Some(Event::Invoke),
            3 => Some(Event::Return),
            4 => Some(Event::Throw),
            5 => Some(Event::Yield),
            6 => Some(Event::Publish),
            7 => Some(Event::Ping),
            8 => Some(Event::Pong),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task identifiers
// ---------------------------------------------------------------------------

/// The second frame element: a numeric task id for call traffic, or a
/// string for server-generated frames (`Connect` carries the server id,
/// `Publish` the topic).  `Ping`/`Pong` reuse the numeric form for
/// millisecond timestamps, which never collide with client task ids
/// because they live on distinct events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskId {
    Seq(u64),
    Name(String),
}

impl TaskId {
    pub fn seq(&self) -> Option<u64> {
        match self {
            TaskId::Seq(n) => Some(*n),
            TaskId::Name(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TaskId::Seq(_) => None,
            TaskId::Name(s) => Some(s),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            TaskId::Seq(n) => Value::from(*n),
            TaskId::Name(s) => Value::from(s.as_str()),
        }
    }

    fn from_value(value: &Value) -> Option<TaskId> {
        match value {
            Value::Number(n) => n.as_u64().map(TaskId::Seq),
            Value::String(s) => Some(TaskId::Name(s.clone())),
            _ => None,
        }
    }
}

impl From<u64> for TaskId {
    fn from(n: u64) -> TaskId {
        TaskId::Seq(n)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> TaskId {
        TaskId::Name(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One decoded message frame.
///
/// Client->server task frames carry `[module, method, args]` as payload;
/// server->client frames carry at most a single data element.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: Event,
    pub task: TaskId,
    pub payload: Vec<Value>,
}

impl Frame {
    pub fn new(event: Event, task: impl Into<TaskId>) -> Frame {
        Frame {
            event,
            task: task.into(),
            payload: Vec::new(),
        }
    }

    /// A server->client reply frame `[event, taskId, data]`.
    pub fn reply(event: Event, task: impl Into<TaskId>, data: Value) -> Frame {
        Frame {
            event,
            task: task.into(),
            payload: vec![data],
        }
    }

    /// A client->server task frame `[event, taskId, module, method, args]`.
    ///
    /// All four task events use this shape so the server can name the
    /// callee in its diagnostics.
    pub fn call(
        event: Event,
        task_id: u64,
        module: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Frame {
        Frame {
            event,
            task: TaskId::Seq(task_id),
            payload: vec![
                Value::from(module),
                Value::from(method),
                Value::Array(args),
            ],
        }
    }

    pub fn connect(server_id: &str) -> Frame {
        Frame {
            event: Event::Connect,
            task: TaskId::Name(server_id.to_owned()),
            payload: Vec::new(),
        }
    }

    pub fn publish(topic: &str, data: Value) -> Frame {
        Frame {
            event: Event::Publish,
            task: TaskId::Name(topic.to_owned()),
            payload: vec![data],
        }
    }

    pub fn ping(timestamp_ms: u64) -> Frame {
        Frame {
            event: Event::Ping,
            task: TaskId::Seq(timestamp_ms),
            payload: Vec::new(),
        }
    }

    pub fn pong(timestamp_ms: u64) -> Frame {
        Frame {
            event: Event::Pong,
            task: TaskId::Seq(timestamp_ms),
            payload: Vec::new(),
        }
    }

    /// First payload element, or `null` when the frame carries none.
    pub fn data(&self) -> Value {
        self.payload.first().cloned().unwrap_or(Value::Null)
    }

    /// Encode as the canonical JSON array text.
    pub fn encode(&self) -> String {
        let mut array = Vec::with_capacity(2 + self.payload.len());
        array.push(Value::from(self.event.tag()));
        array.push(self.task.to_value());
        array.extend(self.payload.iter().cloned());
        Value::Array(array).to_string()
    }

    /// Decode one frame from JSON text.
    ///
    /// Returns `None` for anything that is not a well-formed frame: not
    /// JSON, not an array, unknown event tag, or a task id that is
    /// neither an unsigned integer nor a string.
    pub fn decode(text: &str) -> Option<Frame> {
        let value: Value = serde_json::from_str(text).ok()?;
        let array = value.as_array()?;
        let event = Event::from_tag(array.first()?.as_u64()?)?;
        let task = TaskId::from_value(array.get(1)?)?;
        Some(Frame {
            event,
            task,
            payload: array[2..].to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Error objects
// ---------------------------------------------------------------------------

/// The wire representation of an error, carried by `Throw` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorObject {
    pub fn new(name: &str, message: impl Into<String>) -> ErrorObject {
        ErrorObject {
            name: name.to_owned(),
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    /// Reconstruct an error object from an arbitrary `Throw` payload.
    ///
    /// Accepts the canonical `{name, message, ...}` object, a bare
    /// string, or anything else (reported as an unexpected exception).
    pub fn from_value(data: &Value) -> ErrorObject {
        match data {
            Value::Object(map) if map.get("message").is_some_and(Value::is_string) => {
                let field = |key: &str| {
                    map.get(key)
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned)
                };
                ErrorObject {
                    name: field("name").unwrap_or_else(|| "Error".to_owned()),
                    message: field("message").unwrap_or_default(),
                    code: field("code"),
                    stack: field("stack"),
                }
            }
            Value::String(message) => ErrorObject::new("Error", message.clone()),
            other => ErrorObject::new("Error", format!("Unexpected exception: {other}")),
        }
    }

    /// Map `{name, code}` back onto a canonical error kind so callers
    /// can pattern-match instead of string-compare.
    pub fn kind(&self) -> ErrorKind {
        let code = self.code.as_deref().unwrap_or("");
        match () {
            _ if matches!(code, "MODULE_NOT_FOUND" | "ERR_MODULE_NOT_FOUND") => {
                ErrorKind::ModuleNotFound
            }
            _ if matches!(code, "ERR_BUFFER_TOO_LARGE" | "ERR_OUTOFMEMORY") => ErrorKind::Overflow,
            _ if matches!(
                code,
                "ERR_INVALID_URI" | "ERR_INVALID_URL" | "ERR_INVALID_IP_ADDRESS"
            ) =>
            {
                ErrorKind::InvalidValue
            }
            _ if self.name == "ReferenceError" => ErrorKind::Reference,
            _ if self.name == "NameError" => ErrorKind::Name,
            _ if matches!(self.name.as_str(), "SyntaxError" | "EvalError") => ErrorKind::Syntax,
            _ if matches!(self.name.as_str(), "OverflowError" | "RangeError")
                || code == "ERR_OUT_OF_RANGE" =>
            {
                ErrorKind::Overflow
            }
            _ if self.name == "TypeError"
                || matches!(
                    code,
                    "ERR_MISSING_ARGS" | "ERR_INVALID_TUPLE" | "ERR_INVALID_THIS"
                ) =>
            {
                ErrorKind::Type
            }
            _ if self.name == "AssertionError" => ErrorKind::Assertion,
            _ if self.name == "SystemError" || code == "ERR_SYSTEM_ERROR" => ErrorKind::System,
            _ => ErrorKind::Other,
        }
    }
}

/// Canonical error kinds reconstructed from `{name, code}` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ModuleNotFound,
    Overflow,
    InvalidValue,
    Reference,
    Name,
    Syntax,
    Type,
    Assertion,
    System,
    Other,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Keepalive timestamps are millisecond-scale; a 10-digit value is
/// seconds-scale from an older peer and gets promoted.
pub fn normalize_millis(ts: u64) -> u64 {
    if (1_000_000_000..10_000_000_000).contains(&ts) {
        ts * 1000
    } else {
        ts
    }
}
