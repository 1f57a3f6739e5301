use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use getset::Getters;

/// A scalar value stored in a message property table.
///
/// AMQP header tables accept richer types, but the job queue only ever needs
/// scalars, so everything is narrowed down to these four shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

impl FieldValue {
    /// Returns the value as an integer, parsing string representations.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Float(v) if v.is_finite() => Some(*v as i64),
            FieldValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        FieldValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

/// Whether the broker should write the message to disk before confirming it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

/// Broker level metadata carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    pub message_id: Option<String>,
    /// Unix timestamp in seconds
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub app_id: Option<String>,
}

/// A message as handed to or received from the broker.
///
/// The property table holds custom metadata (attempt counters, serialized
/// job state, delay hints) and is kept ordered so that a message survives a
/// publish/receive round trip unchanged.
#[derive(Debug, Clone, Default, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct Message {
    body: Vec<u8>,
    properties: BTreeMap<String, FieldValue>,
    headers: MessageHeaders,
    routing_key: Option<String>,
    delivery_mode: DeliveryMode,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Message {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&FieldValue> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove_property(&mut self, name: &str) -> Option<FieldValue> {
        self.properties.remove(name)
    }

    pub fn headers_mut(&mut self) -> &mut MessageHeaders {
        &mut self.headers
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.message_id.as_deref()
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.headers.message_id = Some(id.into());
    }

    pub fn priority(&self) -> Option<u8> {
        self.headers.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.headers.priority = Some(priority);
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.headers.timestamp = Some(timestamp);
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.headers.content_type = Some(content_type.into());
    }

    pub fn set_app_id(&mut self, app_id: impl Into<String>) {
        self.headers.app_id = Some(app_id.into());
    }

    pub fn set_routing_key(&mut self, routing_key: impl Into<String>) {
        self.routing_key = Some(routing_key.into());
    }

    pub fn set_delivery_mode(&mut self, delivery_mode: DeliveryMode) {
        self.delivery_mode = delivery_mode;
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }
}

/// A message received from a queue, still owned by the broker until it is
/// acknowledged or rejected.
#[derive(Debug, Clone, PartialEq, Getters)]
#[getset(get = "pub")]
pub struct Delivery {
    message: Message,
    delivery_tag: u64,
    queue: String,
    redelivered: bool,
}

impl Delivery {
    pub fn new(message: Message, delivery_tag: u64, queue: impl Into<String>) -> Self {
        Delivery {
            message,
            delivery_tag,
            queue: queue.into(),
            redelivered: false,
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}
