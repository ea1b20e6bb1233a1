//! Introspection capability for host events.
//!
//! The relay has to accept an open-ended set of event types that it knows
//! nothing about at compile time. Every event (and every object reachable
//! from one) is seen through the [`Inspect`] trait: a type name, the list of
//! capabilities it declares, and a set of named zero-argument accessors that
//! return [`Reflected`] values.
//!
//! Hosts either implement [`Inspect`] once per integrated event type or use
//! [`DynamicObject`], whose accessors are closures.
//!
//! # Example
//!
//! ```rust
//! use event_relay::inspect::DynamicObject;
//!
//! let event = DynamicObject::new("OCA\\Files\\Event\\NodeCreatedEvent")
//!     .implements("OCP\\EventDispatcher\\Event")
//!     .value("getPath", "/alice/files/report.pdf")
//!     .value("isDirectory", false);
//! ```

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Failure raised by a single accessor invocation.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct AccessError(pub String);

impl AccessError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result of invoking an accessor.
pub type AccessResult<T> = Result<T, AccessError>;

/// An object the relay can look into without knowing its concrete type.
pub trait Inspect: Send + Sync {
    /// Concrete type name, e.g. `OCA\Files\Event\NodeCreatedEvent`.
    fn type_name(&self) -> String;

    /// Capabilities implemented by the type, in declaration order.
    fn interfaces(&self) -> Vec<String> {
        Vec::new()
    }

    /// Names of all public zero-argument instance methods, in declaration order.
    fn accessors(&self) -> Vec<String>;

    /// Invoke the accessor `name`.
    ///
    /// Returns `None` when the type has no such accessor.
    fn call(&self, name: &str) -> Option<AccessResult<Reflected>>;

    /// Self-serialization, for types that know how to render themselves as JSON.
    fn json_value(&self) -> Option<AccessResult<Value>> {
        None
    }

    /// String conversion, for types that have one.
    fn display(&self) -> Option<AccessResult<String>> {
        None
    }
}

/// A value returned by an accessor.
#[derive(Clone)]
pub enum Reflected {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Reflected>),
    /// Keyed collection; insertion order is kept.
    Map(Vec<(String, Reflected)>),
    DateTime(DateTime<FixedOffset>),
    Object(Arc<dyn Inspect>),
}

impl fmt::Debug for Reflected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reflected::Null => write!(f, "Null"),
            Reflected::Bool(b) => write!(f, "Bool({b})"),
            Reflected::Int(i) => write!(f, "Int({i})"),
            Reflected::Float(x) => write!(f, "Float({x})"),
            Reflected::Str(s) => write!(f, "Str({s:?})"),
            Reflected::List(items) => f.debug_tuple("List").field(items).finish(),
            Reflected::Map(entries) => f.debug_tuple("Map").field(entries).finish(),
            Reflected::DateTime(dt) => write!(f, "DateTime({})", dt.to_rfc3339()),
            Reflected::Object(obj) => write!(f, "Object({})", obj.type_name()),
        }
    }
}

impl Reflected {
    /// Wrap an inspectable object.
    pub fn object<T: Inspect + 'static>(value: T) -> Self {
        Reflected::Object(Arc::new(value))
    }
}

impl From<bool> for Reflected {
    fn from(value: bool) -> Self {
        Reflected::Bool(value)
    }
}

impl From<i32> for Reflected {
    fn from(value: i32) -> Self {
        Reflected::Int(value.into())
    }
}

impl From<i64> for Reflected {
    fn from(value: i64) -> Self {
        Reflected::Int(value)
    }
}

impl From<u32> for Reflected {
    fn from(value: u32) -> Self {
        Reflected::Int(value.into())
    }
}

impl From<f64> for Reflected {
    fn from(value: f64) -> Self {
        Reflected::Float(value)
    }
}

impl From<&str> for Reflected {
    fn from(value: &str) -> Self {
        Reflected::Str(value.to_string())
    }
}

impl From<String> for Reflected {
    fn from(value: String) -> Self {
        Reflected::Str(value)
    }
}

impl From<DateTime<FixedOffset>> for Reflected {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Reflected::DateTime(value)
    }
}

impl From<DateTime<Utc>> for Reflected {
    fn from(value: DateTime<Utc>) -> Self {
        Reflected::DateTime(value.fixed_offset())
    }
}

impl From<Arc<dyn Inspect>> for Reflected {
    fn from(value: Arc<dyn Inspect>) -> Self {
        Reflected::Object(value)
    }
}

impl<T: Into<Reflected>> From<Option<T>> for Reflected {
    fn from(value: Option<T>) -> Self {
        value.map_or(Reflected::Null, Into::into)
    }
}

impl<T: Into<Reflected>> From<Vec<T>> for Reflected {
    fn from(value: Vec<T>) -> Self {
        Reflected::List(value.into_iter().map(Into::into).collect())
    }
}

/// Plain JSON maps onto the reflected domain one to one.
impl From<Value> for Reflected {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Reflected::Null,
            Value::Bool(b) => Reflected::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Reflected::Int(i),
                None => Reflected::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Reflected::Str(s),
            Value::Array(items) => Reflected::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                Reflected::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

type AccessorFn = Arc<dyn Fn() -> AccessResult<Reflected> + Send + Sync>;
type JsonFn = Arc<dyn Fn() -> AccessResult<Value> + Send + Sync>;
type DisplayFn = Arc<dyn Fn() -> AccessResult<String> + Send + Sync>;

/// An [`Inspect`] implementation assembled at runtime.
///
/// Accessors are closures, so a `DynamicObject` can describe anything from a
/// forwarded JSON event to a self-referential object graph.
#[derive(Clone)]
pub struct DynamicObject {
    type_name: String,
    interfaces: Vec<String>,
    accessors: Vec<(String, AccessorFn)>,
    json: Option<JsonFn>,
    display: Option<DisplayFn>,
}

impl DynamicObject {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            interfaces: Vec::new(),
            accessors: Vec::new(),
            json: None,
            display: None,
        }
    }

    /// Declare a capability.
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Add an accessor that always returns `value`.
    pub fn value(self, name: impl Into<String>, value: impl Into<Reflected>) -> Self {
        let value = value.into();
        self.accessor(name, move || Ok(value.clone()))
    }

    /// Add an accessor backed by a closure.
    ///
    /// Re-adding a name replaces the earlier accessor in place.
    pub fn accessor<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> AccessResult<Reflected> + Send + Sync + 'static,
    {
        let name = name.into();
        let f: AccessorFn = Arc::new(f);
        match self.accessors.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = f,
            None => self.accessors.push((name, f)),
        }
        self
    }

    /// Add an accessor that always fails with `message`.
    pub fn failing(self, name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        self.accessor(name, move || Err(AccessError::new(message.clone())))
    }

    /// Give the object a self-serialization capability.
    pub fn with_json<F>(mut self, f: F) -> Self
    where
        F: Fn() -> AccessResult<Value> + Send + Sync + 'static,
    {
        self.json = Some(Arc::new(f));
        self
    }

    /// Give the object a string conversion.
    pub fn with_display<F>(mut self, f: F) -> Self
    where
        F: Fn() -> AccessResult<String> + Send + Sync + 'static,
    {
        self.display = Some(Arc::new(f));
        self
    }

    /// Build an event from a forwarded JSON description.
    ///
    /// Expects `{"class": "...", "interfaces": [...], "values": {...}}`; each
    /// entry of `values` becomes a constant accessor. Returns `None` when
    /// `class` is missing or not a string.
    pub fn from_description(description: &Value) -> Option<Self> {
        let class = description.get("class")?.as_str()?;
        let mut object = DynamicObject::new(class);

        if let Some(interfaces) = description.get("interfaces").and_then(Value::as_array) {
            for name in interfaces.iter().filter_map(Value::as_str) {
                object = object.implements(name);
            }
        }

        if let Some(values) = description.get("values").and_then(Value::as_object) {
            for (name, value) in values {
                object = object.value(name.as_str(), Reflected::from(value.clone()));
            }
        }

        Some(object)
    }
}

impl fmt::Debug for DynamicObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicObject")
            .field("type_name", &self.type_name)
            .field("interfaces", &self.interfaces)
            .field(
                "accessors",
                &self.accessors.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Inspect for DynamicObject {
    fn type_name(&self) -> String {
        self.type_name.clone()
    }

    fn interfaces(&self) -> Vec<String> {
        self.interfaces.clone()
    }

    fn accessors(&self) -> Vec<String> {
        self.accessors.iter().map(|(name, _)| name.clone()).collect()
    }

    fn call(&self, name: &str) -> Option<AccessResult<Reflected>> {
        self.accessors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f())
    }

    fn json_value(&self) -> Option<AccessResult<Value>> {
        self.json.as_ref().map(|f| f())
    }

    fn display(&self) -> Option<AccessResult<String>> {
        self.display.as_ref().map(|f| f())
    }
}
