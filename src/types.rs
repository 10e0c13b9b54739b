//! Core types for spark-ssr.
//!
//! These types define the foundation that everything builds on.
//! They flow through the reactive pipeline, the serialization side channel,
//! and the hydration store.

use std::fmt;
use std::rc::Rc;

use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;

use crate::task::{Promise, ValueStream};

// =============================================================================
// Shared Error
// =============================================================================

/// A cheaply cloneable user-level error.
///
/// Errors cross the reactive graph many times (memo reads re-surface them,
/// error boundaries serialize them for the client), so they are reference
/// counted rather than owned.
#[derive(Clone)]
pub struct SharedError(Rc<String>);

impl SharedError {
    /// Wrap a message into a shared error.
    pub fn msg(message: impl Into<String>) -> Self {
        SharedError(Rc::new(message.into()))
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedError({:?})", self.0)
    }
}

impl PartialEq for SharedError {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Serialize for SharedError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl std::error::Error for SharedError {}

// =============================================================================
// Render Error
// =============================================================================

/// Error taxonomy for the render/reactive layer.
///
/// `NotReady` is the recoverable suspension signal: a computation has
/// suspended awaiting the carried promise. It is consumed by Loading
/// boundaries and by the retry chain inside memos. Everything else
/// propagates to the nearest error boundary or to the fragment reporter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RenderError {
    /// The computation suspended awaiting an async source.
    #[error("computation suspended awaiting an async source")]
    NotReady(Promise),

    /// A reactive API that requires an active owner was called without one.
    #[error("reactive API called without an active owner")]
    NoOwner,

    /// A context with no default value was requested outside its provider.
    #[error("context `{0}` not found and has no default value")]
    ContextNotFound(&'static str),

    /// Arbitrary user error, catchable by error boundaries.
    #[error("{0}")]
    User(SharedError),
}

impl RenderError {
    /// Shorthand for a user error from a message.
    pub fn user(message: impl Into<String>) -> Self {
        RenderError::User(SharedError::msg(message))
    }

    /// True if this error is the recoverable suspension signal.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, RenderError::NotReady(_))
    }
}

/// Result alias used throughout the crate.
pub type RenderResult<T> = Result<T, RenderError>;

// =============================================================================
// Value
// =============================================================================

/// Sentinel stored at a boundary id when the fallback is deferred to the
/// client (sync rendering of a suspended boundary).
pub const DEFERRED_FALLBACK: &str = "$$f";

/// The dynamic value that flows through reactive primitives and the
/// serialization side channel.
///
/// Plain data is carried as [`serde_json::Value`] trees; async results keep
/// their live handles so settlement state can be peeked during hydration.
#[derive(Clone)]
pub enum Value {
    /// Absent / null.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Structured plain data (stores, projections, fixtures).
    Data(serde_json::Value),
    /// A promise-like with peekable settlement.
    Promise(Promise),
    /// An async-iterable of values.
    Stream(ValueStream),
    /// A batch of patch operations (projection updates after the first).
    Patches(Rc<Vec<PatchOp>>),
    /// A captured user error (error boundary side channel).
    Error(SharedError),
    /// The `"$$f"` deferred-fallback sentinel.
    DeferredFallback,
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    /// True for promises and streams, which sync-only serialization rejects.
    pub fn is_async(&self) -> bool {
        matches!(self, Value::Promise(_) | Value::Stream(_))
    }

    /// Render the value as text for template interpolation.
    ///
    /// Mirrors template semantics: null renders as the empty string, data
    /// trees render as their string content when they are strings and as
    /// JSON otherwise.
    pub fn render_text(&self) -> String {
        match self {
            Value::Null | Value::DeferredFallback => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Data(serde_json::Value::String(s)) => s.clone(),
            Value::Data(d) => d.to_string(),
            Value::Error(e) => e.message().to_string(),
            Value::Promise(_) | Value::Stream(_) | Value::Patches(_) => String::new(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Data(a), Value::Data(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Stream(a), Value::Stream(b)) => a.ptr_eq(b),
            (Value::Patches(a), Value::Patches(b)) => Rc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::DeferredFallback, Value::DeferredFallback) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Data(d) => write!(f, "Data({d})"),
            Value::Promise(p) => write!(f, "Promise({p:?})"),
            Value::Stream(_) => write!(f, "Stream(..)"),
            Value::Patches(ops) => write!(f, "Patches({} ops)", ops.len()),
            Value::Error(e) => write!(f, "Error({:?})", e.message()),
            Value::DeferredFallback => write!(f, "DeferredFallback"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(d: serde_json::Value) -> Self {
        Value::Data(d)
    }
}

// =============================================================================
// Patch Operations
// =============================================================================

/// One step of a key path into a data tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathKey {
    /// Object property.
    Key(String),
    /// Array index.
    Index(usize),
}

impl PathKey {
    pub fn key(s: impl Into<String>) -> Self {
        PathKey::Key(s.into())
    }
}

impl Serialize for PathKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PathKey::Key(k) => serializer.serialize_str(k),
            PathKey::Index(i) => serializer.serialize_u64(*i as u64),
        }
    }
}

/// What a patch does at its path.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchKind {
    /// `[path]` removes the value at the path.
    Delete,
    /// `[path, value]` writes the value at the path.
    Set(serde_json::Value),
    /// `[path, value, 1]` inserts the value at an array index.
    Insert(serde_json::Value),
}

/// A single path-based patch operation.
///
/// The wire shape is a tuple: `[path]` = delete, `[path, value]` = set,
/// `[path, value, 1]` = array insertion. Order within a batch is significant
/// for array operations.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchOp {
    pub path: Vec<PathKey>,
    pub kind: PatchKind,
}

impl PatchOp {
    pub fn delete(path: Vec<PathKey>) -> Self {
        PatchOp {
            path,
            kind: PatchKind::Delete,
        }
    }

    pub fn set(path: Vec<PathKey>, value: serde_json::Value) -> Self {
        PatchOp {
            path,
            kind: PatchKind::Set(value),
        }
    }

    pub fn insert(path: Vec<PathKey>, value: serde_json::Value) -> Self {
        PatchOp {
            path,
            kind: PatchKind::Insert(value),
        }
    }
}

impl Serialize for PatchOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = match self.kind {
            PatchKind::Delete => 1,
            PatchKind::Set(_) => 2,
            PatchKind::Insert(_) => 3,
        };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.path)?;
        match &self.kind {
            PatchKind::Delete => {}
            PatchKind::Set(v) => seq.serialize_element(v)?,
            PatchKind::Insert(v) => {
                seq.serialize_element(v)?;
                seq.serialize_element(&1u8)?;
            }
        }
        seq.end()
    }
}

// =============================================================================
// Primitive Options
// =============================================================================

/// Per-primitive directive selecting how compute and serialization cooperate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SsrSource {
    /// Full streaming; SSR sees the first value; the side channel gets the
    /// full stream.
    #[default]
    Server,
    /// First value only is serialized; SSR sees the first value.
    Hybrid,
    /// Skip compute on server and client; use the initial value; deps are
    /// still captured via an intercepted scan; no serialization.
    Initial,
    /// As `Initial` on the server; the client flips to live compute once the
    /// snapshot scope releases.
    Client,
}

impl SsrSource {
    /// True when the server must not serialize a value at the primitive id.
    pub fn skips_serialization(&self) -> bool {
        matches!(self, SsrSource::Initial | SsrSource::Client)
    }
}

/// Equality policy for signals and memos.
#[derive(Clone, Default)]
pub enum Equality {
    /// Structural equality via `PartialEq` on [`Value`].
    #[default]
    Default,
    /// Never equal: every write notifies (re-run latch behavior).
    Never,
    /// Custom comparator.
    Custom(Rc<dyn Fn(&Value, &Value) -> bool>),
}

impl Equality {
    pub fn are_equal(&self, a: &Value, b: &Value) -> bool {
        match self {
            Equality::Default => a == b,
            Equality::Never => false,
            Equality::Custom(f) => f(a, b),
        }
    }
}

impl fmt::Debug for Equality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Equality::Default => write!(f, "Equality::Default"),
            Equality::Never => write!(f, "Equality::Never"),
            Equality::Custom(_) => write!(f, "Equality::Custom(..)"),
        }
    }
}

/// Recognized configuration for reactive primitives.
#[derive(Clone, Debug, Default)]
pub struct PrimitiveOptions {
    /// Defer the first compute to the first read.
    pub lazy: bool,
    /// Equality policy for change detection.
    pub equals: Equality,
    /// Defer streaming of the serialized entry until the boundary flushes.
    pub defer_stream: bool,
    /// Server/client cooperation mode.
    pub ssr_source: SsrSource,
    /// Initial value for `Initial`/`Client` modes (and lazy seeds).
    pub initial: Option<Value>,
}

impl PrimitiveOptions {
    pub fn with_ssr_source(ssr_source: SsrSource) -> Self {
        PrimitiveOptions {
            ssr_source,
            ..Default::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
