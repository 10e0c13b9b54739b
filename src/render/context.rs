//! RenderContext - the in-process boundary between the reactive core and
//! the template/transport collaborators.
//!
//! One context exists per render request. It owns the serialization side
//! channel (entries keyed by owner id), the fragment table for streaming
//! boundaries, and the asset registry for per-boundary module preloads.
//!
//! The process-wide *current* context pointer is only valid synchronously:
//! each async re-entry must capture the context at creation time and
//! reinstall it around callbacks ([`with_render_context`]). Memos close
//! over the context observed at creation - a load-bearing invariant when
//! multiple requests interleave their awaits.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::types::{SharedError, Value};

// =============================================================================
// Serialized Writes
// =============================================================================

/// One committed side-channel write.
#[derive(Clone, Debug)]
pub struct SerializedWrite {
    pub id: String,
    pub value: Value,
    /// Hold back streaming of this entry until its boundary settles.
    pub defer_stream: bool,
}

// =============================================================================
// Fragments
// =============================================================================

/// Lifecycle of a streamable fragment. Transitions are monotonic; a
/// fragment settles exactly once.
#[derive(Clone, Debug)]
pub enum FragmentState {
    Registered,
    Html(String),
    Error(SharedError),
    Cancelled,
}

impl FragmentState {
    fn is_settled(&self) -> bool {
        !matches!(self, FragmentState::Registered)
    }
}

/// Settle callback for a registered fragment. Obtained from
/// [`RenderContext::register_fragment`]; `done` settles once, later calls
/// are ignored.
#[derive(Clone)]
pub struct FragmentHandle {
    ctx: RenderContext,
    id: String,
}

impl FragmentHandle {
    /// Report the fragment's final HTML, or its error.
    pub fn done(&self, result: Result<String, SharedError>) {
        self.ctx.settle_fragment(&self.id, result);
    }

    pub fn fragment_id(&self) -> &str {
        &self.id
    }
}

// =============================================================================
// Assets
// =============================================================================

/// Kinds of preloadable assets the transport can emit links for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetKind {
    Module,
    Stylesheet,
}

// =============================================================================
// RenderContext
// =============================================================================

struct CtxInner {
    root_id: String,
    count: Cell<u64>,
    async_mode: bool,
    no_hydrate: bool,
    current_boundary_id: RefCell<Option<String>>,
    /// Attempt-scoped serialization buffers; writes land in the top buffer
    /// when any are pushed, otherwise they commit.
    buffers: RefCell<Vec<Vec<SerializedWrite>>>,
    entries: RefCell<BTreeMap<String, Value>>,
    commit_log: RefCell<Vec<SerializedWrite>>,
    fragments: RefCell<BTreeMap<String, FragmentState>>,
    settled_log: RefCell<Vec<(String, Result<String, SharedError>)>>,
    assets: RefCell<Vec<(AssetKind, String)>>,
    boundary_modules: RefCell<HashMap<String, BTreeMap<String, String>>>,
    blocked: RefCell<Vec<crate::task::Promise>>,
}

/// Per-request rendering context handle (cheap clone).
#[derive(Clone)]
pub struct RenderContext {
    inner: Rc<CtxInner>,
}

impl RenderContext {
    /// Create a context. `async_mode` selects streaming rendering;
    /// `no_hydrate` suppresses serialization entirely.
    pub fn new(root_id: impl Into<String>, async_mode: bool, no_hydrate: bool) -> RenderContext {
        RenderContext {
            inner: Rc::new(CtxInner {
                root_id: root_id.into(),
                count: Cell::new(0),
                async_mode,
                no_hydrate,
                current_boundary_id: RefCell::new(None),
                buffers: RefCell::new(Vec::new()),
                entries: RefCell::new(BTreeMap::new()),
                commit_log: RefCell::new(Vec::new()),
                fragments: RefCell::new(BTreeMap::new()),
                settled_log: RefCell::new(Vec::new()),
                assets: RefCell::new(Vec::new()),
                boundary_modules: RefCell::new(HashMap::new()),
                blocked: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Id of the rendering scope root.
    pub fn root_id(&self) -> String {
        self.inner.root_id.clone()
    }

    /// Consume one rendering-scope counter slot.
    pub fn next_count(&self) -> u64 {
        let n = self.inner.count.get();
        self.inner.count.set(n + 1);
        n
    }

    /// True for streaming rendering, false for sync.
    pub fn is_async(&self) -> bool {
        self.inner.async_mode
    }

    /// True to suppress serialization (non-hydrating renders).
    pub fn no_hydrate(&self) -> bool {
        self.inner.no_hydrate
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &RenderContext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // -------------------------------------------------------------------------
    // Boundary attribution
    // -------------------------------------------------------------------------

    /// Install the innermost Loading boundary id; returns the previous one
    /// for restoration.
    pub fn set_current_boundary_id(&self, id: Option<String>) -> Option<String> {
        std::mem::replace(&mut *self.inner.current_boundary_id.borrow_mut(), id)
    }

    pub fn current_boundary_id(&self) -> Option<String> {
        self.inner.current_boundary_id.borrow().clone()
    }

    // -------------------------------------------------------------------------
    // Serialization side channel
    // -------------------------------------------------------------------------

    /// Emit a side-channel entry keyed by owner id.
    ///
    /// Streaming mode accepts promises and async-iterables; sync mode
    /// rejects them (the entry is dropped with a warning - sync boundaries
    /// write the `"$$f"` sentinel instead).
    pub fn serialize(&self, id: &str, value: Value, defer_stream: bool) {
        if self.inner.no_hydrate {
            return;
        }
        if !self.inner.async_mode && value.is_async() {
            tracing::warn!(id, "sync render cannot serialize an async value; dropped");
            return;
        }
        tracing::trace!(id, ?value, defer_stream, "serialize");
        let write = SerializedWrite {
            id: id.to_string(),
            value,
            defer_stream,
        };
        let mut buffers = self.inner.buffers.borrow_mut();
        match buffers.last_mut() {
            Some(top) => top.push(write),
            None => {
                drop(buffers);
                self.commit(write);
            }
        }
    }

    fn commit(&self, write: SerializedWrite) {
        self.inner
            .entries
            .borrow_mut()
            .insert(write.id.clone(), write.value.clone());
        self.inner.commit_log.borrow_mut().push(write);
    }

    /// Begin buffering serializations for a boundary attempt.
    pub fn push_serialize_buffer(&self) {
        self.inner.buffers.borrow_mut().push(Vec::new());
    }

    /// End the current attempt's buffer. With `flush`, its writes move to
    /// the enclosing buffer (or commit at the top level); without, the
    /// attempt's writes are discarded.
    pub fn pop_serialize_buffer(&self, flush: bool) {
        let popped = self.inner.buffers.borrow_mut().pop();
        let Some(writes) = popped else { return };
        if !flush {
            return;
        }
        let mut buffers = self.inner.buffers.borrow_mut();
        match buffers.last_mut() {
            Some(outer) => outer.extend(writes),
            None => {
                drop(buffers);
                for write in writes {
                    self.commit(write);
                }
            }
        }
    }

    /// Committed entries, keyed by owner id.
    pub fn entries(&self) -> BTreeMap<String, Value> {
        self.inner.entries.borrow().clone()
    }

    pub fn entry(&self, id: &str) -> Option<Value> {
        self.inner.entries.borrow().get(id).cloned()
    }

    /// Drain committed writes in commit order (transport streaming).
    pub fn take_serialized_writes(&self) -> Vec<SerializedWrite> {
        std::mem::take(&mut *self.inner.commit_log.borrow_mut())
    }

    // -------------------------------------------------------------------------
    // Fragments
    // -------------------------------------------------------------------------

    /// Register a streaming slot for a boundary id.
    pub fn register_fragment(&self, id: &str) -> FragmentHandle {
        tracing::debug!(id, "register fragment");
        self.inner
            .fragments
            .borrow_mut()
            .insert(id.to_string(), FragmentState::Registered);
        FragmentHandle {
            ctx: self.clone(),
            id: id.to_string(),
        }
    }

    fn settle_fragment(&self, id: &str, result: Result<String, SharedError>) {
        {
            let mut fragments = self.inner.fragments.borrow_mut();
            match fragments.get(id) {
                Some(state) if state.is_settled() => {
                    tracing::warn!(id, "fragment already settled; done() ignored");
                    return;
                }
                None => {
                    tracing::warn!(id, "done() for unregistered fragment; ignored");
                    return;
                }
                Some(FragmentState::Registered) => {}
                Some(_) => unreachable!("covered by is_settled() guard above"),
            }
            let state = match &result {
                Ok(html) => FragmentState::Html(html.clone()),
                Err(e) => FragmentState::Error(e.clone()),
            };
            tracing::debug!(id, ok = result.is_ok(), "fragment settled");
            fragments.insert(id.to_string(), state);
        }
        self.inner
            .settled_log
            .borrow_mut()
            .push((id.to_string(), result));
    }

    /// Cancel a registered fragment (boundary disposed before resumption).
    /// Settled fragments are unaffected.
    pub fn cancel_fragment(&self, id: &str) {
        let mut fragments = self.inner.fragments.borrow_mut();
        if let Some(state @ FragmentState::Registered) = fragments.get_mut(id) {
            tracing::warn!(id, "fragment cancelled");
            *state = FragmentState::Cancelled;
        }
    }

    pub fn fragment_state(&self, id: &str) -> Option<FragmentState> {
        self.inner.fragments.borrow().get(id).cloned()
    }

    /// Fragments registered but not yet settled or cancelled.
    pub fn pending_fragments(&self) -> usize {
        self.inner
            .fragments
            .borrow()
            .values()
            .filter(|state| matches!(state, FragmentState::Registered))
            .count()
    }

    /// Drain fragments settled since the last call, in settle order.
    pub fn take_settled_fragments(&self) -> Vec<(String, Result<String, SharedError>)> {
        std::mem::take(&mut *self.inner.settled_log.borrow_mut())
    }

    // -------------------------------------------------------------------------
    // Assets
    // -------------------------------------------------------------------------

    /// Record a preloadable asset for the transport's head links.
    pub fn register_asset(&self, kind: AssetKind, url: impl Into<String>) {
        self.inner.assets.borrow_mut().push((kind, url.into()));
    }

    /// Attribute a module to the innermost Loading boundary (or to the
    /// root scope if none is active).
    pub fn register_module(&self, specifier: impl Into<String>, url: impl Into<String>) {
        let boundary = self
            .current_boundary_id()
            .unwrap_or_else(|| self.inner.root_id.clone());
        self.inner
            .boundary_modules
            .borrow_mut()
            .entry(boundary)
            .or_default()
            .insert(specifier.into(), url.into());
    }

    /// Module specifier → entry URL map for a boundary.
    pub fn get_boundary_modules(&self, boundary_id: &str) -> BTreeMap<String, String> {
        self.inner
            .boundary_modules
            .borrow()
            .get(boundary_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All registered head assets.
    pub fn assets(&self) -> Vec<(AssetKind, String)> {
        self.inner.assets.borrow().clone()
    }

    // -------------------------------------------------------------------------
    // Root-level gating (sync rendering only)
    // -------------------------------------------------------------------------

    /// Gate sync rendering on a promise (lazy module loading). Boundaries
    /// do not call this.
    pub fn block(&self, promise: crate::task::Promise) {
        self.inner.blocked.borrow_mut().push(promise);
    }

    pub fn take_blocked(&self) -> Vec<crate::task::Promise> {
        std::mem::take(&mut *self.inner.blocked.borrow_mut())
    }
}

// =============================================================================
// Current Context
// =============================================================================

thread_local! {
    static CURRENT_CTX: RefCell<Option<RenderContext>> = const { RefCell::new(None) };
}

/// The context of the active render, if any.
pub fn current_render_context() -> Option<RenderContext> {
    CURRENT_CTX.with(|ctx| ctx.borrow().clone())
}

struct CtxGuard {
    previous: Option<RenderContext>,
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        CURRENT_CTX.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Drop the current-context pointer (test isolation).
pub fn reset_render_context() {
    CURRENT_CTX.with(|ctx| *ctx.borrow_mut() = None);
}

/// Install `ctx` (possibly `None`) as the current render context for the
/// duration of `f`; the previous binding is restored on all exit paths.
pub fn with_render_context<T>(ctx: Option<RenderContext>, f: impl FnOnce() -> T) -> T {
    let guard = CtxGuard {
        previous: CURRENT_CTX.with(|current| {
            std::mem::replace(&mut *current.borrow_mut(), ctx)
        }),
    };
    let result = f();
    drop(guard);
    result
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_commits_without_buffer() {
        let ctx = RenderContext::new("t", true, false);
        ctx.serialize("t0", Value::Int(1), false);
        assert_eq!(ctx.entry("t0"), Some(Value::Int(1)));
    }

    #[test]
    fn test_buffered_writes_discard_on_retry() {
        let ctx = RenderContext::new("t", true, false);

        ctx.push_serialize_buffer();
        ctx.serialize("t0", Value::Int(1), false);
        ctx.pop_serialize_buffer(false); // attempt discarded

        ctx.push_serialize_buffer();
        ctx.serialize("t0", Value::Int(2), false);
        ctx.pop_serialize_buffer(true); // last attempt wins

        assert_eq!(ctx.entry("t0"), Some(Value::Int(2)));
        assert_eq!(ctx.take_serialized_writes().len(), 1);
    }

    #[test]
    fn test_nested_buffers_flush_outward() {
        let ctx = RenderContext::new("t", true, false);

        ctx.push_serialize_buffer();
        ctx.push_serialize_buffer();
        ctx.serialize("t00", Value::Int(1), false);
        ctx.pop_serialize_buffer(true);
        // Inner flush lands in the outer buffer, not the committed map.
        assert_eq!(ctx.entry("t00"), None);
        ctx.pop_serialize_buffer(true);
        assert_eq!(ctx.entry("t00"), Some(Value::Int(1)));
    }

    #[test]
    fn test_sync_mode_rejects_async_values() {
        let ctx = RenderContext::new("t", false, false);
        let (promise, _r) = crate::task::Promise::deferred();
        ctx.serialize("t0", Value::Promise(promise), false);
        assert_eq!(ctx.entry("t0"), None);
    }

    #[test]
    fn test_fragment_settles_exactly_once() {
        let ctx = RenderContext::new("t", true, false);
        let handle = ctx.register_fragment("t0");

        handle.done(Ok("<div>a</div>".to_string()));
        handle.done(Ok("<div>b</div>".to_string()));
        handle.done(Err(SharedError::msg("late")));

        let settled = ctx.take_settled_fragments();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].1.as_ref().unwrap(), "<div>a</div>");
        assert!(matches!(
            ctx.fragment_state("t0"),
            Some(FragmentState::Html(_))
        ));
    }

    #[test]
    fn test_cancel_only_affects_registered() {
        let ctx = RenderContext::new("t", true, false);
        let handle = ctx.register_fragment("t0");
        handle.done(Ok("x".to_string()));
        ctx.cancel_fragment("t0");
        assert!(matches!(
            ctx.fragment_state("t0"),
            Some(FragmentState::Html(_))
        ));
    }

    #[test]
    fn test_boundary_module_attribution() {
        let ctx = RenderContext::new("t", true, false);
        ctx.set_current_boundary_id(Some("t0".to_string()));
        ctx.register_module("./widget.js", "/assets/widget-abc.js");
        ctx.set_current_boundary_id(None);

        let modules = ctx.get_boundary_modules("t0");
        assert_eq!(
            modules.get("./widget.js").map(String::as_str),
            Some("/assets/widget-abc.js")
        );
    }

    #[test]
    fn test_with_render_context_restores() {
        let ctx = RenderContext::new("t", true, false);
        with_render_context(Some(ctx.clone()), || {
            assert!(current_render_context().unwrap().ptr_eq(&ctx));
            with_render_context(None, || {
                assert!(current_render_context().is_none());
            });
            assert!(current_render_context().is_some());
        });
        assert!(current_render_context().is_none());
    }
}
