//! Memo - suspension-aware derived computation.
//!
//! A memo runs its compute under its own owner with itself installed as
//! the observer. The result is classified by [`process_result`]: plain
//! values store directly; promises and async-iterables serialize to the
//! side channel and surface `NotReady` from reads until the first value
//! arrives. A compute that itself suspends (reads another suspended memo)
//! chains a retry on the source promise.
//!
//! During hydration, memos consume their serialized value by owner id
//! instead of recomputing async work; see the hydration path in
//! [`create_memo`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::engine::{create_owner, run_with_owner, Owner};
use crate::render::{current_render_context, with_render_context, RenderContext};
use crate::task::{with_resource_interceptor, StreamEvent};
use crate::types::{PrimitiveOptions, RenderError, RenderResult, SsrSource, Value};

use super::{add_subscriber, live_subscribers, run_as_computation};

// =============================================================================
// MemoInner
// =============================================================================

pub(crate) type ComputeFn = Rc<dyn Fn(Option<&Value>) -> RenderResult<Value>>;

pub(crate) struct MemoInner {
    owner: Owner,
    /// Render context captured at creation; reinstalled around every
    /// compute and async continuation.
    ctx: Option<RenderContext>,
    compute: RefCell<ComputeFn>,
    value: RefCell<Option<Value>>,
    error: RefCell<Option<RenderError>>,
    computed: Cell<bool>,
    stale: Cell<bool>,
    running: Cell<bool>,
    options: PrimitiveOptions,
    subscribers: RefCell<Vec<Weak<MemoInner>>>,
    /// Nearest snapshot scope at creation (hydration).
    pub(crate) snapshot_scope: RefCell<Option<String>>,
    /// Server stream mode: value locked at the first yield.
    value_locked: Cell<bool>,
}

impl MemoInner {
    pub(crate) fn is_running(&self) -> bool {
        self.running.get()
    }

    pub(crate) fn is_lazy(&self) -> bool {
        self.options.lazy
    }

    pub(crate) fn set_stale(&self) {
        self.stale.set(true);
    }

    pub(crate) fn take_live_subscribers(self: &Rc<Self>) -> Vec<Rc<MemoInner>> {
        live_subscribers(&self.subscribers)
    }

    pub(crate) fn serialize_id(&self) -> String {
        self.owner.id()
    }

    fn initial_value(&self) -> Value {
        self.options.initial.clone().unwrap_or(Value::Null)
    }
}

/// Store a new value, honoring the V1 lock and the equality policy;
/// subscribers rerun on change.
fn set_memo_value(inner: &Rc<MemoInner>, value: Value) {
    if inner.value_locked.get() {
        return;
    }
    let changed = {
        let mut slot = inner.value.borrow_mut();
        let changed = match &*slot {
            Some(previous) => !inner.options.equals.are_equal(previous, &value),
            None => true,
        };
        *slot = Some(value);
        changed
    };
    inner.computed.set(true);
    if changed {
        notify_subscribers(inner);
    }
}

fn notify_subscribers(inner: &Rc<MemoInner>) {
    for comp in live_subscribers(&inner.subscribers) {
        super::mark_stale(&comp);
    }
}

fn set_memo_error(inner: &Rc<MemoInner>, error: RenderError) {
    *inner.error.borrow_mut() = Some(error);
    inner.computed.set(true);
    notify_subscribers(inner);
}

// =============================================================================
// Update
// =============================================================================

/// Re-run the memo's compute. Child owners are disposed first (with
/// `keep_alive`) so re-execution regenerates the same child id sequence.
pub(crate) fn update_memo(inner: &Rc<MemoInner>) {
    if inner.running.get() {
        return;
    }

    match inner.options.ssr_source {
        // Initial never computes; the initial value stands.
        SsrSource::Initial => {
            *inner.value.borrow_mut() = Some(inner.initial_value());
            inner.computed.set(true);
            inner.stale.set(false);
            return;
        }
        // Client holds the initial value while rendered on the server or
        // while its snapshot scope is still active; afterwards it is live.
        SsrSource::Client => {
            let stubbed = inner.ctx.is_some()
                || inner
                    .snapshot_scope
                    .borrow()
                    .as_deref()
                    .is_some_and(crate::hydrate::snapshot::is_scope_active);
            if stubbed {
                *inner.value.borrow_mut() = Some(inner.initial_value());
                inner.computed.set(true);
                inner.stale.set(false);
                return;
            }
        }
        _ => {}
    }

    inner.running.set(true);
    *inner.error.borrow_mut() = None;
    inner.owner.dispose(true);

    let compute = inner.compute.borrow().clone();
    let previous = inner.value.borrow().clone();
    let ctx = inner.ctx.clone();
    let result = with_render_context(ctx, || {
        run_with_owner(&inner.owner, || {
            run_as_computation(inner.clone(), || compute(previous.as_ref()))
        })
    });

    inner.running.set(false);
    inner.stale.set(false);

    match result {
        Ok(value) => process_result(inner, value),
        Err(RenderError::NotReady(source)) => {
            // Suspended mid-compute: retry when the dependency settles.
            *inner.error.borrow_mut() = Some(RenderError::NotReady(source.clone()));
            inner.computed.set(true);
            let weak = Rc::downgrade(inner);
            source.then(move |_| {
                if let Some(inner) = weak.upgrade() {
                    update_memo(&inner);
                }
            });
        }
        Err(error) => set_memo_error(inner, error),
    }
}

/// Classify a compute result and wire its side channel.
///
/// | Result | Effect on the memo | Side channel |
/// |---|---|---|
/// | plain value | stored | none |
/// | promise | `NotReady` until settled, then value | promise |
/// | stream, hybrid | first value only | first-value promise |
/// | stream, server | value locked at V1 | tapped stream |
fn process_result(inner: &Rc<MemoInner>, result: Value) {
    match result {
        Value::Promise(promise) => {
            serialize_entry(inner, Value::Promise(promise.clone()));
            adopt_promise(inner, promise);
        }
        Value::Stream(stream) => match inner.options.ssr_source {
            SsrSource::Hybrid => {
                let first = stream.first_promise();
                serialize_entry(inner, Value::Promise(first.clone()));
                // A first value that was already yielded adopts in place.
                match stream.try_first() {
                    Some(first_value) => set_memo_value(inner, first_value),
                    None => adopt_promise(inner, first),
                }
            }
            _ => {
                let tapped = stream.tapped();
                serialize_entry(inner, Value::Stream(tapped));
                if let Some(first_value) = stream.try_first() {
                    set_memo_value(inner, first_value);
                    // SSR sees V1; further yields do not move it.
                    inner.value_locked.set(true);
                    return;
                }
                let first = stream.first_promise();
                if !inner.computed.get() {
                    *inner.error.borrow_mut() = Some(RenderError::NotReady(first.clone()));
                    inner.computed.set(true);
                }
                let weak = Rc::downgrade(inner);
                first.then(move |result| {
                    let Some(inner) = weak.upgrade() else { return };
                    match result {
                        Ok(first_value) => {
                            *inner.error.borrow_mut() = None;
                            set_memo_value(&inner, first_value);
                            inner.value_locked.set(true);
                        }
                        Err(e) => set_memo_error(&inner, RenderError::User(e)),
                    }
                });
            }
        },
        plain => set_memo_value(inner, plain),
    }
}

/// Treat a promise result: suspended until settled, then carry the value.
///
/// A promise whose settlement was already delivered through the reactive
/// layer (the post-settlement `s`/`v` view) adopts synchronously - this is
/// what lets boundary body retries converge instead of re-suspending on
/// every fresh memo.
fn adopt_promise(inner: &Rc<MemoInner>, promise: crate::task::Promise) {
    if let Some(settled) = promise.adopted_settlement() {
        match settled {
            Ok(value) => {
                *inner.error.borrow_mut() = None;
                set_memo_value(inner, value);
            }
            Err(e) => set_memo_error(inner, RenderError::User(e)),
        }
        return;
    }

    if !inner.computed.get() {
        *inner.error.borrow_mut() = Some(RenderError::NotReady(promise.clone()));
        inner.computed.set(true);
    }
    let weak = Rc::downgrade(inner);
    let marked = promise.clone();
    promise.then(move |result| {
        marked.mark_adopted();
        let Some(inner) = weak.upgrade() else { return };
        match result {
            Ok(value) => {
                *inner.error.borrow_mut() = None;
                set_memo_value(&inner, value);
            }
            Err(e) => set_memo_error(&inner, RenderError::User(e)),
        }
    });
}

fn serialize_entry(inner: &Rc<MemoInner>, value: Value) {
    if inner.options.ssr_source.skips_serialization() {
        return;
    }
    if let Some(ctx) = &inner.ctx {
        ctx.serialize(&inner.owner.id(), value, inner.options.defer_stream);
    }
}

// =============================================================================
// Memo Handle
// =============================================================================

/// Handle to a derived computation. Reads re-surface the stored error
/// (including `NotReady` while suspended).
#[derive(Clone)]
pub struct Memo {
    inner: Rc<MemoInner>,
}

impl Memo {
    /// The memo's serialization id (its owner's id).
    pub fn id(&self) -> String {
        self.inner.serialize_id()
    }

    /// Read the value, subscribing the current computation. Lazy and stale
    /// memos recompute on read.
    pub fn get(&self) -> RenderResult<Value> {
        if let Some(comp) = super::current_computation() {
            add_subscriber(&self.inner.subscribers, &comp);
        }
        if !self.inner.computed.get() || self.inner.stale.get() {
            update_memo(&self.inner);
        }
        if let Some(error) = self.inner.error.borrow().clone() {
            return Err(error);
        }
        Ok(self
            .inner
            .value
            .borrow()
            .clone()
            .unwrap_or(Value::Null))
    }

    /// Read without subscribing.
    pub fn peek(&self) -> RenderResult<Value> {
        if let Some(error) = self.inner.error.borrow().clone() {
            return Err(error);
        }
        Ok(self
            .inner
            .value
            .borrow()
            .clone()
            .unwrap_or(Value::Null))
    }

    /// True while the memo holds a `NotReady` error.
    pub fn is_suspended(&self) -> bool {
        matches!(
            self.inner.error.borrow().as_ref(),
            Some(RenderError::NotReady(_))
        )
    }

}

// =============================================================================
// Construction
// =============================================================================

/// Create a memo. Eager by default; `options.lazy` defers the first
/// compute to the first read.
pub fn create_memo(
    compute: impl Fn(Option<&Value>) -> RenderResult<Value> + 'static,
    options: PrimitiveOptions,
) -> RenderResult<Memo> {
    let owner = create_owner(None)?;
    let parent = owner.parent();
    let ctx = current_render_context();
    let hydrating = crate::hydrate::is_hydrating();

    let inner = Rc::new(MemoInner {
        owner: owner.clone(),
        ctx,
        compute: RefCell::new(Rc::new(compute) as ComputeFn),
        value: RefCell::new(None),
        error: RefCell::new(None),
        computed: Cell::new(false),
        stale: Cell::new(false),
        running: Cell::new(false),
        options,
        subscribers: RefCell::new(Vec::new()),
        snapshot_scope: RefCell::new(None),
        value_locked: Cell::new(false),
    });

    // The primitive lives as long as the owner it was created under.
    if let Some(parent) = parent {
        let keep = inner.clone();
        parent.add_cleanup(move || drop(keep));
    }

    if hydrating {
        crate::hydrate::mark_hydration_scope(&owner);
    }
    *inner.snapshot_scope.borrow_mut() = owner.nearest_snapshot_scope();
    if matches!(inner.options.ssr_source, SsrSource::Client) {
        if let Some(scope) = inner.snapshot_scope.borrow().as_deref() {
            crate::hydrate::snapshot::register_reader(scope, &inner);
        }
    }

    match inner.options.ssr_source {
        SsrSource::Initial | SsrSource::Client => {
            // Single intercepted pass: dependencies are captured, resource
            // requests are inert, the result is discarded.
            let scan = inner.compute.borrow().clone();
            let scan_inner = inner.clone();
            with_resource_interceptor(|| {
                let _ = run_with_owner(&owner, || {
                    run_as_computation(scan_inner.clone(), || scan(None))
                });
            });
            owner.dispose(true);
            *inner.value.borrow_mut() = Some(inner.initial_value());
            inner.computed.set(true);
            return Ok(Memo { inner });
        }
        _ => {}
    }

    if hydrating {
        if let Some(serialized) = crate::hydrate::consume(&owner.id()) {
            hydrate_memo_value(&inner, serialized);
            return Ok(Memo { inner });
        }
    }

    if !inner.options.lazy {
        update_memo(&inner);
    }
    Ok(Memo { inner })
}

/// Seed a hydrating memo from its serialized entry instead of recomputing
/// async work.
fn hydrate_memo_value(inner: &Rc<MemoInner>, serialized: Value) {
    match serialized {
        Value::Stream(stream) => {
            // First value synchronously; remaining iterations scheduled,
            // re-flushing after each.
            match stream.try_first() {
                Some(first) => set_memo_value(inner, first),
                None => {
                    let first = stream.first_promise();
                    *inner.error.borrow_mut() = Some(RenderError::NotReady(first.clone()));
                    inner.computed.set(true);
                    adopt_promise(inner, first);
                }
            }
            let weak = Rc::downgrade(inner);
            stream.subscribe_from(1, move |event| {
                let Some(inner) = weak.upgrade() else { return };
                match event {
                    StreamEvent::Item(value) => {
                        set_memo_value(&inner, value);
                        crate::task::flush_microtasks();
                    }
                    StreamEvent::Failed(e) => set_memo_error(&inner, RenderError::User(e)),
                    StreamEvent::Closed => {}
                }
            });
        }
        Value::Promise(promise) => match promise.resolved_value() {
            Some(value) => set_memo_value(inner, value),
            None => {
                *inner.error.borrow_mut() = Some(RenderError::NotReady(promise.clone()));
                inner.computed.set(true);
                adopt_promise(inner, promise);
            }
        },
        raw => set_memo_value(inner, raw),
    }
}

/// `create_signal` with a function first argument: the memo is the
/// suspension-aware carrier, and writes override it through a backing
/// signal.
#[allow(clippy::type_complexity)]
pub fn create_signal_from(
    compute: impl Fn(Option<&Value>) -> RenderResult<Value> + 'static,
    options: PrimitiveOptions,
) -> RenderResult<(Rc<dyn Fn() -> RenderResult<Value>>, Rc<dyn Fn(Value)>)> {
    let memo = create_memo(compute, options)?;
    let backing = super::create_signal(Value::Null);
    let written = Rc::new(Cell::new(false));

    let getter = {
        let memo = memo.clone();
        let backing = backing.clone();
        let written = written.clone();
        Rc::new(move || {
            // Subscribe through the backing signal unconditionally so a
            // later write reruns readers that saw the memo value.
            let overridden = backing.get();
            if written.get() {
                Ok(overridden)
            } else {
                memo.get()
            }
        }) as Rc<dyn Fn() -> RenderResult<Value>>
    };
    let setter = Rc::new(move |value: Value| {
        written.set(true);
        backing.set(value);
    }) as Rc<dyn Fn(Value)>;

    Ok((getter, setter))
}

// =============================================================================
// Tests
// =============================================================================
