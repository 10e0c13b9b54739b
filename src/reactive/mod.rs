//! Reactive primitives - pull-based signals and memos with suspension.
//!
//! The server layer is pull-based: memos compute eagerly (or lazily) under
//! their own owner, and a compute that depends on an unsettled async
//! source surfaces `NotReady` from reads until the source settles. The
//! client layer reuses the same graph; writes propagate to subscribers
//! synchronously, and the snapshot scope (see [`crate::hydrate::snapshot`])
//! intercepts signal reads during hydration.
//!
//! Primitive ids come from the owner tree: the memo's own owner id is its
//! serialization key, so the k-th primitive created under an owner gets
//! the same id on every execution.

mod boundary;
mod memo;
mod patch;
mod store;

pub use boundary::{
    create_error_boundary, create_load_boundary, is_pending, is_pending_or, report_error,
    ErrorHandler, ErrorReset,
};
pub use memo::{create_memo, create_signal_from, Memo};
pub use patch::{apply_patch, apply_patches, Draft, PatchRecorder};
pub use store::{
    create_optimistic, create_optimistic_store, create_projection, create_store, Projection,
    ProjectionDriver, Store,
};

pub(crate) use memo::{update_memo, MemoInner};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::types::{Equality, RenderResult, Value};

// =============================================================================
// Runtime State
// =============================================================================

thread_local! {
    /// Monotonic id source for signals and computations.
    static NEXT_PRIMITIVE_ID: Cell<u64> = const { Cell::new(1) };

    /// Stack of computations currently executing; the top is the observer
    /// that reads subscribe to.
    static COMPUTATION_STACK: RefCell<Vec<Rc<MemoInner>>> = RefCell::new(Vec::new());
}

pub(crate) fn next_primitive_id() -> u64 {
    NEXT_PRIMITIVE_ID.with(|n| {
        let id = n.get();
        n.set(id + 1);
        id
    })
}

/// The computation currently executing, if any.
pub(crate) fn current_computation() -> Option<Rc<MemoInner>> {
    COMPUTATION_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Run `f` with `comp` installed as the observing computation.
pub(crate) fn run_as_computation<T>(comp: Rc<MemoInner>, f: impl FnOnce() -> T) -> T {
    COMPUTATION_STACK.with(|stack| stack.borrow_mut().push(comp));
    let result = f();
    COMPUTATION_STACK.with(|stack| {
        stack.borrow_mut().pop();
    });
    result
}

/// Drain scheduled work: stream continuations, promise settlements, and
/// the reruns they trigger.
pub fn flush() {
    crate::task::flush_microtasks();
}

/// Clear reactive runtime state (test isolation). Does not touch owners,
/// tasks, or hydration state - reset those separately.
pub fn reset_reactive_state() {
    COMPUTATION_STACK.with(|stack| stack.borrow_mut().clear());
    NEXT_PRIMITIVE_ID.with(|n| n.set(1));
}

// =============================================================================
// Subscriber Lists
// =============================================================================

pub(crate) fn add_subscriber(list: &RefCell<Vec<Weak<MemoInner>>>, comp: &Rc<MemoInner>) {
    let mut subs = list.borrow_mut();
    let already = subs
        .iter()
        .any(|weak| weak.upgrade().is_some_and(|existing| Rc::ptr_eq(&existing, comp)));
    if !already {
        subs.push(Rc::downgrade(comp));
    }
}

/// Collect live subscribers, dropping dead weak refs in passing.
pub(crate) fn live_subscribers(list: &RefCell<Vec<Weak<MemoInner>>>) -> Vec<Rc<MemoInner>> {
    let mut subs = list.borrow_mut();
    subs.retain(|weak| weak.strong_count() > 0);
    subs.iter().filter_map(Weak::upgrade).collect()
}

/// Mark a computation stale and rerun it (lazy computations defer the
/// rerun to their next read, but propagate staleness downstream).
pub(crate) fn mark_stale(comp: &Rc<MemoInner>) {
    if comp.is_running() {
        return;
    }
    comp.set_stale();
    if comp.is_lazy() {
        for downstream in comp.take_live_subscribers() {
            mark_stale(&downstream);
        }
    } else {
        update_memo(comp);
    }
}

// =============================================================================
// Signal
// =============================================================================

pub(crate) struct SignalInner {
    id: u64,
    value: RefCell<Value>,
    equals: Equality,
    subscribers: RefCell<Vec<Weak<MemoInner>>>,
}

/// A reactive cell: a `(get, set)` pair over plain storage.
#[derive(Clone)]
pub struct Signal {
    inner: Rc<SignalInner>,
}

impl Signal {
    /// The signal's runtime id (snapshot bindings key on it).
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Read the value, subscribing the current computation.
    ///
    /// A snapshot-scoped computation reading during hydration gets the
    /// value recorded at its first read, regardless of intervening writes.
    pub fn get(&self) -> Value {
        if let Some(comp) = current_computation() {
            add_subscriber(&self.inner.subscribers, &comp);
            let live = self.inner.value.borrow().clone();
            if let Some(snapshot) =
                crate::hydrate::snapshot::intercept_read(&comp, self.inner.id, &live)
            {
                return snapshot;
            }
            return live;
        }
        self.inner.value.borrow().clone()
    }

    /// Read without subscribing or snapshot interception.
    pub fn peek(&self) -> Value {
        self.inner.value.borrow().clone()
    }

    /// Write the value. Subscribers rerun when the equality policy says
    /// the value changed. The real value always updates, even while
    /// snapshot-scoped readers observe their recorded values.
    pub fn set(&self, value: impl Into<Value>) {
        let value = value.into();
        let changed = {
            let mut slot = self.inner.value.borrow_mut();
            let changed = !self.inner.equals.are_equal(&slot, &value);
            *slot = value;
            changed
        };
        if changed {
            for comp in live_subscribers(&self.inner.subscribers) {
                mark_stale(&comp);
            }
        }
    }

    /// Write through a function of the current value.
    pub fn update(&self, f: impl FnOnce(&Value) -> Value) {
        let next = f(&self.inner.value.borrow().clone());
        self.set(next);
    }
}

/// Create a signal over a plain value.
///
/// For the function form (a suspension-aware carrier delegating to a
/// memo), see [`create_signal_from`].
pub fn create_signal(initial: impl Into<Value>) -> Signal {
    create_signal_with(initial, Equality::Default)
}

/// Create a signal with an explicit equality policy. `Equality::Never`
/// gives the re-run latch used by boundary triggers.
pub fn create_signal_with(initial: impl Into<Value>, equals: Equality) -> Signal {
    Signal {
        inner: Rc::new(SignalInner {
            id: next_primitive_id(),
            value: RefCell::new(initial.into()),
            equals,
            subscribers: RefCell::new(Vec::new()),
        }),
    }
}

// =============================================================================
// Effects
// =============================================================================

/// Run `f` immediately under the current owner, re-running when its
/// dependencies change.
pub fn create_render_effect(f: impl Fn() -> RenderResult<()> + 'static) -> RenderResult<Memo> {
    create_memo(
        move |_| {
            f()?;
            Ok(Value::Null)
        },
        crate::types::PrimitiveOptions::default(),
    )
}

/// Effect that is a no-op during server rendering; on the client it is
/// deferred until hydration completes, then behaves like a render effect
/// under the owner it was created in.
pub fn create_effect(f: impl Fn() -> RenderResult<()> + 'static) -> RenderResult<()> {
    if crate::render::current_render_context().is_some() {
        return Ok(());
    }
    if crate::hydrate::is_hydrating() {
        let f = Rc::new(f);
        let owner = crate::engine::current_owner();
        crate::hydrate::on_hydration_end(move || {
            let f = f.clone();
            let start = || {
                if let Err(error) = create_render_effect(move || f()) {
                    tracing::warn!(%error, "deferred effect failed to start");
                }
            };
            match &owner {
                Some(owner) => crate::engine::run_with_owner(owner, start),
                None => start(),
            }
        });
        return Ok(());
    }
    create_render_effect(f).map(|_| ())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{create_root, reset_owner_state};
    use crate::task::reset_tasks;
    use crate::types::PrimitiveOptions;

    fn reset_all() {
        reset_tasks();
        reset_owner_state();
        reset_reactive_state();
        crate::hydrate::reset_shared_config();
    }

    #[test]
    fn test_signal_get_set() {
        reset_all();

        let count = create_signal(0i64);
        assert_eq!(count.get(), Value::Int(0));
        count.set(5i64);
        assert_eq!(count.get(), Value::Int(5));
    }

    #[test]
    fn test_memo_tracks_signal() {
        reset_all();

        let ((count, doubled), _root) = create_root("t", || {
            let count = create_signal(2i64);
            let c = count.clone();
            let doubled = create_memo(
                move |_| Ok(Value::Int(c.get().as_int().unwrap_or(0) * 2)),
                PrimitiveOptions::default(),
            )
            .unwrap();
            (count, doubled)
        });

        assert_eq!(doubled.get().unwrap(), Value::Int(4));
        count.set(10i64);
        assert_eq!(doubled.get().unwrap(), Value::Int(20));
    }

    #[test]
    fn test_equality_suppresses_rerun() {
        reset_all();

        let runs = Rc::new(Cell::new(0u32));
        let ((sig, _memo), _root) = create_root("t", || {
            let sig = create_signal(1i64);
            let s = sig.clone();
            let runs2 = runs.clone();
            let memo = create_memo(
                move |_| {
                    runs2.set(runs2.get() + 1);
                    Ok(s.get())
                },
                PrimitiveOptions::default(),
            )
            .unwrap();
            (sig, memo)
        });

        assert_eq!(runs.get(), 1);
        sig.set(1i64); // unchanged under default equality
        assert_eq!(runs.get(), 1);
        sig.set(2i64);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_never_equality_is_a_latch() {
        reset_all();

        let runs = Rc::new(Cell::new(0u32));
        let ((trigger, _memo), _root) = create_root("t", || {
            let trigger = create_signal_with(Value::Null, Equality::Never);
            let t = trigger.clone();
            let runs2 = runs.clone();
            let memo = create_memo(
                move |_| {
                    runs2.set(runs2.get() + 1);
                    t.get();
                    Ok(Value::Null)
                },
                PrimitiveOptions::default(),
            )
            .unwrap();
            (trigger, memo)
        });

        assert_eq!(runs.get(), 1);
        trigger.set(Value::Null);
        assert_eq!(runs.get(), 2);
        trigger.set(Value::Null);
        assert_eq!(runs.get(), 3);
    }

    #[test]
    fn test_lazy_memo_defers_to_read() {
        reset_all();

        let runs = Rc::new(Cell::new(0u32));
        let (memo, _root) = create_root("t", || {
            let runs2 = runs.clone();
            create_memo(
                move |_| {
                    runs2.set(runs2.get() + 1);
                    Ok(Value::Int(1))
                },
                PrimitiveOptions {
                    lazy: true,
                    ..Default::default()
                },
            )
            .unwrap()
        });

        assert_eq!(runs.get(), 0);
        assert_eq!(memo.get().unwrap(), Value::Int(1));
        assert_eq!(runs.get(), 1);
    }
}
