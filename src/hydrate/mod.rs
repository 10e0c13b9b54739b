//! Client-side hydration state - the shared config.
//!
//! Hydration adopts server output instead of recomputing it: a store of
//! serialized entries keyed by owner id, a `hydrating` flag whose
//! transitions drive the snapshot-scope lifecycle, a pending-boundary
//! counter, and the end-of-hydration callback queue.
//!
//! The `hydrating` flag is intercepted: flipping false→true turns
//! snapshot capture on and resets the boundary counter; flipping
//! true→false releases the top-level snapshot scope, clears bindings,
//! reruns stale computations, and schedules the completion check.

pub mod snapshot;

mod boundary;

pub use boundary::hydrate_loading_boundary;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::engine::Owner;
use crate::task::{queue_microtask, Promise};
use crate::types::Value;

// =============================================================================
// Shared Config
// =============================================================================

type ModuleLoader = Rc<dyn Fn(&str) -> Promise>;

struct SharedState {
    hydrating: bool,
    done: bool,
    /// Loading boundaries still waiting for data or assets.
    pending_boundaries: i64,
    /// Per-boundary hydration re-entry depth (a resumed boundary is
    /// "hydrating locally" even after the global flag cleared).
    boundary_depth: u32,
    store: HashMap<String, Value>,
    on_end: Vec<Box<dyn FnOnce()>>,
    cleanup_fragment: Option<Rc<dyn Fn(&str)>>,
    module_loader: Option<ModuleLoader>,
    /// Element registry for id lookup during adoption.
    registry: HashMap<String, String>,
    /// Root owner captured by the first hydrated primitive.
    top_scope: Option<Owner>,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            hydrating: false,
            done: false,
            pending_boundaries: 0,
            boundary_depth: 0,
            store: HashMap::new(),
            on_end: Vec::new(),
            cleanup_fragment: None,
            module_loader: None,
            registry: HashMap::new(),
            top_scope: None,
        }
    }
}

thread_local! {
    static SHARED: RefCell<SharedState> = RefCell::new(SharedState::new());
}

// =============================================================================
// Hydrating Flag
// =============================================================================

/// True during the synchronous hydration walk or inside a resumed
/// boundary's local re-entry.
pub fn is_hydrating() -> bool {
    SHARED.with(|s| {
        let s = s.borrow();
        s.hydrating || s.boundary_depth > 0
    })
}

/// Load the side-channel entries and begin hydration.
pub fn init_hydration(entries: impl IntoIterator<Item = (String, Value)>) {
    SHARED.with(|s| {
        let mut s = s.borrow_mut();
        s.store.extend(entries);
        s.done = false;
    });
    set_hydrating(true);
}

/// The intercepted `hydrating` setter.
pub fn set_hydrating(on: bool) {
    let transition = SHARED.with(|s| {
        let mut s = s.borrow_mut();
        let was = s.hydrating;
        s.hydrating = on;
        (was, on)
    });
    match transition {
        (false, true) => {
            tracing::debug!("hydration started");
            snapshot::set_snapshot_capture(true);
            SHARED.with(|s| s.borrow_mut().pending_boundaries = 0);
        }
        (true, false) => {
            tracing::debug!("hydration walk finished");
            let top = SHARED.with(|s| s.borrow_mut().top_scope.take());
            if let Some(owner) = top {
                snapshot::release_snapshot_scope(&owner);
            }
            snapshot::clear_snapshots();
            snapshot::set_snapshot_capture(false);
            queue_microtask(check_hydration_done);
        }
        _ => {}
    }
}

/// Capture the enclosing root as the top-level snapshot scope the first
/// time a hydrated primitive runs.
pub(crate) fn mark_hydration_scope(owner: &Owner) {
    SHARED.with(|s| {
        let mut s = s.borrow_mut();
        if !s.hydrating || s.top_scope.is_some() {
            return;
        }
        let root = owner.tree_root();
        snapshot::mark_snapshot_scope(&root);
        s.top_scope = Some(root);
    });
}

// =============================================================================
// Hydration Store
// =============================================================================

/// True when a serialized entry exists for the id.
pub fn has(id: &str) -> bool {
    SHARED.with(|s| s.borrow().store.contains_key(id))
}

/// Look up a serialized entry.
pub fn load(id: &str) -> Option<Value> {
    SHARED.with(|s| s.borrow().store.get(id).cloned())
}

/// Mark an entry consumed, freeing it.
pub fn gather(id: &str) {
    SHARED.with(|s| {
        s.borrow_mut().store.remove(id);
    });
}

/// `load` + `gather` in one step - the common consumption path of
/// hydrated primitives.
pub(crate) fn consume(id: &str) -> Option<Value> {
    SHARED.with(|s| s.borrow_mut().store.remove(id))
}

// =============================================================================
// Boundary Counter & Completion
// =============================================================================

pub(crate) fn add_pending_boundary() {
    SHARED.with(|s| s.borrow_mut().pending_boundaries += 1);
}

/// Decrement the pending counter; at zero (with the walk finished) the
/// hydration-end callbacks drain.
pub(crate) fn complete_boundary() {
    SHARED.with(|s| s.borrow_mut().pending_boundaries -= 1);
    check_hydration_done();
}

/// A resumed boundary re-enters hydration locally: the depth keeps
/// `is_hydrating` true for its children and snapshot capture comes back
/// on for its scope.
pub(crate) fn begin_boundary_hydration() {
    SHARED.with(|s| s.borrow_mut().boundary_depth += 1);
    snapshot::set_snapshot_capture(true);
}

pub(crate) fn end_boundary_hydration() {
    let capture_off = SHARED.with(|s| {
        let mut s = s.borrow_mut();
        s.boundary_depth = s.boundary_depth.saturating_sub(1);
        s.boundary_depth == 0 && !s.hydrating
    });
    if capture_off {
        snapshot::set_snapshot_capture(false);
    }
}

fn check_hydration_done() {
    let finished = SHARED.with(|s| {
        let s = s.borrow();
        !s.hydrating && s.pending_boundaries <= 0 && !s.done
    });
    if finished {
        set_done(true);
    }
}

/// Register a callback for when hydration fully completes (walk done and
/// every boundary resumed). Runs soon if already done.
pub fn on_hydration_end(f: impl FnOnce() + 'static) {
    let done = SHARED.with(|s| s.borrow().done);
    if done {
        queue_microtask(f);
    } else {
        SHARED.with(|s| s.borrow_mut().on_end.push(Box::new(f)));
    }
}

/// True once hydration has fully completed.
pub fn is_done() -> bool {
    SHARED.with(|s| s.borrow().done)
}

/// The intercepted `done` setter: setting true drains the callbacks.
pub fn set_done(done: bool) {
    let callbacks = SHARED.with(|s| {
        let mut s = s.borrow_mut();
        s.done = done;
        if done {
            std::mem::take(&mut s.on_end)
        } else {
            Vec::new()
        }
    });
    if !callbacks.is_empty() {
        tracing::debug!(count = callbacks.len(), "hydration complete; draining callbacks");
    }
    for callback in callbacks {
        callback();
    }
}

// =============================================================================
// Fragment & Asset Hooks
// =============================================================================

/// Install the hook that removes an orphaned streaming fragment from the
/// DOM.
pub fn set_cleanup_fragment_hook(f: impl Fn(&str) + 'static) {
    SHARED.with(|s| s.borrow_mut().cleanup_fragment = Some(Rc::new(f)));
}

/// Remove an orphaned streaming fragment (boundary disposed before its
/// data resumed).
pub fn cleanup_fragment(id: &str) {
    let hook = SHARED.with(|s| s.borrow().cleanup_fragment.clone());
    match hook {
        Some(hook) => hook(id),
        None => tracing::warn!(id, "orphaned fragment with no cleanup hook installed"),
    }
}

/// Install the per-boundary module loader used for asset preloads.
pub fn set_module_loader(f: impl Fn(&str) -> Promise + 'static) {
    SHARED.with(|s| s.borrow_mut().module_loader = Some(Rc::new(f)));
}

pub(crate) fn load_module(url: &str) -> Promise {
    let loader = SHARED.with(|s| s.borrow().module_loader.clone());
    match loader {
        Some(loader) => loader(url),
        None => Promise::resolved(Value::Null),
    }
}

// =============================================================================
// Element Registry
// =============================================================================

/// Record an element marker for id lookup during adoption.
pub fn register_element(id: impl Into<String>, marker: impl Into<String>) {
    SHARED.with(|s| {
        s.borrow_mut().registry.insert(id.into(), marker.into());
    });
}

pub fn registry_lookup(id: &str) -> Option<String> {
    SHARED.with(|s| s.borrow().registry.get(id).cloned())
}

// =============================================================================
// Reset
// =============================================================================

/// Reset all hydration state (test isolation).
pub fn reset_shared_config() {
    SHARED.with(|s| *s.borrow_mut() = SharedState::new());
    snapshot::reset_snapshot_state();
}

// =============================================================================
// Tests
// =============================================================================
