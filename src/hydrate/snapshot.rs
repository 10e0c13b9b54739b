//! Snapshot scope - frozen signal reads during hydration.
//!
//! Writes during hydration are safe: they update the real signal value,
//! but any computation created under a snapshot-scoped owner reads the
//! value recorded at its *first* read for as long as the scope lives.
//! That guarantees the computation's output matches the server HTML it is
//! adopting. Releasing a scope reruns its reader computations against
//! live values.
//!
//! Bindings live in a process-wide map keyed by scope (owner id), each
//! holding `(signal id, snapshot value)` pairs plus the computations that
//! read through them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::engine::Owner;
use crate::reactive::MemoInner;
use crate::types::Value;

#[derive(Default)]
struct ScopeData {
    bindings: HashMap<u64, Value>,
    readers: Vec<Weak<MemoInner>>,
}

#[derive(Default)]
struct SnapshotState {
    capture: bool,
    scopes: HashMap<String, ScopeData>,
}

thread_local! {
    static SNAPSHOTS: RefCell<SnapshotState> = RefCell::new(SnapshotState::default());
}

/// Global switch for the capture policy.
pub fn set_snapshot_capture(on: bool) {
    SNAPSHOTS.with(|s| s.borrow_mut().capture = on);
}

pub fn is_snapshot_capture_on() -> bool {
    SNAPSHOTS.with(|s| s.borrow().capture)
}

/// Mark `owner` as a snapshot scope: computations created under it become
/// snapshot readers.
pub fn mark_snapshot_scope(owner: &Owner) {
    owner.mark_snapshot();
    SNAPSHOTS.with(|s| {
        s.borrow_mut().scopes.entry(owner.id()).or_default();
    });
    tracing::trace!(id = %owner.id(), "snapshot scope marked");
}

/// Release `owner`'s scope: its bindings drop, and its reader
/// computations rerun against live values.
pub fn release_snapshot_scope(owner: &Owner) {
    owner.unmark_snapshot();
    let readers = SNAPSHOTS.with(|s| {
        s.borrow_mut()
            .scopes
            .remove(&owner.id())
            .map(|scope| scope.readers)
            .unwrap_or_default()
    });
    tracing::trace!(id = %owner.id(), readers = readers.len(), "snapshot scope released");
    for reader in readers {
        if let Some(comp) = reader.upgrade() {
            crate::reactive::update_memo(&comp);
        }
    }
}

/// Drop every snapshot binding.
pub fn clear_snapshots() {
    SNAPSHOTS.with(|s| s.borrow_mut().scopes.clear());
}

pub(crate) fn is_scope_active(id: &str) -> bool {
    SNAPSHOTS.with(|s| s.borrow().scopes.contains_key(id))
}

/// Track a computation as a reader of a scope so release reruns it.
pub(crate) fn register_reader(scope_id: &str, comp: &Rc<MemoInner>) {
    SNAPSHOTS.with(|s| {
        let mut state = s.borrow_mut();
        let Some(scope) = state.scopes.get_mut(scope_id) else {
            return;
        };
        let already = scope
            .readers
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|r| Rc::ptr_eq(&r, comp)));
        if !already {
            scope.readers.push(Rc::downgrade(comp));
        }
    });
}

/// Intercept a signal read by a snapshot-scoped computation: record the
/// live value on first read and return the recording thereafter. Returns
/// `None` when the read should fall through to the live value.
pub(crate) fn intercept_read(
    comp: &Rc<MemoInner>,
    signal_id: u64,
    live: &Value,
) -> Option<Value> {
    let scope_id = comp.snapshot_scope.borrow().clone()?;
    SNAPSHOTS.with(|s| {
        let mut state = s.borrow_mut();
        if !state.capture {
            return None;
        }
        let scope = state.scopes.get_mut(&scope_id)?;
        let snapshot = scope
            .bindings
            .entry(signal_id)
            .or_insert_with(|| live.clone())
            .clone();
        let already = scope
            .readers
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|r| Rc::ptr_eq(&r, comp)));
        if !already {
            scope.readers.push(Rc::downgrade(comp));
        }
        Some(snapshot)
    })
}

/// Reset everything (test isolation).
pub fn reset_snapshot_state() {
    SNAPSHOTS.with(|s| *s.borrow_mut() = SnapshotState::default());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{create_root, reset_owner_state, run_with_owner};
    use crate::reactive::{create_memo, create_signal, reset_reactive_state};
    use crate::task::reset_tasks;
    use crate::types::PrimitiveOptions;

    fn reset_all() {
        reset_tasks();
        reset_owner_state();
        reset_reactive_state();
        crate::hydrate::reset_shared_config();
    }

    #[test]
    fn test_snapshot_read_stability_and_release() {
        reset_all();

        let x = create_signal(10i64);
        let (_, root) = create_root("t", || {});
        mark_snapshot_scope(&root);
        set_snapshot_capture(true);

        let x2 = x.clone();
        let doubled = run_with_owner(&root, || {
            create_memo(
                move |_| Ok(Value::Int(x2.get().as_int().unwrap_or(0) * 2)),
                PrimitiveOptions::default(),
            )
            .unwrap()
        });

        assert_eq!(doubled.get().unwrap(), Value::Int(20));

        // The write lands on the real value, but the scoped reader still
        // observes its first-read snapshot.
        x.set(100i64);
        assert_eq!(x.peek(), Value::Int(100));
        assert_eq!(doubled.get().unwrap(), Value::Int(20));

        // Release: readers rerun against live values.
        release_snapshot_scope(&root);
        assert_eq!(doubled.get().unwrap(), Value::Int(200));
    }

    #[test]
    fn test_unscoped_computation_reads_live() {
        reset_all();

        let x = create_signal(1i64);
        set_snapshot_capture(true);
        let x2 = x.clone();
        let (memo, _root) = create_root("t", || {
            create_memo(
                move |_| Ok(x2.get()),
                PrimitiveOptions::default(),
            )
            .unwrap()
        });

        x.set(2i64);
        assert_eq!(memo.get().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_capture_off_reads_live_even_in_scope() {
        reset_all();

        let x = create_signal(1i64);
        let (_, root) = create_root("t", || {});
        mark_snapshot_scope(&root);
        set_snapshot_capture(false);

        let x2 = x.clone();
        let memo = run_with_owner(&root, || {
            create_memo(move |_| Ok(x2.get()), PrimitiveOptions::default()).unwrap()
        });

        x.set(3i64);
        assert_eq!(memo.get().unwrap(), Value::Int(3));
    }

    #[test]
    fn test_point_in_time_consistency_across_signals() {
        reset_all();

        let a = create_signal(1i64);
        let b = create_signal(10i64);
        let (_, root) = create_root("t", || {});
        mark_snapshot_scope(&root);
        set_snapshot_capture(true);

        let (a2, b2) = (a.clone(), b.clone());
        let sum = run_with_owner(&root, || {
            create_memo(
                move |_| {
                    Ok(Value::Int(
                        a2.get().as_int().unwrap_or(0) + b2.get().as_int().unwrap_or(0),
                    ))
                },
                PrimitiveOptions::default(),
            )
            .unwrap()
        });

        assert_eq!(sum.get().unwrap(), Value::Int(11));
        a.set(100i64);
        b.set(1000i64);
        assert_eq!(sum.get().unwrap(), Value::Int(11), "single point-in-time view");

        release_snapshot_scope(&root);
        assert_eq!(sum.get().unwrap(), Value::Int(1100));
    }
}
