//! Owner tree - deterministic identifier allocation and cleanup.
//!
//! Every reactive primitive is created under an owner. Owners form a
//! dynamic tree; each owner hands out child ids left-to-right by appending
//! the decimal of its child counter to its own id. Because `dispose`
//! always resets the counter, re-executing the same owner body regenerates
//! the same sequence of ids - the contract that lets server HTML and
//! client DOM be reconciled without an explicit DOM path scheme: the k-th
//! computation created under owner `O` always has id `O.id + k`.
//!
//! # Example
//!
//! ```ignore
//! use spark_ssr::engine::{create_root, create_owner, on_cleanup};
//!
//! let (_, root) = create_root("t", || {
//!     let child = create_owner(None).unwrap(); // id "t0"
//!     on_cleanup(|| println!("bye"));
//! });
//! root.dispose(false);
//! ```

mod context;

pub use context::{create_context, create_context_with_default, provide_context, use_context, Context};

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::types::{RenderError, RenderResult};

// =============================================================================
// Owner
// =============================================================================

/// Liveness of an owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnerState {
    /// Live, attached.
    Alive,
    /// Cleanups ran with `keep_alive`; still attached, may re-execute.
    Retained,
    /// Fully disposed and detached.
    Disposed,
}

pub(crate) struct OwnerInner {
    id: String,
    child_count: Cell<u32>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
    contexts: RefCell<HashMap<u64, Rc<dyn Any>>>,
    state: Cell<OwnerState>,
    parent: Weak<OwnerInner>,
    children: RefCell<Vec<Owner>>,
    snapshot_marked: Cell<bool>,
}

/// Cheap-clone handle to a node in the ownership tree.
#[derive(Clone)]
pub struct Owner {
    inner: Rc<OwnerInner>,
}

impl Owner {
    fn new(id: String, parent: Weak<OwnerInner>) -> Owner {
        Owner {
            inner: Rc::new(OwnerInner {
                id,
                child_count: Cell::new(0),
                cleanups: RefCell::new(Vec::new()),
                contexts: RefCell::new(HashMap::new()),
                state: Cell::new(OwnerState::Alive),
                parent,
                children: RefCell::new(Vec::new()),
                snapshot_marked: Cell::new(false),
            }),
        }
    }

    /// A detached root owner with an explicit id (conventionally a short
    /// prefix such as `"t"`).
    pub fn root(id: impl Into<String>) -> Owner {
        Owner::new(id.into(), Weak::new())
    }

    /// This owner's id.
    pub fn id(&self) -> String {
        self.inner.id.clone()
    }

    pub fn state(&self) -> OwnerState {
        self.inner.state.get()
    }

    /// Parent owner, if attached.
    pub fn parent(&self) -> Option<Owner> {
        self.inner.parent.upgrade().map(|inner| Owner { inner })
    }

    /// The root of this owner's tree.
    pub fn tree_root(&self) -> Owner {
        let mut current = self.clone();
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// Append a cleanup handler; handlers run in LIFO order on dispose.
    pub fn add_cleanup(&self, f: impl FnOnce() + 'static) {
        self.inner.cleanups.borrow_mut().push(Box::new(f));
    }

    /// Run cleanups and reset child-id allocation.
    ///
    /// Children are disposed fully first, then this owner's cleanups run in
    /// LIFO order. `child_count` always resets to 0 so re-execution of the
    /// same body regenerates the same id sequence. With `keep_alive` the
    /// owner stays attached (retained); otherwise it is detached from its
    /// parent and marked disposed.
    pub fn dispose(&self, keep_alive: bool) {
        self.dispose_children();

        let cleanups = std::mem::take(&mut *self.inner.cleanups.borrow_mut());
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }

        self.inner.child_count.set(0);
        if keep_alive {
            self.inner.state.set(OwnerState::Retained);
        } else {
            self.inner.state.set(OwnerState::Disposed);
            self.inner.contexts.borrow_mut().clear();
            if let Some(parent) = self.inner.parent.upgrade() {
                parent
                    .children
                    .borrow_mut()
                    .retain(|child| !Rc::ptr_eq(&child.inner, &self.inner));
            }
        }
    }

    /// Fully dispose all children and reset child-id allocation, leaving
    /// this owner's own cleanups and state untouched. This is the boundary
    /// retry path: re-execution after `dispose_children` regenerates the
    /// same child id sequence.
    pub fn dispose_children(&self) {
        let children = std::mem::take(&mut *self.inner.children.borrow_mut());
        for child in children {
            child.dispose(false);
        }
        self.inner.child_count.set(0);
    }

    pub(crate) fn set_context_value(&self, key: u64, value: Rc<dyn Any>) {
        self.inner.contexts.borrow_mut().insert(key, value);
    }

    pub(crate) fn lookup_context_value(&self, key: u64) -> Option<Rc<dyn Any>> {
        let mut current = Some(self.inner.clone());
        while let Some(inner) = current {
            if let Some(found) = inner.contexts.borrow().get(&key) {
                return Some(found.clone());
            }
            current = inner.parent.upgrade();
        }
        None
    }

    // -------------------------------------------------------------------------
    // Snapshot scope marking (consumed by hydrate::snapshot)
    // -------------------------------------------------------------------------

    pub(crate) fn mark_snapshot(&self) {
        self.inner.snapshot_marked.set(true);
    }

    pub(crate) fn unmark_snapshot(&self) {
        self.inner.snapshot_marked.set(false);
    }

    /// Id of the nearest ancestor (or self) marked as a snapshot scope.
    pub(crate) fn nearest_snapshot_scope(&self) -> Option<String> {
        let mut current = Some(self.inner.clone());
        while let Some(inner) = current {
            if inner.snapshot_marked.get() {
                return Some(inner.id.clone());
            }
            current = inner.parent.upgrade();
        }
        None
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &Owner) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

// =============================================================================
// Current Owner
// =============================================================================

thread_local! {
    static CURRENT_OWNER: RefCell<Option<Owner>> = const { RefCell::new(None) };
}

/// The owner new primitives attach to, if any.
pub fn current_owner() -> Option<Owner> {
    CURRENT_OWNER.with(|current| current.borrow().clone())
}

struct OwnerGuard {
    previous: Option<Owner>,
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        CURRENT_OWNER.with(|current| *current.borrow_mut() = self.previous.take());
    }
}

/// Establish `owner` as the current owner for the duration of `f`;
/// the previous owner is restored on all exit paths.
pub fn run_with_owner<T>(owner: &Owner, f: impl FnOnce() -> T) -> T {
    let guard = OwnerGuard {
        previous: CURRENT_OWNER.with(|current| current.borrow_mut().replace(owner.clone())),
    };
    let result = f();
    drop(guard);
    result
}

/// Create a detached root owner with an explicit id and run `f` under it.
pub fn create_root<T>(id: impl Into<String>, f: impl FnOnce() -> T) -> (T, Owner) {
    let root = Owner::root(id);
    let result = run_with_owner(&root, f);
    (result, root)
}

/// Create a child of the current owner.
///
/// The child id is `parent.id` + the decimal of `parent.child_count`
/// (which is consumed), unless an explicit id is supplied. With no current
/// owner, an explicit id creates a detached root; otherwise this is a
/// `NoOwner` error.
pub fn create_owner(explicit_id: Option<&str>) -> RenderResult<Owner> {
    match current_owner() {
        Some(parent) => {
            let id = match explicit_id {
                Some(id) => id.to_string(),
                None => get_next_child_id(&parent),
            };
            let child = Owner::new(id, Rc::downgrade(&parent.inner));
            parent.inner.children.borrow_mut().push(child.clone());
            Ok(child)
        }
        None => match explicit_id {
            Some(id) => Ok(Owner::root(id)),
            None => Err(RenderError::NoOwner),
        },
    }
}

/// Consume one child-id slot under `owner` without creating an owner.
pub fn get_next_child_id(owner: &Owner) -> String {
    let n = owner.inner.child_count.get();
    owner.inner.child_count.set(n + 1);
    format!("{}{}", owner.inner.id, n)
}

/// The next child id under `owner` without consuming the slot.
pub fn peek_next_child_id(owner: &Owner) -> String {
    format!("{}{}", owner.inner.id, owner.inner.child_count.get())
}

/// Register a cleanup on the current owner. Without an owner the handler
/// is dropped (there is nothing whose disposal could run it).
pub fn on_cleanup(f: impl FnOnce() + 'static) {
    match current_owner() {
        Some(owner) => owner.add_cleanup(f),
        None => tracing::warn!("on_cleanup called without an active owner; handler dropped"),
    }
}

/// Clear the current-owner pointer (test isolation).
pub fn reset_owner_state() {
    CURRENT_OWNER.with(|current| *current.borrow_mut() = None);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_child_ids_are_sequential_suffixes() {
        reset_owner_state();

        let (ids, _root) = create_root("t", || {
            let a = create_owner(None).unwrap();
            let b = create_owner(None).unwrap();
            let c = create_owner(None).unwrap();
            vec![a.id(), b.id(), c.id()]
        });
        assert_eq!(ids, vec!["t0", "t1", "t2"]);
    }

    #[test]
    fn test_nested_ids_compose() {
        reset_owner_state();

        let (id, _root) = create_root("t", || {
            let outer = create_owner(None).unwrap();
            run_with_owner(&outer, || {
                let inner = create_owner(None).unwrap();
                inner.id()
            })
        });
        assert_eq!(id, "t00");
    }

    #[test]
    fn test_dispose_resets_id_allocation() {
        reset_owner_state();

        let (_, root) = create_root("t", || {});
        let first: Vec<String> = run_with_owner(&root, || {
            (0..3).map(|_| create_owner(None).unwrap().id()).collect()
        });

        root.dispose(true);
        let second: Vec<String> = run_with_owner(&root, || {
            (0..3).map(|_| create_owner(None).unwrap().id()).collect()
        });

        assert_eq!(first, second, "dispose must be an observational reset for ids");
    }

    #[test]
    fn test_dispose_children_resets_ids_only() {
        reset_owner_state();

        let cleaned = Rc::new(RefCell::new(false));
        let cleaned2 = cleaned.clone();

        let (_, root) = create_root("t", || {});
        run_with_owner(&root, || {
            let child = create_owner(None).unwrap();
            child.add_cleanup(move || *cleaned2.borrow_mut() = true);
        });

        root.dispose_children();
        assert!(*cleaned.borrow(), "child cleanups run on dispose_children");
        assert_eq!(peek_next_child_id(&root), "t0");
        assert_eq!(root.state(), OwnerState::Alive);
    }

    #[test]
    fn test_cleanups_run_lifo() {
        reset_owner_state();

        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let (_, root) = create_root("t", || {
            for i in 0..3 {
                let order = order.clone();
                on_cleanup(move || order.borrow_mut().push(i));
            }
        });
        root.dispose(false);
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
        assert_eq!(root.state(), OwnerState::Disposed);
    }

    #[test]
    fn test_run_with_owner_restores_previous() {
        reset_owner_state();

        let (_, root) = create_root("t", || {});
        let other = Owner::root("u");
        run_with_owner(&root, || {
            run_with_owner(&other, || {
                assert_eq!(current_owner().unwrap().id(), "u");
            });
            assert_eq!(current_owner().unwrap().id(), "t");
        });
        assert!(current_owner().is_none());
    }

    #[test]
    fn test_peek_does_not_consume() {
        reset_owner_state();

        let root = Owner::root("t");
        assert_eq!(peek_next_child_id(&root), "t0");
        assert_eq!(peek_next_child_id(&root), "t0");
        assert_eq!(get_next_child_id(&root), "t0");
        assert_eq!(peek_next_child_id(&root), "t1");
    }

    #[test]
    fn test_create_owner_without_owner_or_id_fails() {
        reset_owner_state();
        assert!(matches!(
            create_owner(None),
            Err(crate::types::RenderError::NoOwner)
        ));
    }
}
