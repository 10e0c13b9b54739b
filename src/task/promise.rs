//! Promise - multi-subscriber settlement with peekable state.
//!
//! The settlement fields the side channel relies on (`s` = settled,
//! `v` = value) are first-class here: any holder can peek [`Settlement`]
//! without consuming anything, and any number of callbacks can observe the
//! same settlement. Settlement is monotonic; later resolve/reject calls
//! are ignored.
//!
//! Callbacks run as microtasks, never inline, so subscribers observe a
//! consistent world: settling a promise inside reactive execution cannot
//! re-enter the graph mid-write.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::task::queue_microtask;
use crate::types::{SharedError, Value};

type Callback = Box<dyn FnOnce(Result<Value, SharedError>)>;

/// Peekable settlement state.
#[derive(Clone, Debug, PartialEq)]
pub enum Settlement {
    Pending,
    Resolved(Value),
    Rejected(SharedError),
}

struct PromiseInner {
    settlement: Settlement,
    callbacks: Vec<Callback>,
    /// Set once a settlement has been delivered through the reactive
    /// layer (the `s`/`v` post-settlement fields): a marked promise can be
    /// adopted synchronously, an unmarked one must suspend first.
    adopted: bool,
}

/// A shared, peekable promise over [`Value`].
#[derive(Clone)]
pub struct Promise {
    inner: Rc<RefCell<PromiseInner>>,
}

impl Promise {
    fn new(settlement: Settlement) -> Self {
        Promise {
            inner: Rc::new(RefCell::new(PromiseInner {
                settlement,
                callbacks: Vec::new(),
                adopted: false,
            })),
        }
    }

    /// An already-resolved promise.
    pub fn resolved(value: Value) -> Self {
        Promise::new(Settlement::Resolved(value))
    }

    /// An already-rejected promise.
    pub fn rejected(error: SharedError) -> Self {
        Promise::new(Settlement::Rejected(error))
    }

    /// A pending promise plus its resolver half.
    pub fn deferred() -> (Promise, PromiseResolver) {
        let promise = Promise::new(Settlement::Pending);
        let resolver = PromiseResolver {
            promise: promise.clone(),
        };
        (promise, resolver)
    }

    /// Peek the current settlement.
    pub fn settlement(&self) -> Settlement {
        self.inner.borrow().settlement.clone()
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().settlement, Settlement::Pending)
    }

    /// The resolved value, if resolved (the `v` field post-settlement).
    pub fn resolved_value(&self) -> Option<Value> {
        match &self.inner.borrow().settlement {
            Settlement::Resolved(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Subscribe to settlement. The callback runs as a microtask, even when
    /// the promise is already settled.
    pub fn then(&self, callback: impl FnOnce(Result<Value, SharedError>) + 'static) {
        let settled = {
            let inner = self.inner.borrow();
            match &inner.settlement {
                Settlement::Pending => None,
                Settlement::Resolved(v) => Some(Ok(v.clone())),
                Settlement::Rejected(e) => Some(Err(e.clone())),
            }
        };
        match settled {
            Some(result) => queue_microtask(move || callback(result)),
            None => self.inner.borrow_mut().callbacks.push(Box::new(callback)),
        }
    }

    /// Identity comparison (promises have no structural equality).
    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Record that a settlement was delivered through the reactive layer.
    pub(crate) fn mark_adopted(&self) {
        self.inner.borrow_mut().adopted = true;
    }

    /// The settlement, but only once it has been delivered at least once
    /// (the post-settlement `s`/`v` view). A freshly settled promise that
    /// nothing has observed yet returns `None`, so first adoption always
    /// suspends for a microtask.
    pub(crate) fn adopted_settlement(&self) -> Option<Result<Value, SharedError>> {
        let inner = self.inner.borrow();
        if !inner.adopted {
            return None;
        }
        match &inner.settlement {
            Settlement::Pending => None,
            Settlement::Resolved(v) => Some(Ok(v.clone())),
            Settlement::Rejected(e) => Some(Err(e.clone())),
        }
    }

    fn settle(&self, result: Result<Value, SharedError>) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.settlement, Settlement::Pending) {
                return;
            }
            inner.settlement = match &result {
                Ok(v) => Settlement::Resolved(v.clone()),
                Err(e) => Settlement::Rejected(e.clone()),
            };
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            let result = result.clone();
            queue_microtask(move || callback(result));
        }
    }

    /// A promise that resolves with `Value::Null` once every input has
    /// resolved, or rejects with the first rejection. An empty input
    /// resolves immediately.
    pub fn all(promises: Vec<Promise>) -> Promise {
        if promises.is_empty() {
            return Promise::resolved(Value::Null);
        }
        let (combined, resolver) = Promise::deferred();
        let remaining = Rc::new(RefCell::new(promises.len()));
        for promise in promises {
            let remaining = remaining.clone();
            let resolver = resolver.clone();
            promise.then(move |result| match result {
                Ok(_) => {
                    let mut left = remaining.borrow_mut();
                    *left -= 1;
                    if *left == 0 {
                        resolver.resolve(Value::Null);
                    }
                }
                Err(e) => resolver.reject(e),
            });
        }
        combined
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.borrow().settlement {
            Settlement::Pending => write!(f, "pending"),
            Settlement::Resolved(v) => write!(f, "resolved({v:?})"),
            Settlement::Rejected(e) => write!(f, "rejected({:?})", e.message()),
        }
    }
}

/// Producer half of a deferred promise.
#[derive(Clone)]
pub struct PromiseResolver {
    promise: Promise,
}

impl PromiseResolver {
    pub fn resolve(&self, value: Value) {
        self.promise.settle(Ok(value));
    }

    pub fn reject(&self, error: SharedError) {
        self.promise.settle(Err(error));
    }

    /// The promise this resolver settles.
    pub fn promise(&self) -> Promise {
        self.promise.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================
