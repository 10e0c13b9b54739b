//! Cooperative task layer - deterministic microtask scheduling.
//!
//! The runtime is single-threaded and event-loop based. Server rendering
//! alternates between synchronous reactive execution and settlement
//! callbacks on promises; the client schedules stream continuations and
//! hydration completion checks the same way. All of that lands here:
//! a FIFO microtask queue drained explicitly by the host (or by tests).
//!
//! There are no threads to coordinate; ordering is the only contract.
//!
//! # Example
//!
//! ```ignore
//! use spark_ssr::task::{queue_microtask, flush_microtasks};
//!
//! queue_microtask(|| println!("later"));
//! println!("now");
//! flush_microtasks(); // prints "later"
//! ```

mod promise;
mod stream;

pub use promise::{Promise, PromiseResolver, Settlement};
pub use stream::{StreamEvent, StreamWriter, ValueStream};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

// =============================================================================
// Microtask Queue
// =============================================================================

thread_local! {
    /// Pending microtasks, FIFO.
    static QUEUE: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());

    /// Re-entrancy guard: flushing from inside a flush is a no-op.
    static FLUSHING: Cell<bool> = const { Cell::new(false) };

    /// Scoped resource-request interceptor flag (see [`with_resource_interceptor`]).
    static INTERCEPTING: Cell<bool> = const { Cell::new(false) };
}

/// Enqueue a task to run on the next flush.
pub fn queue_microtask(f: impl FnOnce() + 'static) {
    QUEUE.with(|q| q.borrow_mut().push_back(Box::new(f)));
}

/// Number of tasks currently queued.
pub fn pending_microtasks() -> usize {
    QUEUE.with(|q| q.borrow().len())
}

/// Drain the queue to empty, including tasks enqueued while draining.
///
/// Nested calls (a task that itself flushes) are no-ops; the outermost
/// flush finishes the drain.
pub fn flush_microtasks() {
    if FLUSHING.with(|f| f.get()) {
        return;
    }
    FLUSHING.with(|f| f.set(true));
    loop {
        let task = QUEUE.with(|q| q.borrow_mut().pop_front());
        match task {
            Some(task) => task(),
            None => break,
        }
    }
    FLUSHING.with(|f| f.set(false));
}

/// Drop all queued tasks (test isolation).
pub fn reset_tasks() {
    QUEUE.with(|q| q.borrow_mut().clear());
    FLUSHING.with(|f| f.set(false));
    INTERCEPTING.with(|f| f.set(false));
}

// =============================================================================
// Resource-Request Interceptor
// =============================================================================

/// Run `f` with the resource-request interceptor active.
///
/// Used for the single synchronous dependency scan of `ssr_source:
/// Initial`/`Client` primitives: the compute runs once so that its signal
/// reads are captured, while resource producers consult
/// [`is_intercepting`] and return inert placeholders instead of starting
/// real work. The flag is restored on all exit paths.
pub fn with_resource_interceptor<T>(f: impl FnOnce() -> T) -> T {
    let prev = INTERCEPTING.with(|i| i.replace(true));
    let result = f();
    INTERCEPTING.with(|i| i.set(prev));
    result
}

/// True while a dependency scan is running; resource producers should
/// return placeholders and start no real work.
pub fn is_intercepting() -> bool {
    INTERCEPTING.with(|i| i.get())
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
    fn test_fifo_order() {
        reset_tasks();

        let log: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            queue_microtask(move || log.borrow_mut().push(i));
        }
        assert_eq!(pending_microtasks(), 3);

        flush_microtasks();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert_eq!(pending_microtasks(), 0);
    }

    #[test]
    fn test_tasks_enqueued_while_draining_run() {
        reset_tasks();

        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        queue_microtask(move || {
            log2.borrow_mut().push("outer");
            let log3 = log2.clone();
            queue_microtask(move || log3.borrow_mut().push("inner"));
        });

        flush_microtasks();
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_interceptor_scoped() {
        reset_tasks();

        assert!(!is_intercepting());
        let seen = with_resource_interceptor(|| is_intercepting());
        assert!(seen);
        assert!(!is_intercepting());
    }
}
