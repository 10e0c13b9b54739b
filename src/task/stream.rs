//! ValueStream - pull-capable async iterable over values.
//!
//! A stream is a shared log of yielded values plus a closed/failed flag.
//! Consumers keep their own cursor, which makes the tapped wrapper the
//! server needs (replay the first value to a late consumer, forward the
//! rest) a property of the model instead of special bookkeeping: a tap is
//! a fresh cursor over the same log.
//!
//! Producers push through [`StreamWriter`]; deliveries to subscribers run
//! as microtasks.

use std::cell::RefCell;
use std::rc::Rc;

use crate::task::{queue_microtask, Promise, PromiseResolver};
use crate::types::{SharedError, Value};

/// What a subscriber observes.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A yielded value.
    Item(Value),
    /// Producer finished.
    Closed,
    /// Producer failed.
    Failed(SharedError),
}

struct Subscriber {
    next: usize,
    terminated: bool,
    callback: Rc<RefCell<dyn FnMut(StreamEvent)>>,
}

struct StreamLog {
    items: Vec<Value>,
    closed: bool,
    error: Option<SharedError>,
    subscribers: Vec<Subscriber>,
    first: Option<PromiseResolver>,
}

impl StreamLog {
    fn terminal_event(&self) -> Option<StreamEvent> {
        if let Some(e) = &self.error {
            Some(StreamEvent::Failed(e.clone()))
        } else if self.closed {
            Some(StreamEvent::Closed)
        } else {
            None
        }
    }
}

/// Consumer half of an async-iterable stream of values.
#[derive(Clone)]
pub struct ValueStream {
    log: Rc<RefCell<StreamLog>>,
}

impl ValueStream {
    /// Create a stream and its producer half.
    pub fn channel() -> (ValueStream, StreamWriter) {
        let log = Rc::new(RefCell::new(StreamLog {
            items: Vec::new(),
            closed: false,
            error: None,
            subscribers: Vec::new(),
            first: None,
        }));
        (
            ValueStream { log: log.clone() },
            StreamWriter { log },
        )
    }

    /// A stream that already carries the given items and is closed.
    pub fn of(items: Vec<Value>) -> ValueStream {
        let (stream, writer) = ValueStream::channel();
        for item in items {
            writer.send(item);
        }
        writer.close();
        stream
    }

    /// Synchronously peek the first yielded value, if one was produced.
    pub fn try_first(&self) -> Option<Value> {
        self.log.borrow().items.first().cloned()
    }

    /// Number of values yielded so far.
    pub fn yielded(&self) -> usize {
        self.log.borrow().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.log.borrow().closed
    }

    /// A promise of the first value. Resolves with `Value::Null` if the
    /// stream closes before yielding; rejects if it fails first.
    pub fn first_promise(&self) -> Promise {
        let mut log = self.log.borrow_mut();
        if let Some(first) = log.items.first() {
            return Promise::resolved(first.clone());
        }
        if let Some(error) = log.error.clone() {
            return Promise::rejected(error);
        }
        if log.closed {
            return Promise::resolved(Value::Null);
        }
        match &log.first {
            Some(resolver) => resolver.promise(),
            None => {
                let (promise, resolver) = Promise::deferred();
                log.first = Some(resolver);
                promise
            }
        }
    }

    /// Subscribe from a log position. `start` of 0 replays everything;
    /// 1 skips the first value (the hydration continuation case).
    /// Events are delivered as microtasks, in order, ending with exactly
    /// one `Closed` or `Failed`.
    pub fn subscribe_from(&self, start: usize, callback: impl FnMut(StreamEvent) + 'static) {
        {
            let mut log = self.log.borrow_mut();
            log.subscribers.push(Subscriber {
                next: start,
                terminated: false,
                callback: Rc::new(RefCell::new(callback)),
            });
        }
        schedule_pump(&self.log);
    }

    /// A fresh consumer over the same log: replays the first value, then
    /// forwards subsequent yields.
    pub fn tapped(&self) -> ValueStream {
        ValueStream {
            log: self.log.clone(),
        }
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &ValueStream) -> bool {
        Rc::ptr_eq(&self.log, &other.log)
    }
}

/// Producer half of a stream.
#[derive(Clone)]
pub struct StreamWriter {
    log: Rc<RefCell<StreamLog>>,
}

impl StreamWriter {
    /// Yield a value. Ignored after close/fail.
    pub fn send(&self, value: Value) {
        let first = {
            let mut log = self.log.borrow_mut();
            if log.closed || log.error.is_some() {
                return;
            }
            log.items.push(value.clone());
            if log.items.len() == 1 {
                log.first.take()
            } else {
                None
            }
        };
        if let Some(resolver) = first {
            resolver.resolve(value);
        }
        schedule_pump(&self.log);
    }

    /// Finish the stream.
    pub fn close(&self) {
        let first = {
            let mut log = self.log.borrow_mut();
            if log.closed || log.error.is_some() {
                return;
            }
            log.closed = true;
            log.first.take()
        };
        if let Some(resolver) = first {
            resolver.resolve(Value::Null);
        }
        schedule_pump(&self.log);
    }

    /// Fail the stream.
    pub fn fail(&self, error: SharedError) {
        let first = {
            let mut log = self.log.borrow_mut();
            if log.closed || log.error.is_some() {
                return;
            }
            log.error = Some(error.clone());
            log.first.take()
        };
        if let Some(resolver) = first {
            resolver.reject(error);
        }
        schedule_pump(&self.log);
    }
}

/// Queue a delivery pass. Extra passes are harmless no-ops, so no
/// scheduling state survives a queue reset.
fn schedule_pump(log: &Rc<RefCell<StreamLog>>) {
    let log = log.clone();
    queue_microtask(move || pump(&log));
}

/// Deliver every due event to every subscriber. Callbacks run with the log
/// unborrowed, so they may send, subscribe, or tap re-entrantly.
fn pump(log: &Rc<RefCell<StreamLog>>) {
    loop {
        // Find one due delivery.
        let delivery = {
            let mut log_ref = log.borrow_mut();
            let log_ref = &mut *log_ref;
            let terminal = log_ref.terminal_event();
            let total = log_ref.items.len();
            let mut found = None;
            for sub in log_ref.subscribers.iter_mut() {
                if sub.terminated {
                    continue;
                }
                if sub.next < total {
                    let event = StreamEvent::Item(log_ref.items[sub.next].clone());
                    sub.next += 1;
                    found = Some((sub.callback.clone(), event));
                    break;
                }
                if let Some(event) = &terminal {
                    sub.terminated = true;
                    found = Some((sub.callback.clone(), event.clone()));
                    break;
                }
            }
            found
        };
        match delivery {
            Some((callback, event)) => (callback.borrow_mut())(event),
            None => break,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{flush_microtasks, reset_tasks};

    fn collect(stream: &ValueStream, from: usize) -> Rc<RefCell<Vec<StreamEvent>>> {
        let events: Rc<RefCell<Vec<StreamEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        stream.subscribe_from(from, move |e| sink.borrow_mut().push(e));
        events
    }

    #[test]
    fn test_replay_and_forward() {
        reset_tasks();

        let (stream, writer) = ValueStream::channel();
        writer.send(Value::Int(1));
        flush_microtasks();

        // Late subscriber still sees the first value.
        let events = collect(&stream, 0);
        writer.send(Value::Int(2));
        writer.close();
        flush_microtasks();

        assert_eq!(
            *events.borrow(),
            vec![
                StreamEvent::Item(Value::Int(1)),
                StreamEvent::Item(Value::Int(2)),
                StreamEvent::Closed,
            ]
        );
    }

    #[test]
    fn test_subscribe_from_skips_consumed_prefix() {
        reset_tasks();

        let (stream, writer) = ValueStream::channel();
        writer.send(Value::str("first"));
        writer.send(Value::str("second"));
        writer.close();

        let events = collect(&stream, 1);
        flush_microtasks();
        assert_eq!(
            *events.borrow(),
            vec![StreamEvent::Item(Value::str("second")), StreamEvent::Closed]
        );
    }

    #[test]
    fn test_try_first_is_synchronous() {
        reset_tasks();

        let (stream, writer) = ValueStream::channel();
        assert_eq!(stream.try_first(), None);
        writer.send(Value::Int(9));
        assert_eq!(stream.try_first(), Some(Value::Int(9)));
    }

    #[test]
    fn test_first_promise_settles_once() {
        reset_tasks();

        let (stream, writer) = ValueStream::channel();
        let first = stream.first_promise();
        writer.send(Value::Int(5));
        writer.send(Value::Int(6));
        flush_microtasks();
        assert_eq!(first.resolved_value(), Some(Value::Int(5)));
    }

    #[test]
    fn test_tapped_replays_first_value() {
        reset_tasks();

        let (stream, writer) = ValueStream::channel();
        writer.send(Value::Int(1));
        flush_microtasks();

        let tap = stream.tapped();
        assert_eq!(tap.try_first(), Some(Value::Int(1)));

        let events = collect(&tap, 0);
        writer.send(Value::Int(2));
        flush_microtasks();
        assert_eq!(
            *events.borrow(),
            vec![
                StreamEvent::Item(Value::Int(1)),
                StreamEvent::Item(Value::Int(2)),
            ]
        );
    }

    #[test]
    fn test_failure_terminates_subscribers() {
        reset_tasks();

        let (stream, writer) = ValueStream::channel();
        let events = collect(&stream, 0);
        writer.fail(SharedError::msg("boom"));
        writer.send(Value::Int(1)); // ignored after failure
        flush_microtasks();
        assert_eq!(
            *events.borrow(),
            vec![StreamEvent::Failed(SharedError::msg("boom"))]
        );
    }
}
