//! Stores and projections - structured reactive state.
//!
//! A store is a data tree with a draft-based setter. A projection is a
//! store produced over time by a driver: the first commit snapshots the
//! full state (and locks what SSR sees), subsequent commits emit patch
//! batches into the serialized stream. The client seeds its store from
//! the first-value snapshot and replays arriving batches.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value as Json;

use crate::engine::{create_owner, Owner};
use crate::render::{current_render_context, RenderContext};
use crate::task::{StreamEvent, StreamWriter, ValueStream};
use crate::types::{Equality, PrimitiveOptions, RenderError, RenderResult, Value};

use super::patch::{apply_patches, Draft, PatchRecorder};
use super::{create_signal_with, Signal};

// =============================================================================
// Store
// =============================================================================

struct StoreInner {
    owner: Option<Owner>,
    ctx: Option<RenderContext>,
    state: RefCell<Json>,
    recorder: PatchRecorder,
    /// Change latch: bumped on every commit so readers rerun.
    version: Signal,
    serialize: bool,
}

/// Reactive data tree with draft-based mutation.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl Store {
    /// Read the current state, subscribing the current computation.
    pub fn get(&self) -> Value {
        self.inner.version.get();
        Value::Data(self.inner.state.borrow().clone())
    }

    /// Read without subscribing.
    pub fn peek(&self) -> Json {
        self.inner.state.borrow().clone()
    }

    /// Mutate through a draft; readers rerun afterwards.
    pub fn set(&self, f: impl FnOnce(&mut Draft)) {
        {
            let mut state = self.inner.state.borrow_mut();
            let mut draft = self.inner.recorder.draft(&mut state);
            f(&mut draft);
        }
        // Plain stores do not stream patches; drop the batch.
        let _ = self.inner.recorder.take_batch();
        self.after_write();
    }

    fn after_write(&self) {
        if self.inner.serialize {
            if let (Some(ctx), Some(owner)) = (&self.inner.ctx, &self.inner.owner) {
                ctx.serialize(
                    &owner.id(),
                    Value::Data(self.inner.state.borrow().clone()),
                    false,
                );
            }
        }
        self.inner.version.set(Value::Null);
    }

    /// The store's serialization id, when it has one.
    pub fn id(&self) -> Option<String> {
        self.inner.owner.as_ref().map(Owner::id)
    }
}

/// Create a store over a plain data tree. Returns the store and its
/// setter. For the function form, see [`create_projection`].
pub fn create_store(initial: Json) -> RenderResult<(Store, impl Fn(Box<dyn FnOnce(&mut Draft)>))> {
    let store = build_store(initial, true)?;
    let setter_store = store.clone();
    Ok((store, move |f: Box<dyn FnOnce(&mut Draft)>| {
        setter_store.set(f)
    }))
}

/// A store whose writes always notify (optimistic updates that must rerun
/// readers even when the tree is structurally unchanged).
pub fn create_optimistic_store(
    initial: Json,
) -> RenderResult<(Store, impl Fn(Box<dyn FnOnce(&mut Draft)>))> {
    create_store(initial)
}

fn build_store(initial: Json, serialize: bool) -> RenderResult<Store> {
    let owner = create_owner(None)?;
    let ctx = current_render_context();
    let hydrating = crate::hydrate::is_hydrating();

    let mut seed = initial;
    let mut continuation: Option<ValueStream> = None;
    if hydrating {
        crate::hydrate::mark_hydration_scope(&owner);
        match crate::hydrate::consume(&owner.id()) {
            Some(Value::Data(data)) => seed = data,
            Some(Value::Stream(stream)) => {
                if let Some(Value::Data(first)) = stream.try_first() {
                    seed = first;
                }
                continuation = Some(stream);
            }
            Some(Value::Promise(promise)) => {
                if let Some(Value::Data(data)) = promise.resolved_value() {
                    seed = data;
                }
            }
            _ => {}
        }
    }

    let store = Store {
        inner: Rc::new(StoreInner {
            owner: Some(owner),
            ctx,
            state: RefCell::new(seed),
            recorder: PatchRecorder::new(),
            version: create_signal_with(Value::Null, Equality::Never),
            serialize,
        }),
    };

    if store.inner.serialize {
        if let (Some(ctx), Some(owner)) = (&store.inner.ctx, &store.inner.owner) {
            ctx.serialize(&owner.id(), Value::Data(store.peek()), false);
        }
    }

    // Remaining projection yields arriving from the server are patch
    // batches; apply them as they stream in, re-flushing after each.
    if let Some(stream) = continuation {
        let weak = Rc::downgrade(&store.inner);
        stream.subscribe_from(1, move |event| {
            let Some(inner) = weak.upgrade() else { return };
            match event {
                StreamEvent::Item(Value::Patches(ops)) => {
                    apply_patches(&mut inner.state.borrow_mut(), &ops);
                    inner.version.set(Value::Null);
                    crate::task::flush_microtasks();
                }
                StreamEvent::Item(Value::Data(full)) => {
                    *inner.state.borrow_mut() = full;
                    inner.version.set(Value::Null);
                    crate::task::flush_microtasks();
                }
                StreamEvent::Item(_) | StreamEvent::Closed => {}
                StreamEvent::Failed(e) => {
                    tracing::warn!(error = %e, "store continuation stream failed");
                }
            }
        });
    }

    Ok(store)
}

// =============================================================================
// Projection
// =============================================================================

struct ProjectionInner {
    owner: Owner,
    ctx: Option<RenderContext>,
    state: RefCell<Json>,
    /// Deep clone taken at the first commit; what SSR reads observe.
    locked: RefCell<Option<Json>>,
    recorder: PatchRecorder,
    writer: StreamWriter,
    stream: ValueStream,
    first_committed: Cell<bool>,
    version: Signal,
}

/// A store whose value is produced over time by its driver. Behaves like
/// a memo whose value is a store: reads suspend until the first commit.
#[derive(Clone)]
pub struct Projection {
    inner: Rc<ProjectionInner>,
}

impl Projection {
    pub fn id(&self) -> String {
        self.inner.owner.id()
    }

    /// Read the projection state.
    ///
    /// On the server this is the first-commit snapshot (isolated from
    /// later mutations); before the first commit reads suspend. On the
    /// client it is the live tree.
    pub fn get(&self) -> RenderResult<Value> {
        self.inner.version.get();
        if self.inner.ctx.is_some() {
            if let Some(locked) = self.inner.locked.borrow().clone() {
                return Ok(Value::Data(locked));
            }
            return Err(RenderError::NotReady(self.inner.stream.first_promise()));
        }
        if !self.inner.first_committed.get() {
            return Err(RenderError::NotReady(self.inner.stream.first_promise()));
        }
        Ok(Value::Data(self.inner.state.borrow().clone()))
    }

    pub fn peek(&self) -> Json {
        self.inner.state.borrow().clone()
    }
}

/// Driver handle passed to the projection producer. Each `update` is one
/// generator step: mutate the draft, then the step commits.
#[derive(Clone)]
pub struct ProjectionDriver {
    inner: Rc<ProjectionInner>,
}

impl ProjectionDriver {
    /// Mutate the draft and commit one step. The first commit emits the
    /// full state snapshot; later commits emit their patch batch.
    pub fn update(&self, f: impl FnOnce(&mut Draft)) {
        {
            let mut state = self.inner.state.borrow_mut();
            let mut draft = self.inner.recorder.draft(&mut state);
            f(&mut draft);
        }
        self.commit();
    }

    fn commit(&self) {
        if !self.inner.first_committed.get() {
            self.inner.first_committed.set(true);
            let snapshot = self.inner.state.borrow().clone();
            // First-yield snapshot carries the whole state; its own
            // mutations are folded in, not emitted as patches.
            let _ = self.inner.recorder.take_batch();
            *self.inner.locked.borrow_mut() = Some(snapshot.clone());
            self.inner.writer.send(Value::Data(snapshot));
        } else {
            let batch = self.inner.recorder.take_batch();
            self.inner.writer.send(Value::Patches(Rc::new(batch)));
        }
        self.inner.version.set(Value::Null);
    }

    /// Finish the projection stream.
    pub fn finish(&self) {
        self.inner.writer.close();
    }

    /// Fail the projection stream.
    pub fn fail(&self, error: crate::types::SharedError) {
        self.inner.writer.fail(error);
    }
}

/// Create a projection. The producer receives the driver and commits
/// steps, synchronously or from async continuations.
pub fn create_projection(
    initial: Json,
    options: PrimitiveOptions,
    producer: impl FnOnce(ProjectionDriver),
) -> RenderResult<Projection> {
    let owner = create_owner(None)?;
    let ctx = current_render_context();
    let hydrating = crate::hydrate::is_hydrating();

    if hydrating {
        crate::hydrate::mark_hydration_scope(&owner);
        if let Some(entry) = crate::hydrate::consume(&owner.id()) {
            return Ok(hydrate_projection(owner, entry));
        }
    }

    let (stream, writer) = ValueStream::channel();
    let inner = Rc::new(ProjectionInner {
        owner,
        ctx,
        state: RefCell::new(initial),
        locked: RefCell::new(None),
        recorder: PatchRecorder::new(),
        writer,
        stream: stream.clone(),
        first_committed: Cell::new(false),
        version: create_signal_with(Value::Null, Equality::Never),
    });

    if !options.ssr_source.skips_serialization() {
        if let Some(ctx) = &inner.ctx {
            ctx.serialize(&inner.owner.id(), Value::Stream(stream), options.defer_stream);
        }
    }

    producer(ProjectionDriver {
        inner: inner.clone(),
    });
    Ok(Projection { inner })
}

/// Seed a hydrating projection from its serialized stream: first value is
/// the state snapshot, later values are patch batches.
fn hydrate_projection(owner: Owner, entry: Value) -> Projection {
    let (stream, writer) = ValueStream::channel();
    let inner = Rc::new(ProjectionInner {
        owner,
        ctx: None,
        state: RefCell::new(Json::Null),
        locked: RefCell::new(None),
        recorder: PatchRecorder::new(),
        writer,
        stream,
        first_committed: Cell::new(false),
        version: create_signal_with(Value::Null, Equality::Never),
    });

    match entry {
        Value::Stream(remote) => {
            if let Some(Value::Data(first)) = remote.try_first() {
                *inner.state.borrow_mut() = first;
                inner.first_committed.set(true);
            }
            let weak = Rc::downgrade(&inner);
            remote.subscribe_from(1, move |event| {
                let Some(inner) = weak.upgrade() else { return };
                match event {
                    StreamEvent::Item(Value::Patches(ops)) => {
                        apply_patches(&mut inner.state.borrow_mut(), &ops);
                        inner.version.set(Value::Null);
                        crate::task::flush_microtasks();
                    }
                    StreamEvent::Item(Value::Data(full)) => {
                        *inner.state.borrow_mut() = full;
                        inner.first_committed.set(true);
                        inner.version.set(Value::Null);
                        crate::task::flush_microtasks();
                    }
                    StreamEvent::Item(_) | StreamEvent::Closed => {}
                    StreamEvent::Failed(e) => {
                        tracing::warn!(error = %e, "projection stream failed during hydration");
                    }
                }
            });
        }
        Value::Data(data) => {
            *inner.state.borrow_mut() = data;
            inner.first_committed.set(true);
        }
        other => {
            tracing::warn!(?other, "unexpected serialized shape for projection");
        }
    }

    Projection { inner }
}

// =============================================================================
// Optimistic
// =============================================================================

/// A signal that serializes its value at its owner id so the client can
/// restore it without recomputation.
pub fn create_optimistic(initial: impl Into<Value>) -> RenderResult<Signal> {
    let owner = create_owner(None)?;
    let ctx = current_render_context();
    let hydrating = crate::hydrate::is_hydrating();

    let mut seed = initial.into();
    let mut continuation: Option<ValueStream> = None;
    if hydrating {
        crate::hydrate::mark_hydration_scope(&owner);
        match crate::hydrate::consume(&owner.id()) {
            Some(Value::Stream(stream)) => {
                if let Some(first) = stream.try_first() {
                    seed = first;
                }
                continuation = Some(stream);
            }
            Some(Value::Promise(promise)) => {
                if let Some(value) = promise.resolved_value() {
                    seed = value;
                }
            }
            Some(raw) => seed = raw,
            None => {}
        }
    }

    let signal = super::create_signal(seed);
    if let Some(ctx) = &ctx {
        ctx.serialize(&owner.id(), signal.peek(), false);
    }

    if let Some(stream) = continuation {
        let sink = signal.clone();
        stream.subscribe_from(1, move |event| {
            if let StreamEvent::Item(value) = event {
                sink.set(value);
                crate::task::flush_microtasks();
            }
        });
    }

    Ok(signal)
}

// =============================================================================
// Tests
// =============================================================================
