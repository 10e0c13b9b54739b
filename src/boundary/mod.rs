//! Loading boundary, server side.
//!
//! A boundary captures suspension under it. If the children resolve
//! synchronously, their HTML returns inline. Otherwise, in streaming mode
//! the boundary registers a fragment, returns its fallback wrapped in the
//! placeholder pair, and drives a resolution machine: re-run the children
//! while the component body itself suspends, then re-interpolate holes
//! each time their promises settle, until the template is hole-free (or
//! an error settles the fragment). In sync mode a suspended boundary
//! serializes the `"$$f"` sentinel and returns the fallback.
//!
//! Serializations are buffered per attempt so only the last successful
//! attempt's writes commit; child ids reset on every retry, which keeps
//! the id sequence identical across attempts.

use std::cell::Cell;
use std::rc::Rc;

use crate::engine::{create_owner, run_with_owner, Owner};
use crate::reactive::create_load_boundary;
use crate::render::{
    current_render_context, resolve, ssr, with_render_context, FragmentHandle, RenderContext,
    SsrTemplate, View,
};
use crate::types::{RenderError, RenderResult, SharedError, Value};

// =============================================================================
// Placeholders
// =============================================================================

/// The in-HTML slot markers for a streamed fragment.
pub fn placeholder_pair(id: &str) -> (String, String) {
    (
        format!("<template id=\"pl-{id}\"></template>"),
        format!("<!--pl-{id}-->"),
    )
}

fn placeholder_view(id: &str, fallback: View) -> View {
    let (open, close) = placeholder_pair(id);
    View::List(vec![View::Raw(open), fallback, View::Raw(close)])
}

// =============================================================================
// Boundary Entry
// =============================================================================

/// Create a Loading boundary around `children`.
///
/// Dispatch: hydrating clients resume from the serialized fragment; server
/// renders run the capture/resolve machine below; without any render
/// context this is the plain load-boundary fallback.
pub fn create_loading_boundary(
    children: Rc<dyn Fn() -> RenderResult<View>>,
    fallback: Rc<dyn Fn() -> View>,
) -> RenderResult<View> {
    if crate::hydrate::is_hydrating() {
        return crate::hydrate::hydrate_loading_boundary(children, fallback);
    }
    let Some(ctx) = current_render_context() else {
        return create_load_boundary(move || children(), move || fallback());
    };

    let owner = create_owner(None)?;
    let id = owner.id();
    tracing::debug!(id = %id, streaming = ctx.is_async(), "loading boundary");

    ctx.push_serialize_buffer();
    let previous_boundary = ctx.set_current_boundary_id(Some(id.clone()));
    let attempt = run_attempt(&owner, &children);
    ctx.set_current_boundary_id(previous_boundary);

    match attempt {
        Attempt::Template(tpl) if !tpl.has_holes() => {
            // Sync success: only this attempt's serializations commit.
            ctx.pop_serialize_buffer(true);
            emit_assets(&ctx, &id);
            let html = tpl.into_html().unwrap_or_default();
            Ok(View::Raw(html))
        }
        Attempt::Template(tpl) => {
            if ctx.is_async() {
                // Holes captured: flush, register the fragment, and let the
                // machine resolve out-of-order.
                ctx.pop_serialize_buffer(true);
                emit_assets(&ctx, &id);
                let machine = BoundaryMachine::new(&ctx, &owner, &children, &id, false);
                machine.resolve_holes(tpl);
                Ok(placeholder_view(&id, fallback()))
            } else {
                ctx.pop_serialize_buffer(true);
                emit_assets(&ctx, &id);
                ctx.serialize(&id, Value::DeferredFallback, false);
                Ok(fallback())
            }
        }
        Attempt::Suspended(promise) => {
            if ctx.is_async() {
                // Component-body throw path: the attempt's buffer stays
                // open; each retry discards it and starts fresh.
                let machine = BoundaryMachine::new(&ctx, &owner, &children, &id, true);
                machine.await_body(promise);
                Ok(placeholder_view(&id, fallback()))
            } else {
                ctx.pop_serialize_buffer(false);
                emit_assets(&ctx, &id);
                ctx.serialize(&id, Value::DeferredFallback, false);
                Ok(fallback())
            }
        }
        Attempt::Failed(error) => {
            ctx.pop_serialize_buffer(false);
            Err(error)
        }
    }
}

/// Emit the `<id>_assets` entry when modules were attributed to this
/// boundary during execution.
fn emit_assets(ctx: &RenderContext, id: &str) {
    let modules = ctx.get_boundary_modules(id);
    if modules.is_empty() {
        return;
    }
    let map: serde_json::Map<String, serde_json::Value> = modules
        .into_iter()
        .map(|(specifier, url)| (specifier, serde_json::Value::String(url)))
        .collect();
    ctx.serialize(
        &format!("{id}_assets"),
        Value::Data(serde_json::Value::Object(map)),
        false,
    );
}

// =============================================================================
// Attempts
// =============================================================================

enum Attempt {
    /// Children produced a template (possibly with holes).
    Template(SsrTemplate),
    /// The component body itself suspended before returning a view.
    Suspended(crate::task::Promise),
    Failed(RenderError),
}

fn run_attempt(owner: &Owner, children: &Rc<dyn Fn() -> RenderResult<View>>) -> Attempt {
    let view = match run_with_owner(owner, || children()) {
        Ok(view) => view,
        Err(RenderError::NotReady(promise)) => return Attempt::Suspended(promise),
        Err(error) => return Attempt::Failed(error),
    };
    match run_with_owner(owner, || resolve(&view)) {
        Ok(tpl) => Attempt::Template(tpl),
        Err(RenderError::NotReady(promise)) => Attempt::Suspended(promise),
        Err(error) => Attempt::Failed(error),
    }
}

// =============================================================================
// Resolution Machine
// =============================================================================

/// Drives a streaming boundary to settlement.
struct BoundaryMachine {
    ctx: RenderContext,
    owner: Owner,
    children: Rc<dyn Fn() -> RenderResult<View>>,
    id: String,
    fragment: FragmentHandle,
    /// True while an attempt buffer is still pushed on the context.
    buffer_open: Cell<bool>,
}

impl BoundaryMachine {
    fn new(
        ctx: &RenderContext,
        owner: &Owner,
        children: &Rc<dyn Fn() -> RenderResult<View>>,
        id: &str,
        buffer_open: bool,
    ) -> Rc<BoundaryMachine> {
        Rc::new(BoundaryMachine {
            ctx: ctx.clone(),
            owner: owner.clone(),
            children: children.clone(),
            id: id.to_string(),
            fragment: ctx.register_fragment(id),
            buffer_open: Cell::new(buffer_open),
        })
    }

    /// Wait out a component-body suspension, then retry the whole body.
    fn await_body(self: &Rc<Self>, promise: crate::task::Promise) {
        let machine = self.clone();
        let ctx = self.ctx.clone();
        promise.then(move |_| {
            with_render_context(Some(ctx), || machine.retry_body());
        });
    }

    /// Re-run the children from scratch: previous attempt's serializations
    /// are discarded, child owners disposed so ids regenerate identically.
    fn retry_body(self: &Rc<Self>) {
        tracing::trace!(id = %self.id, "boundary body retry");
        self.ctx.pop_serialize_buffer(false);
        self.ctx.push_serialize_buffer();
        self.buffer_open.set(true);
        self.owner.dispose_children();

        let previous = self.ctx.set_current_boundary_id(Some(self.id.clone()));
        let attempt = run_attempt(&self.owner, &self.children);
        self.ctx.set_current_boundary_id(previous);

        match attempt {
            Attempt::Suspended(promise) => self.await_body(promise),
            Attempt::Failed(error) => self.fail(error),
            Attempt::Template(tpl) => {
                self.ctx.pop_serialize_buffer(true);
                self.buffer_open.set(false);
                emit_assets(&self.ctx, &self.id);
                self.resolve_holes(tpl);
            }
        }
    }

    /// Await all pending hole promises, then re-interpolate. Terminates
    /// because every pass strictly shrinks the pending set or the
    /// unresolved dependencies behind it.
    fn resolve_holes(self: &Rc<Self>, tpl: SsrTemplate) {
        if tpl.p.is_empty() {
            let html = tpl.into_html().unwrap_or_default();
            self.fragment.done(Ok(html));
            return;
        }

        tracing::trace!(id = %self.id, pending = tpl.p.len(), "awaiting hole promises");
        let machine = self.clone();
        let ctx = self.ctx.clone();
        let pending = tpl.p.clone();
        crate::task::Promise::all(pending).then(move |result| {
            with_render_context(Some(ctx), || match result {
                Err(error) => machine.fail(RenderError::User(error)),
                Ok(_) => {
                    let previous = machine
                        .ctx
                        .set_current_boundary_id(Some(machine.id.clone()));
                    let next = run_with_owner(&machine.owner, || ssr(&tpl.t, &tpl.h));
                    machine.ctx.set_current_boundary_id(previous);
                    match next {
                        Ok(next_tpl) => machine.resolve_holes(next_tpl),
                        Err(error) => machine.fail(error),
                    }
                }
            });
        });
    }

    fn fail(self: &Rc<Self>, error: RenderError) {
        if self.buffer_open.replace(false) {
            self.ctx.pop_serialize_buffer(false);
        }
        let shared = match error {
            RenderError::User(e) => e,
            other => SharedError::msg(other.to_string()),
        };
        self.fragment.done(Err(shared));
    }
}

// =============================================================================
// Tests
// =============================================================================
