//! Control flow - conditional, list, and async component helpers.
//!
//! Components are plain functions returning a [`View`]; these helpers
//! build the dynamic parts: conditional rendering, keyed list mapping,
//! switch/match chains, error and loading boundary component forms, and
//! lazy module components that gate rendering on module load.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::{create_owner, current_owner, run_with_owner, Owner};
use crate::reactive::{create_error_boundary, ErrorReset};
use crate::render::{current_render_context, View};
use crate::task::Promise;
use crate::types::{RenderError, RenderResult, SharedError, Value};

/// A component: a callable producing a view, possibly suspending.
pub type Component = Rc<dyn Fn() -> RenderResult<View>>;

// =============================================================================
// Conditionals
// =============================================================================

/// Render `children` when the condition holds, else the fallback (or
/// nothing).
pub fn show(
    when: impl Fn() -> RenderResult<bool> + 'static,
    children: impl Fn() -> RenderResult<View> + 'static,
    fallback: Option<Component>,
) -> View {
    View::dynamic(move || {
        if when()? {
            children()
        } else {
            match &fallback {
                Some(f) => f(),
                None => Ok(View::empty()),
            }
        }
    })
}

/// One arm of a [`switch`].
pub struct MatchArm {
    when: Rc<dyn Fn() -> RenderResult<bool>>,
    children: Component,
}

/// Build a switch arm.
pub fn match_arm(
    when: impl Fn() -> RenderResult<bool> + 'static,
    children: impl Fn() -> RenderResult<View> + 'static,
) -> MatchArm {
    MatchArm {
        when: Rc::new(when),
        children: Rc::new(children),
    }
}

/// Render the first arm whose condition holds, else the fallback.
pub fn switch(arms: Vec<MatchArm>, fallback: Option<Component>) -> View {
    View::dynamic(move || {
        for arm in &arms {
            if (arm.when)()? {
                return (arm.children)();
            }
        }
        match &fallback {
            Some(f) => f(),
            None => Ok(View::empty()),
        }
    })
}

// =============================================================================
// Lists
// =============================================================================

struct MapSlot {
    item: Value,
    view: View,
    owner: Owner,
}

/// Map a reactive list to views, caching per index: unchanged items keep
/// their view and owner scope, changed items rebuild under a fresh scope,
/// removed tails dispose.
pub fn map_array(
    source: impl Fn() -> RenderResult<Vec<Value>> + 'static,
    map_fn: impl Fn(&Value, usize) -> RenderResult<View> + 'static,
) -> View {
    let slots: Rc<RefCell<Vec<MapSlot>>> = Rc::new(RefCell::new(Vec::new()));
    let parent = current_owner();

    View::dynamic(move || {
        let items = source()?;

        // Dispose removed tails first.
        {
            let mut slots = slots.borrow_mut();
            while slots.len() > items.len() {
                if let Some(slot) = slots.pop() {
                    slot.owner.dispose(false);
                }
            }
        }

        let mut children = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let cached = {
                let slots = slots.borrow();
                slots
                    .get(i)
                    .filter(|slot| &slot.item == item)
                    .map(|slot| slot.view.clone())
            };
            if let Some(view) = cached {
                children.push(view);
                continue;
            }

            // Rebuild this slot under a fresh scope.
            let build = |owner: &Owner| run_with_owner(owner, || map_fn(item, i));
            let owner = match &parent {
                Some(parent) => run_with_owner(parent, || create_owner(None))?,
                None => create_owner(None)?,
            };
            let view = build(&owner)?;
            {
                let mut slots = slots.borrow_mut();
                if let Some(slot) = slots.get_mut(i) {
                    slot.owner.dispose(false);
                    *slot = MapSlot {
                        item: item.clone(),
                        view: view.clone(),
                        owner,
                    };
                } else {
                    slots.push(MapSlot {
                        item: item.clone(),
                        view: view.clone(),
                        owner,
                    });
                }
            }
            children.push(view);
        }
        Ok(View::List(children))
    })
}

/// `For`: list mapping with the source as a plain data array.
pub fn for_each(
    source: impl Fn() -> RenderResult<Vec<Value>> + 'static,
    map_fn: impl Fn(&Value, usize) -> RenderResult<View> + 'static,
) -> View {
    map_array(source, map_fn)
}

/// `Repeat`: render `f(0..count())`.
pub fn repeat(
    count: impl Fn() -> RenderResult<usize> + 'static,
    f: impl Fn(usize) -> RenderResult<View> + 'static,
) -> View {
    View::dynamic(move || {
        let n = count()?;
        let mut children = Vec::with_capacity(n);
        for i in 0..n {
            children.push(f(i)?);
        }
        Ok(View::List(children))
    })
}

// =============================================================================
// Boundary Components
// =============================================================================

/// `Loading`: boundary component form.
pub fn loading(
    children: impl Fn() -> RenderResult<View> + 'static,
    fallback: impl Fn() -> View + 'static,
) -> RenderResult<View> {
    crate::boundary::create_loading_boundary(Rc::new(children), Rc::new(fallback))
}

/// `Errored`: error boundary component form.
pub fn errored(
    children: impl Fn() -> RenderResult<View> + 'static,
    fallback: impl Fn(SharedError, ErrorReset) -> View + 'static,
) -> RenderResult<View> {
    create_error_boundary(children, fallback)
}

// =============================================================================
// Lazy Components
// =============================================================================

/// A lazily loaded component: rendering suspends until the module load
/// promise settles. The module is registered for per-boundary asset
/// preloading; in sync rendering the load gates the root instead.
pub fn lazy(
    specifier: impl Into<String>,
    url: impl Into<String>,
    load: impl Fn() -> Promise + 'static,
    component: Component,
) -> Component {
    let specifier = specifier.into();
    let url = url.into();
    let registered = Rc::new(std::cell::Cell::new(false));

    Rc::new(move || {
        let ctx = current_render_context();
        if let Some(ctx) = &ctx {
            if !registered.replace(true) {
                ctx.register_module(specifier.clone(), url.clone());
            }
        }

        let promise = load();
        if promise.is_settled() {
            return component();
        }
        if let Some(ctx) = &ctx {
            if !ctx.is_async() {
                // Root-level gating for sync rendering only.
                ctx.block(promise.clone());
            }
        }
        Err(RenderError::NotReady(promise))
    })
}

// =============================================================================
// Tests
// =============================================================================
