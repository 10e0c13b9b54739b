//! Error boundaries and the plain load-boundary fallback.
//!
//! An error boundary runs its body under an owner with the error context
//! set to its own handler. Caught errors render the fallback and are
//! additionally serialized at the boundary's owner id so the client can
//! restore the same fallback without re-running children. `reset` clears
//! the captured error; the next evaluation runs the real body again.

use std::cell::RefCell;
use std::rc::Rc;

use crate::engine::{create_context, create_owner, provide_context, run_with_owner, Context};
use crate::render::{current_render_context, View};
use crate::types::{RenderError, RenderResult, SharedError, Value};

/// Handler descendants can resolve through context to report errors to the
/// nearest boundary.
pub type ErrorHandler = Rc<dyn Fn(SharedError)>;

/// Clears a boundary's captured error; the next evaluation re-executes the
/// real body.
pub type ErrorReset = Rc<dyn Fn()>;

thread_local! {
    static ERROR_CONTEXT: Context<ErrorHandler> = create_context("ErrorContext");
}

/// The error context key used by boundaries and reporters.
pub(crate) fn error_context() -> Context<ErrorHandler> {
    ERROR_CONTEXT.with(Clone::clone)
}

/// Run `f` under an owner with the error context set to this boundary's
/// handler. Any caught error renders `fallback(err, reset)` instead of the
/// children; suspension (`NotReady`) passes through to the nearest Loading
/// boundary.
pub fn create_error_boundary(
    f: impl Fn() -> RenderResult<View> + 'static,
    fallback: impl Fn(SharedError, ErrorReset) -> View + 'static,
) -> RenderResult<View> {
    let owner = create_owner(None)?;
    let ctx = current_render_context();
    let caught: Rc<RefCell<Option<SharedError>>> = Rc::new(RefCell::new(None));

    // A serialized error at this boundary's id restores the fallback on
    // the client without re-running children (throw-once: reset clears it).
    if crate::hydrate::is_hydrating() {
        crate::hydrate::mark_hydration_scope(&owner);
        if let Some(Value::Error(e)) = crate::hydrate::consume(&owner.id()) {
            *caught.borrow_mut() = Some(e);
        }
    }

    let reset: ErrorReset = {
        let caught = caught.clone();
        let owner = owner.clone();
        Rc::new(move || {
            *caught.borrow_mut() = None;
            owner.dispose_children();
        })
    };

    let fallback = Rc::new(fallback);
    let f = Rc::new(f);
    Ok(View::dynamic(move || {
        if let Some(error) = caught.borrow().clone() {
            return Ok(fallback(error, reset.clone()));
        }

        let handler_slot = caught.clone();
        let handler: ErrorHandler = Rc::new(move |error| {
            *handler_slot.borrow_mut() = Some(error);
        });

        owner.dispose(true);
        let result = run_with_owner(&owner, || {
            provide_context(&error_context(), handler)?;
            f()
        });

        match result {
            Ok(view) => Ok(view),
            Err(RenderError::NotReady(promise)) => Err(RenderError::NotReady(promise)),
            Err(error) => {
                let shared = match error {
                    RenderError::User(e) => e,
                    other => SharedError::msg(other.to_string()),
                };
                *caught.borrow_mut() = Some(shared.clone());
                if let Some(ctx) = &ctx {
                    ctx.serialize(&owner.id(), Value::Error(shared.clone()), false);
                }
                tracing::debug!(id = %owner.id(), error = %shared, "error boundary caught");
                Ok(fallback(shared, reset.clone()))
            }
        }
    }))
}

/// Report an error to the nearest error boundary through context. Returns
/// false when no boundary is in scope.
pub fn report_error(error: SharedError) -> bool {
    match crate::engine::use_context(&error_context()) {
        Ok(handler) => {
            handler(error);
            true
        }
        Err(_) => false,
    }
}

/// Thin wrapper used when no hydration context is active: a suspended body
/// renders the fallback, anything else passes through.
pub fn create_load_boundary(
    f: impl Fn() -> RenderResult<View>,
    fallback: impl Fn() -> View,
) -> RenderResult<View> {
    match f() {
        Err(RenderError::NotReady(_)) => Ok(fallback()),
        other => other,
    }
}

/// True if invoking `f` suspends.
pub fn is_pending(f: impl Fn() -> RenderResult<Value>) -> bool {
    matches!(f(), Err(RenderError::NotReady(_)))
}

/// Invoke `f`, substituting `fallback` on suspension rather than
/// re-surfacing it.
pub fn is_pending_or(
    f: impl Fn() -> RenderResult<Value>,
    fallback: Value,
) -> RenderResult<Value> {
    match f() {
        Err(RenderError::NotReady(_)) => Ok(fallback),
        other => other,
    }
}

// =============================================================================
// Tests
// =============================================================================
