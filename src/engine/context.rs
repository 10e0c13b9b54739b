//! Context - keyed values resolved through the owner chain.
//!
//! A context is a typed key plus an optional default. Providing stores the
//! value on the current owner; using walks the owner chain upward. This is
//! how error boundaries expose their handler to descendants without
//! threading it through every call.

use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::engine::current_owner;
use crate::types::{RenderError, RenderResult};

thread_local! {
    static NEXT_CONTEXT_ID: Cell<u64> = const { Cell::new(0) };
}

/// A typed context key.
pub struct Context<T: 'static> {
    id: u64,
    name: &'static str,
    default: Option<Rc<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Clone for Context<T> {
    fn clone(&self) -> Self {
        Context {
            id: self.id,
            name: self.name,
            default: self.default.clone(),
            _marker: PhantomData,
        }
    }
}

/// Create a context with no default; `use_context` outside a provider is a
/// `ContextNotFound` error.
pub fn create_context<T: 'static>(name: &'static str) -> Context<T> {
    Context {
        id: next_id(),
        name,
        default: None,
        _marker: PhantomData,
    }
}

/// Create a context with a default value.
pub fn create_context_with_default<T: 'static>(name: &'static str, default: T) -> Context<T> {
    Context {
        id: next_id(),
        name,
        default: Some(Rc::new(default)),
        _marker: PhantomData,
    }
}

fn next_id() -> u64 {
    NEXT_CONTEXT_ID.with(|n| {
        let id = n.get();
        n.set(id + 1);
        id
    })
}

/// Store `value` for `context` on the current owner.
pub fn provide_context<T: 'static>(context: &Context<T>, value: T) -> RenderResult<()> {
    let owner = current_owner().ok_or(RenderError::NoOwner)?;
    owner.set_context_value(context.id, Rc::new(value) as Rc<dyn Any>);
    Ok(())
}

/// Resolve `context` through the owner chain, falling back to its default.
pub fn use_context<T: 'static>(context: &Context<T>) -> RenderResult<Rc<T>> {
    if let Some(owner) = current_owner() {
        if let Some(value) = owner.lookup_context_value(context.id) {
            if let Ok(typed) = value.downcast::<T>() {
                return Ok(typed);
            }
        }
    }
    context
        .default
        .clone()
        .ok_or(RenderError::ContextNotFound(context.name))
}

// =============================================================================
// Tests
// =============================================================================
