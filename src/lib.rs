//! # spark-ssr
//!
//! Reactive server-side rendering and hydration core.
//!
//! Built around fine-grained reactivity: components are plain function
//! calls that create signals, memos, and stores under a deterministic
//! owner tree. On the server, async results suspend their computations
//! and Loading boundaries capture the suspension - either resolving
//! out-of-order into streamable HTML fragments or deferring to the
//! client. A parallel side channel of serialized values, keyed by owner
//! id, lets the client reconstruct equivalent reactive state without
//! re-executing async work.
//!
//! ## Architecture
//!
//! ```text
//! components → owner tree → reactive primitives → resolve → {t, h, p}
//!                                   │                           │
//!                                   └── serialize ──┐     Loading boundary
//!                                                   │           │
//!                              side channel (id → value)   fragments/stream
//! ```
//!
//! Hydration runs the same component calls on the client: primitives
//! consume serialized values by id instead of recomputing, and a snapshot
//! scope keeps computations reading server-era signal values until the
//! walk completes.
//!
//! ## Modules
//!
//! - [`types`] - Core types (Value, PatchOp, RenderError, options)
//! - [`task`] - Cooperative microtask queue, promises, value streams
//! - [`engine`] - Owner tree, deterministic ids, cleanup, context
//! - [`render`] - Views, escaping, template resolution, render context
//! - [`reactive`] - Signals, memos, stores, projections, error boundaries
//! - [`boundary`] - Loading boundary (server)
//! - [`server`] - render_to_string / render_to_stream
//! - [`hydrate`] - Shared config, snapshot scope, Loading boundary (client)
//! - [`control`] - Show, Switch, For, Repeat, Loading, Errored, lazy

pub mod boundary;
pub mod control;
pub mod engine;
pub mod hydrate;
pub mod reactive;
pub mod render;
pub mod server;
pub mod task;
pub mod types;

// Re-export commonly used items
pub use types::{
    Equality, PatchKind, PatchOp, PathKey, PrimitiveOptions, RenderError, RenderResult,
    SharedError, SsrSource, Value, DEFERRED_FALLBACK,
};

pub use engine::{
    create_context, create_context_with_default, create_owner, create_root, current_owner,
    get_next_child_id, on_cleanup, peek_next_child_id, provide_context, run_with_owner,
    use_context, Context, Owner, OwnerState,
};

pub use task::{
    flush_microtasks, queue_microtask, with_resource_interceptor, Promise, PromiseResolver,
    Settlement, StreamEvent, StreamWriter, ValueStream,
};

pub use reactive::{
    apply_patch, apply_patches, create_effect, create_error_boundary, create_load_boundary,
    create_memo, create_optimistic, create_optimistic_store, create_projection,
    create_render_effect, create_signal, create_signal_from, create_signal_with, create_store,
    flush, is_pending, is_pending_or, Draft, ErrorReset, Memo, PatchRecorder, Projection,
    ProjectionDriver, Signal, Store,
};

pub use render::{
    element, escape, resolve, ssr, AssetKind, FragmentHandle, FragmentState, Hole,
    RenderContext, SsrTemplate, View,
};

pub use boundary::{create_loading_boundary, placeholder_pair};

pub use server::{render_to_string, render_to_string_with, render_to_stream, SsrStream};

pub use hydrate::{
    gather, has, init_hydration, is_done, is_hydrating, load, on_hydration_end,
    set_cleanup_fragment_hook, set_done, set_hydrating, set_module_loader,
};

pub use control::{
    errored, for_each, lazy, loading, map_array, match_arm, repeat, show, switch, Component,
    MatchArm,
};

/// Reset every piece of thread-local runtime state. Test isolation only;
/// a live render must never be reset out from under itself.
pub fn reset_runtime() {
    task::reset_tasks();
    engine::reset_owner_state();
    reactive::reset_reactive_state();
    hydrate::reset_shared_config();
    render::reset_render_context();
}
