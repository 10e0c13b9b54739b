//! Server render entry points.
//!
//! A render request creates a root owner and installs a render context.
//! Components run as plain calls; each primitive allocates an id under
//! the current owner. Sync rendering drains root-level gating (lazy
//! modules) and returns the finished HTML; streaming rendering returns
//! the shell immediately and exposes settled fragments and side-channel
//! writes for a transport to format into chunks.

use crate::engine::{create_root, run_with_owner, Owner};
use crate::render::{
    resolve, ssr, with_render_context, RenderContext, SerializedWrite, View,
};
use crate::task::{flush_microtasks, Promise};
use crate::types::{RenderError, RenderResult, SharedError, Value};

/// Conventional root owner id prefix.
const ROOT_ID: &str = "t";

// =============================================================================
// Sync Rendering
// =============================================================================

/// Render synchronously to a finished HTML string.
///
/// Loading boundaries that suspend serialize the deferred-fallback
/// sentinel and render their fallback. Root-level gating registered via
/// `block` (lazy module loading) is drained here; async work that cannot
/// settle within the drain is an error.
pub fn render_to_string(f: impl FnOnce() -> RenderResult<View>) -> RenderResult<String> {
    let ctx = RenderContext::new(ROOT_ID, false, false);
    render_to_string_with(ctx, f).map(|(html, _)| html)
}

/// Sync render returning the context too (side-channel inspection).
pub fn render_to_string_with(
    ctx: RenderContext,
    f: impl FnOnce() -> RenderResult<View>,
) -> RenderResult<(String, RenderContext)> {
    let (result, root) = with_render_context(Some(ctx.clone()), || create_root(ctx.root_id(), f));
    let view = result?;
    let mut tpl = with_render_context(Some(ctx.clone()), || {
        run_with_owner(&root, || resolve(&view))
    })?;

    let mut gates: Vec<Promise> = Vec::new();
    let mut passes = 0usize;
    loop {
        flush_microtasks();
        gates.extend(ctx.take_blocked());
        gates.retain(|gate| !gate.is_settled());

        if tpl.has_holes() {
            if tpl.p.iter().any(Promise::is_settled) {
                passes += 1;
                if passes > 256 {
                    return Err(RenderError::user(
                        "render_to_string: template failed to settle",
                    ));
                }
                tpl = with_render_context(Some(ctx.clone()), || {
                    run_with_owner(&root, || ssr(&tpl.t, &tpl.h))
                })?;
                continue;
            }
            return Err(RenderError::user(
                "render_to_string: suspended outside a Loading boundary",
            ));
        }
        if gates.is_empty() {
            tracing::debug!(root = %root.id(), "sync render complete");
            return Ok((tpl.t.concat(), ctx));
        }
        if crate::task::pending_microtasks() == 0 {
            return Err(RenderError::user(
                "render_to_string: unresolved async work in sync render",
            ));
        }
    }
}

// =============================================================================
// Streaming Rendering
// =============================================================================

/// Handle over an in-flight streaming render. The transport polls it
/// (after driving the event loop) for settled fragments and side-channel
/// writes; the core produces structured chunks, never bytes.
pub struct SsrStream {
    shell: String,
    ctx: RenderContext,
    #[allow(dead_code)]
    root: Owner,
}

impl SsrStream {
    /// The shell HTML: everything outside suspended boundaries, with
    /// placeholder pairs marking the streamed slots.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Fragments settled since the last call, in settle order.
    pub fn take_fragments(&self) -> Vec<(String, Result<String, SharedError>)> {
        self.ctx.take_settled_fragments()
    }

    /// Side-channel writes committed since the last call.
    pub fn take_serialized(&self) -> Vec<SerializedWrite> {
        self.ctx.take_serialized_writes()
    }

    /// All committed side-channel entries keyed by owner id.
    pub fn entries(&self) -> std::collections::BTreeMap<String, Value> {
        self.ctx.entries()
    }

    /// Boundaries still streaming.
    pub fn pending_fragments(&self) -> usize {
        self.ctx.pending_fragments()
    }

    /// True once every registered fragment has settled.
    pub fn is_complete(&self) -> bool {
        self.pending_fragments() == 0
    }

    /// The underlying render context.
    pub fn context(&self) -> &RenderContext {
        &self.ctx
    }
}

/// Render in streaming mode: the shell returns immediately with
/// placeholder markers; suspended boundaries resolve out-of-order and
/// settle their fragments as the event loop drains.
///
/// Suspension outside any Loading boundary is surfaced to the transport
/// as an error (the response must be aborted).
pub fn render_to_stream(f: impl FnOnce() -> RenderResult<View>) -> RenderResult<SsrStream> {
    let ctx = RenderContext::new(ROOT_ID, true, false);
    let (result, root) = with_render_context(Some(ctx.clone()), || create_root(ROOT_ID, f));
    let view = result?;
    let tpl = with_render_context(Some(ctx.clone()), || {
        run_with_owner(&root, || resolve(&view))
    })?;

    if tpl.has_holes() {
        return Err(RenderError::user(
            "render_to_stream: suspended outside a Loading boundary at the root",
        ));
    }

    let shell = tpl.t.concat();
    tracing::debug!(
        root = %root.id(),
        pending = ctx.pending_fragments(),
        "streaming shell produced"
    );
    Ok(SsrStream { shell, ctx, root })
}

// =============================================================================
// Tests
// =============================================================================
