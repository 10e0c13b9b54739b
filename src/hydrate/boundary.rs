//! Loading boundary, client side.
//!
//! During hydration a boundary matches the server fragment by its owner
//! id, waits for the fragment data and any per-boundary module assets,
//! then re-enters hydration locally: children rerun under the boundary
//! owner (consuming their serialized values), the boundary's snapshot
//! scope releases, and the pending counter drains toward hydration
//! completion.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::engine::{create_owner, run_with_owner};
use crate::reactive::{create_load_boundary, create_signal_with};
use crate::render::View;
use crate::task::{queue_microtask, Promise, Settlement};
use crate::types::{Equality, RenderResult, SharedError, Value};

use super::snapshot;

/// Hydrate a Loading boundary. Falls through to the plain load boundary
/// when no serialized record exists for this boundary's id.
pub fn hydrate_loading_boundary(
    children: Rc<dyn Fn() -> RenderResult<View>>,
    fallback: Rc<dyn Fn() -> View>,
) -> RenderResult<View> {
    let owner = create_owner(None)?;
    let id = owner.id();
    super::mark_hydration_scope(&owner);

    // Per-boundary module preloads from the <id>_assets entry.
    let mut asset_promises = Vec::new();
    if let Some(Value::Data(serde_json::Value::Object(map))) =
        super::load(&format!("{id}_assets"))
    {
        for url in map.values().filter_map(|v| v.as_str()) {
            asset_promises.push(super::load_module(url));
        }
    }

    let Some(entry) = super::load(&id) else {
        return create_load_boundary(move || children(), move || fallback());
    };
    super::gather(&id);

    // Deferred fallback: show it now; the client loads data itself.
    if matches!(entry, Value::DeferredFallback) {
        tracing::debug!(id = %id, "deferred fallback boundary");
        super::add_pending_boundary();
        queue_microtask(super::complete_boundary);
        return Ok(fallback());
    }

    let data_promise = match entry {
        Value::Promise(promise) => promise,
        Value::Stream(stream) => stream.first_promise(),
        ready => Promise::resolved(ready),
    };

    // Re-run latch for the boundary's children.
    let trigger = create_signal_with(Value::Null, Equality::Never);
    let resumed = Rc::new(Cell::new(false));
    let current: Rc<RefCell<Option<View>>> = Rc::new(RefCell::new(None));
    super::add_pending_boundary();

    // A boundary disposed before resumption cancels its orphaned
    // streaming fragment and stops holding hydration open.
    {
        let resumed = resumed.clone();
        let orphan_id = id.clone();
        owner.add_cleanup(move || {
            if !resumed.replace(true) {
                super::cleanup_fragment(&orphan_id);
                super::complete_boundary();
            }
        });
    }

    let complete: Rc<dyn Fn(Result<Value, SharedError>)> = {
        let owner = owner.clone();
        let trigger = trigger.clone();
        let resumed = resumed.clone();
        let current = current.clone();
        let children = children.clone();
        let id = id.clone();
        Rc::new(move |result| {
            if resumed.replace(true) {
                return;
            }
            if let Err(error) = result {
                tracing::warn!(id = %id, error = %error, "boundary data failed");
                super::complete_boundary();
                return;
            }

            tracing::debug!(id = %id, "boundary data ready; rehydrating children");
            super::begin_boundary_hydration();
            snapshot::mark_snapshot_scope(&owner);
            trigger.set(Value::Null);

            owner.dispose_children();
            match run_with_owner(&owner, || children()) {
                Ok(view) => *current.borrow_mut() = Some(view),
                Err(error) => {
                    tracing::warn!(id = %id, error = %error, "boundary children failed during hydration");
                }
            }

            crate::task::flush_microtasks();
            snapshot::release_snapshot_scope(&owner);
            crate::task::flush_microtasks();

            super::end_boundary_hydration();
            super::complete_boundary();
        })
    };

    // Settled data and assets hydrate immediately; otherwise wait on both.
    let assets_settled = asset_promises.iter().all(Promise::is_settled);
    match data_promise.settlement() {
        Settlement::Resolved(value) if assets_settled => complete(Ok(value)),
        Settlement::Rejected(error) => complete(Err(error)),
        _ => {
            let mut waits = vec![data_promise];
            waits.extend(asset_promises);
            let complete = complete.clone();
            Promise::all(waits).then(move |result| complete(result));
        }
    }

    Ok(View::dynamic(move || {
        trigger.get();
        match current.borrow().clone() {
            Some(view) => Ok(view),
            None => Ok(fallback()),
        }
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{create_root, reset_owner_state};
    use crate::hydrate::{init_hydration, is_done, set_hydrating};
    use crate::reactive::{create_memo, reset_reactive_state};
    use crate::render::resolve;
    use crate::task::{flush_microtasks, reset_tasks};
    use crate::types::PrimitiveOptions;

    fn reset_all() {
        reset_tasks();
        reset_owner_state();
        reset_reactive_state();
        crate::hydrate::reset_shared_config();
    }

    fn render(view: &View) -> String {
        resolve(view).unwrap().into_html().unwrap()
    }

    fn boundary_children() -> Rc<dyn Fn() -> RenderResult<View>> {
        Rc::new(|| {
            let memo = create_memo(
                |_| Ok(Value::str("should not run")),
                PrimitiveOptions::default(),
            )?;
            let value = memo.get()?;
            Ok(View::text(value.render_text()))
        })
    }

    #[test]
    fn test_settled_fragment_hydrates_immediately() {
        reset_all();

        // Child memo entry at t00 (first child of the boundary owner t0).
        init_hydration([
            ("t0".to_string(), Value::Promise(Promise::resolved(Value::Null))),
            ("t00".to_string(), Value::str("from server")),
        ]);

        let (view, _root) = create_root("t", || {
            hydrate_loading_boundary(boundary_children(), Rc::new(|| View::text("loading")))
                .unwrap()
        });
        set_hydrating(false);

        assert_eq!(render(&view), "from server");
        flush_microtasks();
        assert!(is_done());
    }

    #[test]
    fn test_pending_fragment_shows_fallback_then_resumes() {
        reset_all();

        let (data, resolver) = Promise::deferred();
        init_hydration([
            ("t0".to_string(), Value::Promise(data)),
            ("t00".to_string(), Value::str("late value")),
        ]);

        let (view, _root) = create_root("t", || {
            hydrate_loading_boundary(boundary_children(), Rc::new(|| View::text("loading")))
                .unwrap()
        });
        set_hydrating(false);
        flush_microtasks();

        assert_eq!(render(&view), "loading");
        assert!(!is_done(), "boundary still pending");

        resolver.resolve(Value::Null);
        flush_microtasks();

        assert_eq!(render(&view), "late value");
        assert!(is_done());
    }

    #[test]
    fn test_deferred_fallback_marker() {
        reset_all();

        init_hydration([("t0".to_string(), Value::DeferredFallback)]);
        let (view, _root) = create_root("t", || {
            hydrate_loading_boundary(
                Rc::new(|| Ok(View::text("children"))),
                Rc::new(|| View::text("fallback")),
            )
            .unwrap()
        });
        set_hydrating(false);

        assert_eq!(render(&view), "fallback");
        flush_microtasks();
        assert!(is_done(), "deferred fallback decrements via microtask");
    }

    #[test]
    fn test_no_record_falls_through() {
        reset_all();

        init_hydration([]);
        let (view, _root) = create_root("t", || {
            hydrate_loading_boundary(
                Rc::new(|| Ok(View::text("plain"))),
                Rc::new(|| View::text("loading")),
            )
            .unwrap()
        });
        set_hydrating(false);
        assert_eq!(render(&view), "plain");
    }

    #[test]
    fn test_orphaned_boundary_cancels_fragment() {
        reset_all();

        let cancelled: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = cancelled.clone();
        crate::hydrate::set_cleanup_fragment_hook(move |id| {
            sink.borrow_mut().push(id.to_string());
        });

        let (data, _resolver) = Promise::deferred();
        init_hydration([("t0".to_string(), Value::Promise(data))]);

        let (_view, root) = create_root("t", || {
            hydrate_loading_boundary(
                Rc::new(|| Ok(View::text("children"))),
                Rc::new(|| View::text("loading")),
            )
            .unwrap()
        });
        set_hydrating(false);

        // Dispose before the data resumes: the fragment is orphaned.
        root.dispose(false);
        assert_eq!(*cancelled.borrow(), vec!["t0".to_string()]);
    }

    #[test]
    fn test_assets_gate_resumption() {
        reset_all();

        let (asset, asset_resolver) = Promise::deferred();
        crate::hydrate::set_module_loader(move |_url| asset.clone());

        init_hydration([
            ("t0".to_string(), Value::Promise(Promise::resolved(Value::Null))),
            (
                "t0_assets".to_string(),
                Value::Data(serde_json::json!({"./widget.js": "/assets/widget.js"})),
            ),
            ("t00".to_string(), Value::str("widget html")),
        ]);

        let (view, _root) = create_root("t", || {
            hydrate_loading_boundary(boundary_children(), Rc::new(|| View::text("loading")))
                .unwrap()
        });
        set_hydrating(false);
        flush_microtasks();

        assert_eq!(render(&view), "loading", "assets still loading");

        asset_resolver.resolve(Value::Null);
        flush_microtasks();
        assert_eq!(render(&view), "widget html");
    }
}
