//! End-to-end hydration scenarios: server renders feed their side
//! channel into a fresh client runtime, which reconstructs equivalent
//! reactive state without re-executing async work.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::json;
use spark_ssr::{
    create_error_boundary, create_memo, create_projection, create_signal, flush_microtasks,
    init_hydration, is_done, loading, render_to_stream, reset_runtime, set_hydrating,
    PrimitiveOptions, Promise, SharedError, SsrSource, Value, View,
};

fn render(view: &View) -> String {
    spark_ssr::resolve(view).unwrap().into_html().unwrap()
}

/// Projection full-then-patch round trip: the client seeds from the
/// first-value snapshot and replays patch batches to the server's final
/// state.
#[test]
fn test_projection_full_then_patch_round_trip() {
    reset_runtime();

    // Server: three commits - snapshot, set batch, push batch.
    let stream = render_to_stream(|| {
        let projection = create_projection(
            json!({"name": "", "items": []}),
            PrimitiveOptions::default(),
            |driver| {
                driver.update(|d| d.set("name", json!("Alice")));
                driver.update(|d| d.set("items", json!([1])));
                driver.update(|d| d.at("items").push(json!(2)));
                driver.finish();
            },
        )?;
        let value = projection.get()?;
        Ok(View::text(value.render_text()))
    })
    .unwrap();
    flush_microtasks();
    let entries = stream.entries();
    assert!(matches!(entries.get("t0"), Some(Value::Stream(_))));

    // Client: same component shape, hydrated from the side channel.
    reset_runtime();
    init_hydration(entries);
    let ((), root) = spark_ssr::create_root("t", || {});
    let projection = spark_ssr::run_with_owner(&root, || {
        create_projection(json!({"name": "", "items": []}), PrimitiveOptions::default(), |_| {})
            .unwrap()
    });
    set_hydrating(false);

    // Seeded with V1 immediately; batches replay as the queue drains.
    assert_eq!(projection.peek(), json!({"name": "Alice", "items": []}));
    flush_microtasks();
    assert_eq!(projection.peek(), json!({"name": "Alice", "items": [1, 2]}));
}

/// Client error boundary restores the serialized fallback, and reset
/// re-executes the real body.
#[test]
fn test_client_error_boundary_with_serialized_error() {
    reset_runtime();

    init_hydration([(
        "t0".to_string(),
        Value::Error(SharedError::msg("server error")),
    )]);

    let resets: Rc<RefCell<Vec<spark_ssr::reactive::ErrorReset>>> =
        Rc::new(RefCell::new(Vec::new()));
    let resets2 = resets.clone();
    let (view, _root) = spark_ssr::create_root("t", || {
        create_error_boundary(
            || Ok(View::text("fresh run")),
            move |e, reset| {
                resets2.borrow_mut().push(reset);
                View::text(format!("fallback: {e}"))
            },
        )
        .unwrap()
    });

    assert_eq!(render(&view), "fallback: server error");

    let reset = resets.borrow().last().cloned().unwrap();
    reset();
    set_hydrating(false);
    assert_eq!(render(&view), "fresh run");
}

/// Snapshot scope blocks writes from reaching scoped computations until
/// hydration ends; afterwards live values flow.
#[test]
fn test_snapshot_scope_blocks_writes_during_hydration() {
    reset_runtime();

    let x = create_signal(10i64);
    init_hydration([]);

    let x_for_derived = x.clone();
    let ((client_memo, derived), _root) = spark_ssr::create_root("t", || {
        // The hydrated primitive installs the top-level snapshot scope.
        let client_memo = create_memo(
            |_| Ok(Value::Int(999)),
            PrimitiveOptions {
                ssr_source: SsrSource::Client,
                initial: Some(Value::Int(7)),
                ..Default::default()
            },
        )
        .unwrap();
        let derived = create_memo(
            move |_| {
                Ok(Value::Int(
                    x_for_derived.get().as_int().unwrap_or(0) * 2,
                ))
            },
            PrimitiveOptions::default(),
        )
        .unwrap();
        (client_memo, derived)
    });

    assert_eq!(client_memo.get().unwrap(), Value::Int(7));
    assert_eq!(derived.get().unwrap(), Value::Int(20));

    // A live write during hydration: the real value moves, scoped
    // computations keep their first-read snapshot.
    x.set(100i64);
    assert_eq!(x.peek(), Value::Int(100));
    assert_eq!(derived.get().unwrap(), Value::Int(20));

    // Scope release: reads flip to live values and the stubbed memo runs
    // its real compute.
    set_hydrating(false);
    spark_ssr::flush();
    assert_eq!(derived.get().unwrap(), Value::Int(200));
    assert_eq!(client_memo.get().unwrap(), Value::Int(999));
}

/// Serialization round trip: the value the server observed is the value
/// the client first observes, without re-running the async work.
#[test]
fn test_streamed_boundary_round_trip() {
    reset_runtime();

    // Server: boundary with one async memo.
    let (promise, resolver) = Promise::deferred();
    let stream = render_to_stream(move || {
        let promise = promise.clone();
        loading(
            move || {
                let promise = promise.clone();
                let memo = create_memo(
                    move |_| Ok(Value::Promise(promise.clone())),
                    PrimitiveOptions::default(),
                )?;
                Ok(View::dynamic(move || {
                    Ok(View::text(memo.get()?.render_text()))
                }))
            },
            || View::text("loading..."),
        )
    })
    .unwrap();

    resolver.resolve(Value::str("server data"));
    flush_microtasks();
    let fragments = stream.take_fragments();
    assert_eq!(fragments[0].1.as_ref().unwrap(), "server data");

    let mut entries = stream.entries();
    // Fragment arrival is the transport's job: it parks a settled marker
    // at the boundary id when the fragment lands.
    entries.insert(
        "t0".to_string(),
        Value::Promise(Promise::resolved(Value::Null)),
    );

    // Client: same tree; the memo must observe the server value without
    // its compute ever running.
    reset_runtime();
    init_hydration(entries);

    let recomputed = Rc::new(std::cell::Cell::new(false));
    let recomputed2 = recomputed.clone();
    let (view, _root) = spark_ssr::create_root("t", || {
        loading(
            move || {
                let recomputed = recomputed2.clone();
                let memo = create_memo(
                    move |_| {
                        recomputed.set(true);
                        Ok(Value::str("client recompute"))
                    },
                    PrimitiveOptions::default(),
                )?;
                Ok(View::dynamic(move || {
                    Ok(View::text(memo.get()?.render_text()))
                }))
            },
            || View::text("loading..."),
        )
        .unwrap()
    });
    set_hydrating(false);
    flush_microtasks();

    assert_eq!(render(&view), "server data");
    assert!(!recomputed.get(), "async work must not re-execute on the client");
    assert!(is_done());
}

/// Sync-mode deferred fallback round trip: the boundary id carries the
/// `$$f` sentinel and the client shows the fallback.
#[test]
fn test_deferred_fallback_round_trip() {
    reset_runtime();

    let (promise, _resolver) = Promise::deferred();
    let ctx = spark_ssr::RenderContext::new("t", false, false);
    let (html, ctx) = spark_ssr::render_to_string_with(ctx, move || {
        let promise = promise.clone();
        loading(
            move || {
                let promise = promise.clone();
                let memo = create_memo(
                    move |_| Ok(Value::Promise(promise.clone())),
                    PrimitiveOptions::default(),
                )?;
                Ok(View::dynamic(move || {
                    Ok(View::text(memo.get()?.render_text()))
                }))
            },
            || View::text("loading..."),
        )
    })
    .unwrap();

    assert_eq!(html, "loading...");
    let entries = ctx.entries();
    assert_eq!(entries.get("t0"), Some(&Value::DeferredFallback));

    // Client: the deferred fallback renders and hydration still completes.
    reset_runtime();
    init_hydration(entries);
    let (view, _root) = spark_ssr::create_root("t", || {
        loading(
            || Ok(View::text("client children")),
            || View::text("loading..."),
        )
        .unwrap()
    });
    set_hydrating(false);

    assert_eq!(render(&view), "loading...");
    flush_microtasks();
    assert!(is_done());
}

/// Hydration-end callbacks drain only after every pending boundary
/// resumed.
#[test]
fn test_hydration_end_waits_for_boundaries() {
    reset_runtime();

    let (data, resolver) = Promise::deferred();
    init_hydration([("t0".to_string(), Value::Promise(data))]);

    let ended = Rc::new(std::cell::Cell::new(false));
    let ended2 = ended.clone();
    spark_ssr::on_hydration_end(move || ended2.set(true));

    let (_view, _root) = spark_ssr::create_root("t", || {
        loading(|| Ok(View::text("children")), || View::text("loading..."))
            .unwrap()
    });
    set_hydrating(false);
    flush_microtasks();
    assert!(!ended.get(), "boundary still pending");

    resolver.resolve(Value::Null);
    flush_microtasks();
    assert!(ended.get());
    assert!(is_done());
}

/// A hydrating memo whose serialized entry is an async iterable consumes
/// the first value synchronously and schedules the rest.
#[test]
fn test_hydrating_memo_consumes_stream_entry() {
    reset_runtime();

    let (stream, writer) = spark_ssr::ValueStream::channel();
    writer.send(Value::Int(1));

    init_hydration([("t0".to_string(), Value::Stream(stream))]);
    let (memo, _root) = spark_ssr::create_root("t", || {
        create_memo(
            |_| Ok(Value::str("must not run")),
            PrimitiveOptions::default(),
        )
        .unwrap()
    });
    set_hydrating(false);

    assert_eq!(memo.get().unwrap(), Value::Int(1));

    writer.send(Value::Int(2));
    flush_microtasks();
    assert_eq!(memo.get().unwrap(), Value::Int(2), "later yields keep flowing");
}
