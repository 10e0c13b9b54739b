//! Patch recording and replay over data trees.
//!
//! The server records store/projection mutations as path-based patch
//! operations; the client replays them onto its hydrated snapshot. The
//! recording side is a draft cursor API over a [`serde_json::Value`] tree:
//! every mutating call performs the write and pushes the matching
//! [`PatchOp`], so replaying the emitted sequence on a structurally-equal
//! target yields the same final state as the original mutation sequence.
//!
//! Array semantics mirror index-shifting containers: `shift` records a
//! single delete at index 0, `unshift` one insert per item in index order,
//! and `splice` its deletes at the same absolute index (each delete shifts
//! the rest) followed by ascending inserts. `push`/`pop` record the
//! element write plus a `length` write; the applier interprets `length`
//! on arrays.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value as Json;

use crate::types::{PatchKind, PatchOp, PathKey};

// =============================================================================
// Recorder
// =============================================================================

/// Accumulates patch operations across draft mutations; batches are taken
/// per projection yield.
#[derive(Clone, Default)]
pub struct PatchRecorder {
    ops: Rc<RefCell<Vec<PatchOp>>>,
}

impl PatchRecorder {
    pub fn new() -> Self {
        PatchRecorder::default()
    }

    /// A root draft cursor over `root` recording into this batch.
    pub fn draft<'a>(&self, root: &'a mut Json) -> Draft<'a> {
        Draft {
            node: root,
            path: Vec::new(),
            ops: self.ops.clone(),
        }
    }

    /// Take the current batch, leaving the recorder empty.
    pub fn take_batch(&self) -> Vec<PatchOp> {
        std::mem::take(&mut *self.ops.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.borrow().is_empty()
    }
}

// =============================================================================
// Draft
// =============================================================================

/// Mutable cursor into a draft tree. Writes go through and are recorded.
pub struct Draft<'a> {
    node: &'a mut Json,
    path: Vec<PathKey>,
    ops: Rc<RefCell<Vec<PatchOp>>>,
}

impl<'a> Draft<'a> {
    fn child_path(&self, key: PathKey) -> Vec<PathKey> {
        let mut path = self.path.clone();
        path.push(key);
        path
    }

    fn record(&self, op: PatchOp) {
        self.ops.borrow_mut().push(op);
    }

    /// Descend into an object property, creating it as null if absent.
    pub fn at(&mut self, key: &str) -> Draft<'_> {
        let path = self.child_path(PathKey::key(key));
        if !self.node.is_object() {
            *self.node = Json::Object(serde_json::Map::new());
        }
        let map = self.node.as_object_mut().expect("coerced to object");
        let child = map.entry(key.to_string()).or_insert(Json::Null);
        Draft {
            node: child,
            path,
            ops: self.ops.clone(),
        }
    }

    /// Descend into an array element.
    pub fn index(&mut self, i: usize) -> Option<Draft<'_>> {
        let path = self.child_path(PathKey::Index(i));
        let ops = self.ops.clone();
        let child = self.node.as_array_mut()?.get_mut(i)?;
        Some(Draft {
            node: child,
            path,
            ops,
        })
    }

    /// Set an object property.
    pub fn set(&mut self, key: &str, value: Json) {
        self.record(PatchOp::set(self.child_path(PathKey::key(key)), value.clone()));
        if !self.node.is_object() {
            *self.node = Json::Object(serde_json::Map::new());
        }
        if let Some(map) = self.node.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    /// Delete an object property.
    pub fn delete(&mut self, key: &str) {
        self.record(PatchOp::delete(self.child_path(PathKey::key(key))));
        if let Some(map) = self.node.as_object_mut() {
            map.remove(key);
        }
    }

    /// Assign an array element in place.
    pub fn set_index(&mut self, i: usize, value: Json) {
        self.record(PatchOp::set(self.child_path(PathKey::Index(i)), value.clone()));
        let Some(arr) = self.node.as_array_mut() else {
            tracing::warn!("set_index on a non-array draft node; ignored");
            return;
        };
        if i >= arr.len() {
            arr.resize(i + 1, Json::Null);
        }
        arr[i] = value;
    }

    /// Append: records the element write and the new `length`.
    pub fn push(&mut self, value: Json) {
        let Some(arr) = self.node.as_array_mut() else {
            tracing::warn!("push on a non-array draft node; ignored");
            return;
        };
        let i = arr.len();
        arr.push(value.clone());
        let len = arr.len();
        self.record(PatchOp::set(self.child_path(PathKey::Index(i)), value));
        self.record(PatchOp::set(
            self.child_path(PathKey::key("length")),
            Json::from(len),
        ));
    }

    /// Remove the last element: records the element delete and the new
    /// `length`.
    pub fn pop(&mut self) -> Option<Json> {
        let arr = self.node.as_array_mut()?;
        let value = arr.pop()?;
        let len = arr.len();
        self.record(PatchOp::delete(self.child_path(PathKey::Index(len))));
        self.record(PatchOp::set(
            self.child_path(PathKey::key("length")),
            Json::from(len),
        ));
        Some(value)
    }

    /// Remove the first element: a single delete at index 0.
    pub fn shift(&mut self) -> Option<Json> {
        let arr = self.node.as_array_mut()?;
        if arr.is_empty() {
            return None;
        }
        let value = arr.remove(0);
        self.record(PatchOp::delete(self.child_path(PathKey::Index(0))));
        Some(value)
    }

    /// Prepend items: one insert per item, in index order.
    pub fn unshift(&mut self, items: Vec<Json>) {
        if self.node.as_array_mut().is_none() {
            tracing::warn!("unshift on a non-array draft node; ignored");
            return;
        }
        for (i, item) in items.into_iter().enumerate() {
            self.record(PatchOp::insert(
                self.child_path(PathKey::Index(i)),
                item.clone(),
            ));
            if let Some(arr) = self.node.as_array_mut() {
                arr.insert(i, item);
            }
        }
    }

    /// Remove `delete_count` elements at `start`, then insert `items`
    /// there. Deletes all target the same absolute index (each shifts the
    /// rest); inserts target ascending indices.
    pub fn splice(&mut self, start: usize, delete_count: usize, items: Vec<Json>) {
        let Some(arr) = self.node.as_array_mut() else {
            tracing::warn!("splice on a non-array draft node; ignored");
            return;
        };
        let start = start.min(arr.len());
        let delete_count = delete_count.min(arr.len() - start);
        for _ in 0..delete_count {
            arr.remove(start);
        }
        for _ in 0..delete_count {
            self.record(PatchOp::delete(self.child_path(PathKey::Index(start))));
        }
        for (k, item) in items.into_iter().enumerate() {
            self.record(PatchOp::insert(
                self.child_path(PathKey::Index(start + k)),
                item.clone(),
            ));
            if let Some(arr) = self.node.as_array_mut() {
                arr.insert((start + k).min(arr.len()), item);
            }
        }
    }

    /// Insert a single element at an index.
    pub fn insert(&mut self, i: usize, value: Json) {
        let Some(arr) = self.node.as_array_mut() else {
            tracing::warn!("insert on a non-array draft node; ignored");
            return;
        };
        let i = i.min(arr.len());
        arr.insert(i, value.clone());
        self.record(PatchOp::insert(self.child_path(PathKey::Index(i)), value));
    }

    /// The current value under the cursor.
    pub fn value(&self) -> &Json {
        self.node
    }
}

// =============================================================================
// Applier
// =============================================================================

/// Apply one batch left-to-right.
pub fn apply_patches(target: &mut Json, batch: &[PatchOp]) {
    for op in batch {
        apply_patch(target, op);
    }
}

/// Apply a single patch: delete (`[path]`), set (`[path, value]`), or
/// array insert (`[path, value, 1]`). A `length` set on an array resizes
/// it. Unreachable paths are skipped with a warning.
pub fn apply_patch(target: &mut Json, op: &PatchOp) {
    let Some((last, parents)) = op.path.split_last() else {
        if let PatchKind::Set(v) = &op.kind {
            *target = v.clone();
        }
        return;
    };

    let mut node = target;
    for key in parents {
        let next = match key {
            PathKey::Key(k) => node.as_object_mut().and_then(|map| map.get_mut(k)),
            PathKey::Index(i) => node.as_array_mut().and_then(|arr| arr.get_mut(*i)),
        };
        match next {
            Some(child) => node = child,
            None => {
                tracing::warn!(path = ?op.path, "patch path unreachable; skipped");
                return;
            }
        }
    }

    match (&op.kind, last) {
        (PatchKind::Delete, PathKey::Key(k)) => {
            if let Some(map) = node.as_object_mut() {
                map.remove(k);
            }
        }
        (PatchKind::Delete, PathKey::Index(i)) => {
            if let Some(arr) = node.as_array_mut() {
                if *i < arr.len() {
                    arr.remove(*i);
                }
            }
        }
        (PatchKind::Set(v), PathKey::Key(k)) => {
            if k == "length" {
                if let Some(arr) = node.as_array_mut() {
                    let len = v.as_u64().unwrap_or(arr.len() as u64) as usize;
                    arr.resize(len, Json::Null);
                    return;
                }
            }
            if !node.is_object() {
                *node = Json::Object(serde_json::Map::new());
            }
            if let Some(map) = node.as_object_mut() {
                map.insert(k.clone(), v.clone());
            }
        }
        (PatchKind::Set(v), PathKey::Index(i)) => {
            if let Some(arr) = node.as_array_mut() {
                if *i >= arr.len() {
                    arr.resize(i + 1, Json::Null);
                }
                arr[*i] = v.clone();
            }
        }
        (PatchKind::Insert(v), PathKey::Index(i)) => {
            if let Some(arr) = node.as_array_mut() {
                arr.insert((*i).min(arr.len()), v.clone());
            }
        }
        (PatchKind::Insert(v), PathKey::Key(k)) => {
            // Tolerated: an insert addressed at a property behaves as a set.
            if let Some(map) = node.as_object_mut() {
                map.insert(k.clone(), v.clone());
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Mutate through a draft, then verify replaying the batches on the
    /// starting state reproduces the final state.
    fn check_replay(
        initial: Json,
        mutate: impl FnOnce(&PatchRecorder, &mut Json) -> Vec<Vec<PatchOp>>,
    ) {
        let recorder = PatchRecorder::new();
        let mut state = initial.clone();
        let batches = mutate(&recorder, &mut state);

        let mut replayed = initial;
        for batch in &batches {
            apply_patches(&mut replayed, batch);
        }
        assert_eq!(replayed, state, "replay must reproduce the final state");
    }

    #[test]
    fn test_set_and_delete() {
        check_replay(json!({"name": "", "tmp": 1}), |rec, state| {
            let mut draft = rec.draft(state);
            draft.set("name", json!("Alice"));
            draft.delete("tmp");
            vec![rec.take_batch()]
        });
    }

    #[test]
    fn test_push_records_element_and_length() {
        let recorder = PatchRecorder::new();
        let mut state = json!({"items": [1]});
        recorder.draft(&mut state).at("items").push(json!(2));

        let batch = recorder.take_batch();
        assert_eq!(
            batch,
            vec![
                PatchOp::set(vec![PathKey::key("items"), PathKey::Index(1)], json!(2)),
                PatchOp::set(
                    vec![PathKey::key("items"), PathKey::key("length")],
                    json!(2)
                ),
            ]
        );
        assert_eq!(state, json!({"items": [1, 2]}));
    }

    #[test]
    fn test_shift_is_single_delete_at_zero() {
        let recorder = PatchRecorder::new();
        let mut state = json!({"items": ["a", "b", "c"]});
        let shifted = recorder.draft(&mut state).at("items").shift();

        assert_eq!(shifted, Some(json!("a")));
        assert_eq!(
            recorder.take_batch(),
            vec![PatchOp::delete(vec![
                PathKey::key("items"),
                PathKey::Index(0)
            ])]
        );
        assert_eq!(state, json!({"items": ["b", "c"]}));
    }

    #[test]
    fn test_unshift_inserts_in_index_order() {
        let recorder = PatchRecorder::new();
        let mut state = json!(["z"]);
        recorder.draft(&mut state).unshift(vec![json!("x"), json!("y")]);

        assert_eq!(
            recorder.take_batch(),
            vec![
                PatchOp::insert(vec![PathKey::Index(0)], json!("x")),
                PatchOp::insert(vec![PathKey::Index(1)], json!("y")),
            ]
        );
        assert_eq!(state, json!(["x", "y", "z"]));
    }

    #[test]
    fn test_splice_deletes_same_index_then_ascending_inserts() {
        let recorder = PatchRecorder::new();
        let mut state = json!([0, 1, 2, 3]);
        recorder
            .draft(&mut state)
            .splice(1, 2, vec![json!("a"), json!("b")]);

        assert_eq!(
            recorder.take_batch(),
            vec![
                PatchOp::delete(vec![PathKey::Index(1)]),
                PatchOp::delete(vec![PathKey::Index(1)]),
                PatchOp::insert(vec![PathKey::Index(1)], json!("a")),
                PatchOp::insert(vec![PathKey::Index(2)], json!("b")),
            ]
        );
        assert_eq!(state, json!([0, "a", "b", 3]));
    }

    #[test]
    fn test_splice_replay() {
        check_replay(json!({"list": [10, 20, 30, 40]}), |rec, state| {
            let mut batches = Vec::new();
            rec.draft(state).at("list").splice(1, 1, vec![json!(99)]);
            batches.push(rec.take_batch());
            rec.draft(state).at("list").splice(0, 2, vec![]);
            batches.push(rec.take_batch());
            batches
        });
    }

    #[test]
    fn test_pop_replay() {
        check_replay(json!({"items": [1, 2, 3]}), |rec, state| {
            let mut draft = rec.draft(state);
            let mut items = draft.at("items");
            items.pop();
            items.pop();
            vec![rec.take_batch()]
        });
    }

    #[test]
    fn test_nested_path_set() {
        check_replay(json!({"user": {"profile": {"age": 1}}}), |rec, state| {
            rec.draft(state).at("user").at("profile").set("age", json!(30));
            vec![rec.take_batch()]
        });
    }

    #[test]
    fn test_apply_skips_unreachable_path() {
        let mut state = json!({"a": 1});
        apply_patch(
            &mut state,
            &PatchOp::set(vec![PathKey::key("missing"), PathKey::key("x")], json!(1)),
        );
        assert_eq!(state, json!({"a": 1}));
    }

    #[test]
    fn test_length_set_resizes() {
        let mut state = json!([1, 2, 3]);
        apply_patch(
            &mut state,
            &PatchOp::set(vec![PathKey::key("length")], json!(2)),
        );
        assert_eq!(state, json!([1, 2]));
    }
}
