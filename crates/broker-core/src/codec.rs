//! RFC 6902 patch construction and application, restricted to the subset the
//! broker actually emits: `add`, `remove`, `replace`. Object pools derive
//! patches with `json_patch::diff`; list pools build them by hand from the
//! exact index arithmetic of the insert/replace/evict transition (see
//! `pool.rs`), since that's cheaper and more precise than re-diffing two
//! whole arrays. Both paths emit into the same wire `PatchOp`, so callers
//! never see the `json-patch` crate's own operation type.

use broker_protocol::{Envelope, Object};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
}

pub type Patch = Vec<PatchOp>;

/// Errors raised while folding an envelope into a previously cached view.
#[derive(Debug, thiserror::Error)]
pub enum PatchCacheError {
    #[error("invalid patch payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Apply(#[from] PatchError),
}

/// Fold one wire envelope into `cache`. A snapshot replaces the cache
/// outright; `data: []` is a legal no-op patch that leaves the cache
/// unchanged; any other patch array is applied op-by-op.
pub fn patch_cache(envelope: &Envelope, cache: &Value) -> Result<Value, PatchCacheError> {
    if envelope.snapshot {
        return Ok(envelope.data.clone());
    }
    if matches!(&envelope.data, Value::Array(ops) if ops.is_empty()) {
        return Ok(cache.clone());
    }
    let patch: Patch = serde_json::from_value(envelope.data.clone())?;
    let mut doc = cache.clone();
    apply_patch(&mut doc, &patch)?;
    Ok(doc)
}

/// `patch_cache` plus decoding the post-state as a single `Object`.
pub fn patch_object(envelope: &Envelope, cache: &Value) -> Result<(Value, Object), PatchCacheError> {
    let new_cache = patch_cache(envelope, cache)?;
    let object: Object = serde_json::from_value(new_cache.clone())?;
    Ok((new_cache, object))
}

/// `patch_cache` plus decoding the post-state as a list of `Object`.
pub fn patch_list(envelope: &Envelope, cache: &Value) -> Result<(Value, Vec<Object>), PatchCacheError> {
    let new_cache = patch_cache(envelope, cache)?;
    let objects: Vec<Object> = serde_json::from_value(new_cache.clone())?;
    Ok((new_cache, objects))
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error(transparent)]
    Apply(#[from] json_patch::PatchError),
    #[error("diff produced a '{0}' op, which the wire format has no room for")]
    UnsupportedOp(&'static str),
}

/// Structural diff of two JSON objects via `json_patch::diff`, recursing
/// into nested objects and treating arrays and scalars as atomic (replaced
/// wholesale on change). Produces an empty patch when `old == new`.
pub fn diff_object(old: &Value, new: &Value) -> Patch {
    json_patch::diff(old, new)
        .0
        .iter()
        .map(|op| {
            from_crate_op(op).unwrap_or_else(|kind| {
                unreachable!("json_patch::diff never emits a '{kind}' op")
            })
        })
        .collect()
}

fn from_crate_op(op: &json_patch::PatchOperation) -> Result<PatchOp, &'static str> {
    use json_patch::PatchOperation as Op;
    match op {
        Op::Add(add) => Ok(PatchOp::Add {
            path: add.path.to_string(),
            value: add.value.clone(),
        }),
        Op::Remove(rem) => Ok(PatchOp::Remove {
            path: rem.path.to_string(),
        }),
        Op::Replace(rep) => Ok(PatchOp::Replace {
            path: rep.path.to_string(),
            value: rep.value.clone(),
        }),
        Op::Move(_) => Err("move"),
        Op::Copy(_) => Err("copy"),
        Op::Test(_) => Err("test"),
    }
}

fn to_crate_op(op: &PatchOp) -> Result<json_patch::PatchOperation, PatchError> {
    use json_patch::{AddOperation, PatchOperation as Op, RemoveOperation, ReplaceOperation};
    let path = |p: &str| {
        p.parse()
            .map_err(|_| PatchError::UnsupportedOp("malformed path"))
    };
    Ok(match op {
        PatchOp::Add { path: p, value } => Op::Add(AddOperation {
            path: path(p)?,
            value: value.clone(),
        }),
        PatchOp::Remove { path: p } => Op::Remove(RemoveOperation { path: path(p)? }),
        PatchOp::Replace { path: p, value } => Op::Replace(ReplaceOperation {
            path: path(p)?,
            value: value.clone(),
        }),
    })
}

/// Apply `patch` to `doc` in place, in order. Used by test doubles and by
/// clients that want to maintain a cache outside the wire format's own
/// decoder.
pub fn apply_patch(doc: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let ops = patch
        .iter()
        .map(to_crate_op)
        .collect::<Result<Vec<_>, _>>()?;
    json_patch::patch(doc, &json_patch::Patch(ops))?;
    Ok(())
}

/// Build a single `add` op at array index `pos`.
pub fn add_at(pos: usize, value: Value) -> PatchOp {
    PatchOp::Add {
        path: format!("/{pos}"),
        value,
    }
}

/// Build a single `remove` op at array index `pos`.
pub fn remove_at(pos: usize) -> PatchOp {
    PatchOp::Remove {
        path: format!("/{pos}"),
    }
}

/// Build a single `replace` op at array index `pos`.
pub fn replace_at(pos: usize, value: Value) -> PatchOp {
    PatchOp::Replace {
        path: format!("/{pos}"),
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diff_object_is_empty_for_identical_values() {
        let v = json!({"a": 1, "b": {"c": 2}});
        assert!(diff_object(&v, &v).is_empty());
    }

    #[test]
    fn diff_object_emits_add_for_new_key() {
        let old = json!({"a": 1});
        let new = json!({"a": 1, "b": 2});
        let patch = diff_object(&old, &new);
        assert_eq!(patch, vec![PatchOp::Add { path: "/b".into(), value: json!(2) }]);
    }

    #[test]
    fn diff_object_emits_remove_for_dropped_key() {
        let old = json!({"a": 1, "b": 2});
        let new = json!({"a": 1});
        let patch = diff_object(&old, &new);
        assert_eq!(patch, vec![PatchOp::Remove { path: "/b".into() }]);
    }

    #[test]
    fn diff_object_recurses_into_nested_objects() {
        let old = json!({"data": {"theme": "dark", "size": 1}});
        let new = json!({"data": {"theme": "light", "size": 1}});
        let patch = diff_object(&old, &new);
        assert_eq!(
            patch,
            vec![PatchOp::Replace { path: "/data/theme".into(), value: json!("light") }]
        );
    }

    #[test]
    fn diff_object_escapes_tilde_and_slash_in_keys() {
        let old = json!({});
        let new = json!({"a/b~c": 1});
        let patch = diff_object(&old, &new);
        assert_eq!(
            patch,
            vec![PatchOp::Add { path: "/a~1b~0c".into(), value: json!(1) }]
        );
    }

    #[test]
    fn apply_patch_round_trips_diff_object() {
        let old = json!({"a": 1, "b": {"c": 2}});
        let new = json!({"a": 1, "b": {"c": 3}, "d": 4});
        let patch = diff_object(&old, &new);
        let mut doc = old.clone();
        apply_patch(&mut doc, &patch).unwrap();
        assert_eq!(doc, new);
    }

    #[test]
    fn apply_patch_add_remove_replace_on_arrays() {
        let mut doc = json!([{"n": "a"}, {"n": "b"}, {"n": "c"}]);
        let patch = vec![remove_at(2), add_at(0, json!({"n": "d"}))];
        apply_patch(&mut doc, &patch).unwrap();
        assert_eq!(doc, json!([{"n": "d"}, {"n": "a"}, {"n": "b"}]));
    }

    #[test]
    fn apply_patch_replace_at_index() {
        let mut doc = json!(["a", "b", "c"]);
        apply_patch(&mut doc, &vec![replace_at(1, json!("z"))]).unwrap();
        assert_eq!(doc, json!(["a", "z", "c"]));
    }

    #[test]
    fn apply_patch_rejects_out_of_range_remove() {
        let mut doc = json!(["a"]);
        assert!(apply_patch(&mut doc, &vec![remove_at(5)]).is_err());
    }

    #[test]
    fn patch_cache_replaces_outright_on_snapshot() {
        let cache = json!({"old": true});
        let env = Envelope::new(true, 1, json!({"new": true}));
        let result = patch_cache(&env, &cache).unwrap();
        assert_eq!(result, json!({"new": true}));
    }

    #[test]
    fn patch_cache_leaves_cache_unchanged_on_empty_array_patch() {
        let cache = json!({"a": 1});
        let env = Envelope::new(false, 2, json!([]));
        let result = patch_cache(&env, &cache).unwrap();
        assert_eq!(result, cache);
    }

    #[test]
    fn patch_cache_applies_a_real_patch_array() {
        let cache = json!(["a", "b"]);
        let env = Envelope::new(false, 2, serde_json::to_value(vec![add_at(2, json!("c"))]).unwrap());
        let result = patch_cache(&env, &cache).unwrap();
        assert_eq!(result, json!(["a", "b", "c"]));
    }

    #[test]
    fn patch_object_decodes_the_post_state() {
        let cache = Object::empty().encode();
        let populated = Object {
            created: 5,
            updated: 5,
            index: "x".into(),
            path: "items/x".into(),
            data: json!({"v": 1}),
        };
        let env = Envelope::new(true, 5, populated.encode());
        let (_, decoded) = patch_object(&env, &cache).unwrap();
        assert_eq!(decoded, populated);
    }
}
