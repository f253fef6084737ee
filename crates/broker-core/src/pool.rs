//! The per-pool materialised view and the pure cache-transition function.
//! Transition is deliberately free of I/O and locking so it can be unit
//! tested against the scenarios in isolation from connections and the
//! trie; `broadcast.rs` wraps it with the pool mutex and fan-out.

use std::sync::Arc;

use broker_protocol::Object;
use serde_json::Value;

use crate::codec::{add_at, diff_object, remove_at, replace_at, Patch};
use crate::event::Operation;

/// A write-side object filter. Errors suppress the object (§4.4.2: treated
/// as an empty single object, or dropped from a list).
pub struct FilterError;

pub type FilterObjectFn = dyn Fn(&str, &Object) -> Result<Object, FilterError> + Send + Sync;
pub type FilterListFn = dyn Fn(&str, Vec<Object>) -> Vec<Object> + Send + Sync;

/// Pass every object through unchanged; used for pools with no configured
/// filter.
pub fn identity_object_filter() -> Arc<FilterObjectFn> {
    Arc::new(|_key: &str, obj: &Object| Ok(obj.clone()))
}

/// Apply no list-level transformation (no cap, no reordering).
pub fn identity_list_filter() -> Arc<FilterListFn> {
    Arc::new(|_key: &str, objs: Vec<Object>| objs)
}

/// The materialised view a pool publishes: a single object for a literal
/// key, or an ordered list for a glob key.
pub enum Cache {
    Object {
        version: i64,
        object: Option<Object>,
    },
    List {
        version: i64,
        objects: Vec<Object>,
    },
}

impl Cache {
    pub fn new_object() -> Self {
        Cache::Object {
            version: 0,
            object: None,
        }
    }

    pub fn new_list() -> Self {
        Cache::List {
            version: 0,
            objects: Vec::new(),
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            Cache::Object { version, .. } => *version,
            Cache::List { version, .. } => *version,
        }
    }

    pub(crate) fn set_version(&mut self, v: i64) {
        match self {
            Cache::Object { version, .. } => *version = v,
            Cache::List { version, .. } => *version = v,
        }
    }

    /// The current view, encoded for a fresh subscriber's snapshot.
    pub fn encode(&self) -> Value {
        match self {
            Cache::Object { object, .. } => object
                .as_ref()
                .map(Object::encode)
                .unwrap_or_else(|| Object::empty().encode()),
            Cache::List { objects, .. } => broker_protocol::object::encode_list(objects),
        }
    }
}

/// What a successful transition produced, ready to be stamped with a fresh
/// version and serialised into the wire envelope.
pub enum BroadcastData {
    Snapshot(Value),
    Patch(Patch),
}

/// Run one storage mutation through a pool's cache, mutating it in place.
/// Returns `None` when the mutation has no observable effect on this pool
/// (nothing should be broadcast, no version bump).
#[allow(clippy::too_many_arguments)]
pub fn transition(
    cache: &mut Cache,
    pool_key: &str,
    op: Operation,
    obj: Option<&Object>,
    filter_object: &FilterObjectFn,
    filter_list: &FilterListFn,
    no_patch: bool,
) -> Option<BroadcastData> {
    match cache {
        Cache::Object { object, .. } => {
            transition_object(object, pool_key, op, obj, filter_object, no_patch)
        }
        Cache::List { objects, .. } => {
            transition_list(objects, pool_key, op, obj, filter_object, filter_list)
        }
    }
}

fn transition_object(
    slot: &mut Option<Object>,
    pool_key: &str,
    op: Operation,
    obj: Option<&Object>,
    filter_object: &FilterObjectFn,
    no_patch: bool,
) -> Option<BroadcastData> {
    let filtered = match op {
        Operation::Set => {
            let obj = obj?;
            match filter_object(pool_key, obj) {
                Ok(f) => f,
                Err(FilterError) => Object::empty(),
            }
        }
        Operation::Del => Object::empty(),
    };

    let old = slot.clone();
    *slot = Some(filtered.clone());

    let force_snapshot = no_patch
        || match old.as_ref() {
            None => true,
            Some(o) => o.created == 0,
        };
    if force_snapshot {
        return Some(BroadcastData::Snapshot(filtered.encode()));
    }

    let old_encoded = old.expect("checked above").encode();
    let new_encoded = filtered.encode();
    let patch = diff_object(&old_encoded, &new_encoded);
    Some(BroadcastData::Patch(patch))
}

fn transition_list(
    objects: &mut Vec<Object>,
    pool_key: &str,
    op: Operation,
    obj: Option<&Object>,
    filter_object: &FilterObjectFn,
    filter_list: &FilterListFn,
) -> Option<BroadcastData> {
    match (op, obj) {
        (Operation::Del, None) => {
            objects.clear();
            Some(BroadcastData::Snapshot(Value::Array(Vec::new())))
        }
        (Operation::Set, None) => None,
        (Operation::Del, Some(target)) => {
            remove_existing(objects, pool_key, &target.path, filter_list)
        }
        (Operation::Set, Some(raw)) => match filter_object(pool_key, raw) {
            Err(FilterError) => remove_existing(objects, pool_key, &raw.path, filter_list),
            Ok(filtered) => {
                if let Some(existing_idx) = objects.iter().position(|o| o.path == filtered.path) {
                    let mut working = objects.clone();
                    working[existing_idx] = filtered.clone();
                    let final_list = filter_list(pool_key, working);
                    let actual_pos = final_list.iter().position(|o| o.path == filtered.path);
                    *objects = final_list;
                    actual_pos.map(|pos| {
                        BroadcastData::Patch(vec![replace_at(pos, filtered.encode())])
                    })
                } else {
                    let before_len = objects.len();
                    let old_len = before_len.saturating_sub(1);
                    let mut working = objects.clone();
                    let insert_pos = working.partition_point(|o| o.created <= filtered.created);
                    working.insert(insert_pos, filtered.clone());
                    let before_filter_len = working.len();
                    let final_list = filter_list(pool_key, working);
                    let pushed_out = before_filter_len > final_list.len();
                    let actual_pos = final_list.iter().position(|o| o.path == filtered.path);
                    let final_len = final_list.len();
                    *objects = final_list;
                    match (actual_pos, pushed_out) {
                        (Some(pos), true) => Some(BroadcastData::Patch(vec![
                            remove_at(old_len),
                            add_at(pos, filtered.encode()),
                        ])),
                        (Some(pos), false) => {
                            Some(BroadcastData::Patch(vec![add_at(pos, filtered.encode())]))
                        }
                        (None, true) => Some(BroadcastData::Patch(vec![remove_at(final_len)])),
                        (None, false) => None,
                    }
                }
            }
        },
    }
}

fn remove_existing(
    objects: &mut Vec<Object>,
    pool_key: &str,
    path: &str,
    filter_list: &FilterListFn,
) -> Option<BroadcastData> {
    let idx = objects.iter().position(|o| o.path == path)?;
    let mut working = objects.clone();
    working.remove(idx);
    *objects = filter_list(pool_key, working);
    Some(BroadcastData::Patch(vec![remove_at(idx)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(path: &str, created: i64, data: Value) -> Object {
        Object {
            created,
            updated: created,
            index: broker_protocol::path::last_index(path).to_owned(),
            path: path.to_owned(),
            data,
        }
    }

    #[test]
    fn list_insert_into_empty_cache() {
        let mut cache = Cache::new_list();
        let identity_obj = identity_object_filter();
        let identity_list = identity_list_filter();
        let Cache::List { objects, .. } = &mut cache else {
            unreachable!()
        };
        let event = obj("devices/abc", 100, json!({"name": "x"}));
        let result = transition_list(
            objects,
            "devices/*",
            Operation::Set,
            Some(&event),
            identity_obj.as_ref(),
            identity_list.as_ref(),
        );
        match result {
            Some(BroadcastData::Patch(patch)) => {
                assert_eq!(patch, vec![add_at(0, event.encode())]);
            }
            _ => panic!("expected a patch"),
        }
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn list_replace_existing_entry() {
        let identity_obj = identity_object_filter();
        let identity_list = identity_list_filter();
        let mut objects = vec![
            obj("items/a", 1, json!({"v": 1})),
            obj("items/b", 2, json!({"v": 2})),
        ];
        let updated_b = obj("items/b", 2, json!({"v": 3}));
        let result = transition_list(
            &mut objects,
            "items/*",
            Operation::Set,
            Some(&updated_b),
            identity_obj.as_ref(),
            identity_list.as_ref(),
        );
        match result {
            Some(BroadcastData::Patch(patch)) => {
                assert_eq!(patch, vec![replace_at(1, updated_b.encode())]);
            }
            _ => panic!("expected a patch"),
        }
    }

    #[test]
    fn list_limit_push_out_evicts_oldest_and_adds_newest() {
        let identity_obj = identity_object_filter();
        // keep only the 3 newest, newest-first
        let capped_filter: Arc<FilterListFn> = Arc::new(|_key: &str, mut objs: Vec<Object>| {
            objs.sort_by_key(|o| std::cmp::Reverse(o.created));
            objs.truncate(3);
            objs
        });
        let mut objects = vec![
            obj("items/c", 3, json!({})),
            obj("items/b", 2, json!({})),
            obj("items/a", 1, json!({})),
        ];
        let d = obj("items/d", 4, json!({}));
        let result = transition_list(
            &mut objects,
            "items/*",
            Operation::Set,
            Some(&d),
            identity_obj.as_ref(),
            capped_filter.as_ref(),
        );
        match result {
            Some(BroadcastData::Patch(patch)) => {
                assert_eq!(patch, vec![remove_at(2), add_at(0, d.encode())]);
            }
            _ => panic!("expected a two-op patch"),
        }
        assert_eq!(objects.len(), 3);
        assert!(!objects.iter().any(|o| o.path == "items/a"));
    }

    #[test]
    fn single_object_first_set_emits_a_snapshot() {
        let mut slot: Option<Object> = None;
        let identity_obj = identity_object_filter();
        let config = obj("config", 1, json!({"theme": "dark"}));
        let result = transition_object(
            &mut slot,
            "config",
            Operation::Set,
            Some(&config),
            identity_obj.as_ref(),
            false,
        );
        assert!(matches!(result, Some(BroadcastData::Snapshot(_))));
    }

    #[test]
    fn single_object_second_set_emits_a_structural_patch() {
        let mut slot = Some(obj("config", 1, json!({"theme": "dark"})));
        let identity_obj = identity_object_filter();
        let config2 = obj("config", 1, json!({"theme": "light"}));
        let result = transition_object(
            &mut slot,
            "config",
            Operation::Set,
            Some(&config2),
            identity_obj.as_ref(),
            false,
        );
        match result {
            Some(BroadcastData::Patch(patch)) => {
                assert_eq!(
                    patch,
                    vec![crate::codec::PatchOp::Replace {
                        path: "/data/theme".into(),
                        value: json!("light"),
                    }]
                );
            }
            _ => panic!("expected a patch"),
        }
    }

    #[test]
    fn single_object_delete_resets_to_empty_object() {
        let mut slot = Some(obj("config", 1, json!({"theme": "dark"})));
        let identity_obj = identity_object_filter();
        let result = transition_object(&mut slot, "config", Operation::Del, None, identity_obj.as_ref(), false);
        assert!(matches!(result, Some(BroadcastData::Patch(_))));
        assert!(slot.as_ref().unwrap().is_empty());
    }

    #[test]
    fn glob_delete_with_no_object_wipes_the_whole_list() {
        let identity_obj = identity_object_filter();
        let identity_list = identity_list_filter();
        let mut objects = vec![obj("logs/1", 1, json!({})), obj("logs/2", 2, json!({}))];
        let result = transition_list(
            &mut objects,
            "logs/*",
            Operation::Del,
            None,
            identity_obj.as_ref(),
            identity_list.as_ref(),
        );
        assert!(matches!(result, Some(BroadcastData::Snapshot(Value::Array(v))) if v.is_empty()));
        assert!(objects.is_empty());
    }

    #[test]
    fn set_with_no_object_is_a_no_op() {
        let mut objects = Vec::new();
        let identity_obj = identity_object_filter();
        let identity_list = identity_list_filter();
        let result = transition_list(
            &mut objects,
            "items/*",
            Operation::Set,
            None,
            identity_obj.as_ref(),
            identity_list.as_ref(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn suppressed_object_with_no_prior_entry_skips() {
        let always_reject: Arc<FilterObjectFn> = Arc::new(|_, _| Err(FilterError));
        let identity_list = identity_list_filter();
        let mut objects = Vec::new();
        let candidate = obj("items/a", 1, json!({}));
        let result = transition_list(
            &mut objects,
            "items/*",
            Operation::Set,
            Some(&candidate),
            always_reject.as_ref(),
            identity_list.as_ref(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn suppressed_object_with_prior_entry_removes_it() {
        let always_reject: Arc<FilterObjectFn> = Arc::new(|_, _| Err(FilterError));
        let identity_list = identity_list_filter();
        let mut objects = vec![obj("items/a", 1, json!({}))];
        let candidate = obj("items/a", 1, json!({"changed": true}));
        let result = transition_list(
            &mut objects,
            "items/*",
            Operation::Set,
            Some(&candidate),
            always_reject.as_ref(),
            identity_list.as_ref(),
        );
        assert_eq!(result_patch(result), vec![remove_at(0)]);
        assert!(objects.is_empty());
    }

    fn result_patch(result: Option<BroadcastData>) -> Patch {
        match result {
            Some(BroadcastData::Patch(p)) => p,
            _ => panic!("expected a patch"),
        }
    }
}
