//! An in-memory `Storage` backed by a `RwLock<HashMap>`. Durable persistence
//! is explicitly out of scope for the core; this is the store the server
//! binary actually runs with.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use broker_core::clock::Clock;
use broker_core::event::StorageEvent;
use broker_core::storage::{Storage, StorageError};
use broker_protocol::{path, Object};
use tokio::sync::{mpsc, RwLock};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

pub struct MemoryStorage {
    data: RwLock<HashMap<String, Object>>,
    clock: Clock,
    tx: mpsc::Sender<StorageEvent>,
    rx: StdMutex<Option<mpsc::Receiver<StorageEvent>>>,
}

impl MemoryStorage {
    pub fn new(clock: Clock) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        MemoryStorage {
            data: RwLock::new(HashMap::new()),
            clock,
            tx,
            rx: StdMutex::new(Some(rx)),
        }
    }

    async fn emit(&self, event: StorageEvent) {
        let _ = self.tx.send(event).await;
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Object, StorageError> {
        if !path::is_valid(key) {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        Ok(self.data.read().await.get(key).cloned().unwrap_or_else(Object::empty))
    }

    async fn get_list(&self, glob: &str) -> Result<Vec<Object>, StorageError> {
        if !path::is_valid(glob) {
            return Err(StorageError::InvalidKey(glob.to_owned()));
        }
        let data = self.data.read().await;
        let mut matches: Vec<Object> = data
            .iter()
            .filter(|(k, _)| path::match_path(glob, k))
            .map(|(_, v)| v.clone())
            .collect();
        matches.sort_by_key(|o| o.created);
        Ok(matches)
    }

    async fn set(&self, key: &str, data: serde_json::Value) -> Result<Object, StorageError> {
        if !path::is_valid(key) {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        if path::is_glob(key) {
            return Err(StorageError::WriteToGlobPath(key.to_owned()));
        }
        let tick = self.clock.now();
        let mut store = self.data.write().await;
        let created = store.get(key).map(|o| o.created).filter(|c| *c != 0).unwrap_or(tick);
        let object = Object {
            created,
            updated: tick,
            index: path::last_index(key).to_owned(),
            path: key.to_owned(),
            data,
        };
        store.insert(key.to_owned(), object.clone());
        drop(store);
        self.emit(StorageEvent::set(key, object.clone())).await;
        Ok(object)
    }

    async fn push(&self, glob: &str, data: serde_json::Value) -> Result<Object, StorageError> {
        if !path::is_valid(glob) {
            return Err(StorageError::InvalidKey(glob.to_owned()));
        }
        if !path::is_glob(glob) {
            return Err(StorageError::PushToLiteralPath(glob.to_owned()));
        }
        let tick = self.clock.now();
        let key = path::build(glob, tick);
        let object = Object {
            created: tick,
            updated: tick,
            index: path::last_index(&key).to_owned(),
            path: key.clone(),
            data,
        };
        self.data.write().await.insert(key.clone(), object.clone());
        self.emit(StorageEvent::set(&key, object.clone())).await;
        Ok(object)
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        if !path::is_valid(key) {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        if path::is_glob(key) {
            let mut store = self.data.write().await;
            store.retain(|k, _| !path::match_path(key, k));
            drop(store);
            self.emit(StorageEvent::del(key)).await;
        } else if let Some(old) = self.data.write().await.remove(key) {
            self.emit(StorageEvent::del_object(key, old)).await;
        }
        Ok(())
    }

    fn watch(&self) -> mpsc::Receiver<StorageEvent> {
        self.rx
            .lock()
            .expect("storage event receiver mutex poisoned")
            .take()
            .expect("Storage::watch called more than once on this store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn storage() -> MemoryStorage {
        MemoryStorage::new(Clock::new())
    }

    #[tokio::test]
    async fn get_on_an_unset_key_returns_the_empty_object() {
        let store = storage();
        let obj = store.get("config").await.unwrap();
        assert!(obj.is_empty());
    }

    #[tokio::test]
    async fn set_then_get_round_trips_the_value() {
        let store = storage();
        store.set("config", json!({"theme": "dark"})).await.unwrap();
        let obj = store.get("config").await.unwrap();
        assert_eq!(obj.data, json!({"theme": "dark"}));
        assert!(obj.created > 0);
    }

    #[tokio::test]
    async fn set_preserves_created_across_updates() {
        let store = storage();
        let first = store.set("config", json!({"v": 1})).await.unwrap();
        let second = store.set("config", json!({"v": 2})).await.unwrap();
        assert_eq!(first.created, second.created);
        assert!(second.updated >= first.updated);
    }

    #[tokio::test]
    async fn set_rejects_a_glob_key() {
        let store = storage();
        assert!(matches!(
            store.set("users/*", json!({})).await,
            Err(StorageError::WriteToGlobPath(_))
        ));
    }

    #[tokio::test]
    async fn push_rejects_a_literal_key() {
        let store = storage();
        assert!(matches!(
            store.push("users/42", json!({})).await,
            Err(StorageError::PushToLiteralPath(_))
        ));
    }

    #[tokio::test]
    async fn push_generates_distinct_keys_under_the_glob() {
        let store = storage();
        let a = store.push("users/*", json!({"n": 1})).await.unwrap();
        let b = store.push("users/*", json!({"n": 2})).await.unwrap();
        assert_ne!(a.path, b.path);
        assert!(a.path.starts_with("users/"));
    }

    #[tokio::test]
    async fn get_list_returns_matches_ascending_by_created() {
        let store = storage();
        store.push("users/*", json!({"n": 1})).await.unwrap();
        store.push("users/*", json!({"n": 2})).await.unwrap();
        let list = store.get_list("users/*").await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].created <= list[1].created);
    }

    #[tokio::test]
    async fn get_list_descending_reverses_the_ascending_order() {
        let store = storage();
        store.push("users/*", json!({"n": 1})).await.unwrap();
        store.push("users/*", json!({"n": 2})).await.unwrap();
        let ascending = store.get_list("users/*").await.unwrap();
        let descending = store.get_list_descending("users/*").await.unwrap();
        assert_eq!(descending, ascending.into_iter().rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn del_on_a_literal_key_removes_just_that_record() {
        let store = storage();
        store.set("a", json!({})).await.unwrap();
        store.set("b", json!({})).await.unwrap();
        store.del("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_empty());
        assert!(!store.get("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn del_on_a_glob_key_wipes_every_match() {
        let store = storage();
        store.push("users/*", json!({"n": 1})).await.unwrap();
        store.push("users/*", json!({"n": 2})).await.unwrap();
        store.del("users/*").await.unwrap();
        assert!(store.get_list("users/*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn del_on_a_literal_key_under_a_glob_emits_the_removed_object_not_a_wipe() {
        let store = storage();
        let mut events = store.watch();
        let pushed = store.push("users/*", json!({"n": 1})).await.unwrap();
        let _ = events.recv().await.unwrap(); // the push event

        store.del(&pushed.path).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.key, pushed.path);
        assert_eq!(event.object.as_ref().map(|o| &o.path), Some(&pushed.path));
    }

    #[tokio::test]
    async fn del_on_a_nonexistent_literal_key_emits_nothing() {
        let store = storage();
        let mut events = store.watch();
        store.del("never-set").await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn push_emits_its_event_keyed_by_the_generated_literal_path_not_the_glob() {
        let store = storage();
        let mut events = store.watch();
        let pushed = store.push("users/*", json!({"n": 1})).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.key, pushed.path);
        assert_ne!(event.key, "users/*");
    }

    #[tokio::test]
    async fn watch_delivers_every_mutation_in_order() {
        let store = storage();
        let mut events = store.watch();
        store.set("a", json!({"v": 1})).await.unwrap();
        store.del("a").await.unwrap();
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.key, "a");
        assert_eq!(second.key, "a");
    }

    #[tokio::test]
    #[should_panic(expected = "Storage::watch called more than once")]
    async fn watch_panics_if_called_twice() {
        let store = storage();
        let _first = store.watch();
        let _second = store.watch();
    }
}
