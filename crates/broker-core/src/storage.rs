//! The opaque persistence collaborator the engine depends on. Durable
//! storage itself is out of scope for the core; this trait is the seam the
//! server binary plugs an implementation into (`storage::memory` in
//! `services/broker-server` for this build).

use async_trait::async_trait;
use broker_protocol::Object;
use tokio::sync::mpsc;

use crate::event::StorageEvent;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("key '{0}' does not satisfy the path grammar")]
    InvalidKey(String),
    #[error("write rejected to a glob path '{0}'")]
    WriteToGlobPath(String),
    #[error("push rejected to a non-glob path '{0}'")]
    PushToLiteralPath(String),
}

/// The storage collaborator contract: get/list/mutate a hierarchical key
/// space and emit a stream of `StorageEvent`s for every mutation, whether
/// caused through this trait or by some other writer sharing the same
/// backing store.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch the object at a literal key, or `Object::empty()` if unset.
    async fn get(&self, key: &str) -> Result<Object, StorageError>;

    /// Fetch every object matching a glob, ascending by `Created`.
    async fn get_list(&self, glob: &str) -> Result<Vec<Object>, StorageError>;

    /// Same as `get_list`, but descending by `Created`.
    async fn get_list_descending(&self, glob: &str) -> Result<Vec<Object>, StorageError> {
        let mut objects = self.get_list(glob).await?;
        objects.reverse();
        Ok(objects)
    }

    /// Write `data` at a literal key, returning the stored object.
    async fn set(&self, key: &str, data: serde_json::Value) -> Result<Object, StorageError>;

    /// Insert `data` at a freshly generated key under `glob`, returning the
    /// stored object. Rejects a non-glob path.
    async fn push(&self, glob: &str, data: serde_json::Value) -> Result<Object, StorageError>;

    /// Delete the object(s) at `key` (a literal key deletes one object; a
    /// glob key wipes every object beneath it).
    async fn del(&self, key: &str) -> Result<(), StorageError>;

    /// Subscribe to every mutation this store accepts, in the order they
    /// are applied.
    fn watch(&self) -> mpsc::Receiver<StorageEvent>;
}
