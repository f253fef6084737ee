//! Storage mutation events: the sole input to the broadcast engine.

use broker_protocol::Object;
use tokio::sync::oneshot;

/// The kind of mutation a `StorageEvent` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Del,
}

/// One storage mutation, as delivered over `Storage::watch`'s channel.
/// `done`, if present, is fulfilled by the broker once every affected pool
/// has completed its cache transition (not necessarily once fan-out has
/// finished writing to every connection).
pub struct StorageEvent {
    pub key: String,
    pub operation: Operation,
    pub object: Option<Object>,
    pub done: Option<oneshot::Sender<()>>,
}

impl StorageEvent {
    pub fn set(key: impl Into<String>, object: Object) -> Self {
        StorageEvent {
            key: key.into(),
            operation: Operation::Set,
            object: Some(object),
            done: None,
        }
    }

    /// A glob-wipe delete (§4.4.2 "op=del, obj=nil"): every object beneath
    /// `key` is gone, with no single removed object to report.
    pub fn del(key: impl Into<String>) -> Self {
        StorageEvent {
            key: key.into(),
            operation: Operation::Del,
            object: None,
            done: None,
        }
    }

    /// A single-item delete under a glob (§4.4.2 "op=del, obj≠nil"): `old`
    /// is the object that was removed, so a list pool can evict just its
    /// entry instead of wiping the whole cache.
    pub fn del_object(key: impl Into<String>, old: Object) -> Self {
        StorageEvent {
            key: key.into(),
            operation: Operation::Del,
            object: Some(old),
            done: None,
        }
    }

    pub fn with_done(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }

    /// Signal completion, if anyone is waiting. Silently ignored if the
    /// receiver has already been dropped.
    pub fn ack(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}
