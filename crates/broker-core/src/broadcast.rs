//! The broadcast engine: owns the pool registry and trie, wraps the pure
//! cache transition with the pool mutex, the monotonic clock, and
//! connection fan-out. Mirrors how `state.rs`'s `AppState` guards its
//! registries with `RwLock`/`Mutex` and lazily creates entries with
//! double-checked locking in `get_or_create_broadcast`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_protocol::{path, Envelope, Object};
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::event::{Operation, StorageEvent};
use crate::pool::{
    identity_list_filter, identity_object_filter, BroadcastData, Cache, FilterListFn,
    FilterObjectFn,
};
use crate::trie::PoolTrie;

/// Below this many connections, fan-out writes sequentially; at or above
/// it, writes happen concurrently with a join barrier.
pub const PARALLEL_THRESHOLD: usize = 6;

/// Every connection write must complete within this deadline or the
/// connection is treated as failed and dropped.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(15);

pub type ConnectionId = u64;

#[derive(Debug, thiserror::Error)]
#[error("connection write failed")]
pub struct ConnectionError;

/// The transport abstraction the engine fans messages out over. The server
/// crate supplies the concrete `axum::extract::ws::WebSocket` adapter; the
/// core crate never depends on axum or any HTTP types.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), ConnectionError>;
}

struct ConnectionHandle {
    id: ConnectionId,
    conn: Arc<dyn Connection>,
}

/// Supplies the write-side filter pair for a given pool key. Pools with no
/// configured filter get the identity pair.
pub trait FilterProvider: Send + Sync {
    fn object_filter(&self, pool_key: &str) -> Arc<FilterObjectFn>;
    fn list_filter(&self, pool_key: &str) -> Arc<FilterListFn>;
}

/// The default provider: every pool is unfiltered.
pub struct NoFilters;

impl FilterProvider for NoFilters {
    fn object_filter(&self, _pool_key: &str) -> Arc<FilterObjectFn> {
        identity_object_filter()
    }

    fn list_filter(&self, _pool_key: &str) -> Arc<FilterListFn> {
        identity_list_filter()
    }
}

/// Subscription lifecycle callbacks (§4.4.4–§4.4.6). The server crate
/// supplies the concrete implementation (audit logging, connection-count
/// metrics, admission control); the engine only ever sees this trait.
#[async_trait]
pub trait SubscriptionHooks: Send + Sync {
    /// Invoked before a subscribe is admitted. An error aborts the
    /// subscribe before the connection receives its snapshot or joins the
    /// pool (§4.4.5 step 1).
    async fn on_subscribe(&self, key: &str) -> Result<(), HookError>;

    /// Invoked after a connection leaves its pool, whether by explicit
    /// unsubscribe/close (§4.4.6) or because a write failed during fan-out
    /// (§4.4.4). Runs fire-and-forget: nothing awaits its completion.
    async fn on_unsubscribe(&self, key: &str);
}

#[derive(Debug, thiserror::Error)]
#[error("on-subscribe hook rejected the connection")]
pub struct HookError;

/// The default hook pair: every subscribe is admitted, every unsubscribe is
/// silently ignored.
pub struct NoHooks;

#[async_trait]
impl SubscriptionHooks for NoHooks {
    async fn on_subscribe(&self, _key: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_unsubscribe(&self, _key: &str) {}
}

struct PoolState {
    cache: Cache,
    connections: Vec<ConnectionHandle>,
}

struct PoolEntry {
    state: Mutex<PoolState>,
}

#[derive(Debug, thiserror::Error)]
#[error("initial snapshot write failed on a freshly upgraded connection")]
pub struct Hijacked;

/// Why an attempted subscribe never joined its pool.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Hijacked(#[from] Hijacked),
    #[error(transparent)]
    Rejected(#[from] HookError),
}

/// The subscription multiplexer: trie + pool registry + clock + fan-out.
pub struct Engine {
    trie: RwLock<PoolTrie>,
    pools: RwLock<HashMap<String, Arc<PoolEntry>>>,
    clock: Clock,
    filters: Arc<dyn FilterProvider>,
    hooks: Arc<dyn SubscriptionHooks>,
    next_conn_id: AtomicU64,
    no_patch: bool,
}

impl Engine {
    pub fn new(clock: Clock, filters: Arc<dyn FilterProvider>) -> Self {
        Engine::with_hooks(clock, filters, Arc::new(NoHooks))
    }

    pub fn with_hooks(
        clock: Clock,
        filters: Arc<dyn FilterProvider>,
        hooks: Arc<dyn SubscriptionHooks>,
    ) -> Self {
        Engine {
            trie: RwLock::new(PoolTrie::new()),
            pools: RwLock::new(HashMap::new()),
            clock,
            filters,
            hooks,
            next_conn_id: AtomicU64::new(1),
            no_patch: false,
        }
    }

    /// Force every broadcast to be a full snapshot rather than a patch.
    pub fn with_no_patch(mut self, no_patch: bool) -> Self {
        self.no_patch = no_patch;
        self
    }

    /// Pre-register a pool (e.g. from configured filter paths) without
    /// waiting for its first subscriber or broadcast.
    pub async fn preallocate(&self, pool_key: &str) {
        self.get_or_create_pool(pool_key).await;
    }

    async fn get_or_create_pool(&self, pool_key: &str) -> Arc<PoolEntry> {
        {
            let pools = self.pools.read().await;
            if let Some(entry) = pools.get(pool_key) {
                return entry.clone();
            }
        }
        let mut pools = self.pools.write().await;
        if let Some(entry) = pools.get(pool_key) {
            return entry.clone();
        }
        let cache = if path::is_glob(pool_key) {
            Cache::new_list()
        } else {
            Cache::new_object()
        };
        let entry = Arc::new(PoolEntry {
            state: Mutex::new(PoolState {
                cache,
                connections: Vec::new(),
            }),
        });
        pools.insert(pool_key.to_owned(), entry.clone());
        self.trie.write().await.insert(pool_key);
        entry
    }

    /// Route and apply one storage mutation, fanning the result out to
    /// every pool it affects. Acknowledges the event's `done` signal once
    /// every affected pool has completed its cache transition.
    pub async fn broadcast(&self, event: StorageEvent) {
        let routes = self.trie.read().await.routes_for_key(&event.key);
        for pool_key in &routes {
            let entry = self.get_or_create_pool(pool_key).await;
            self.apply_and_dispatch(&entry, pool_key, event.operation, event.object.as_ref())
                .await;
        }
        event.ack();
    }

    async fn apply_and_dispatch(
        &self,
        entry: &PoolEntry,
        pool_key: &str,
        op: Operation,
        obj: Option<&Object>,
    ) {
        let object_filter = self.filters.object_filter(pool_key);
        let list_filter = self.filters.list_filter(pool_key);
        let mut state = entry.state.lock().await;
        let result = crate::pool::transition(
            &mut state.cache,
            pool_key,
            op,
            obj,
            object_filter.as_ref(),
            list_filter.as_ref(),
            self.no_patch,
        );
        let Some(data) = result else {
            return;
        };
        let version = self.clock.now();
        state.cache.set_version(version);
        let envelope = match data {
            BroadcastData::Snapshot(value) => Envelope::new(true, version, value),
            BroadcastData::Patch(patch) => {
                Envelope::new(false, version, serde_json::to_value(patch).unwrap_or_default())
            }
        };
        let bytes = envelope.to_bytes();
        fan_out(&mut state.connections, bytes, pool_key, &self.hooks).await;
    }

    /// Admit a new subscriber: invoke `OnSubscribe` and abort if it errors
    /// (§4.4.5 step 1), then write the initial snapshot on the
    /// already-upgraded connection, and only on success join it to the
    /// pool (creating the pool, and registering it in the trie, if this is
    /// its first subscriber). See the module docs on admission ordering.
    pub async fn subscribe(
        &self,
        key: &str,
        conn: Arc<dyn Connection>,
    ) -> Result<ConnectionId, SubscribeError> {
        self.hooks.on_subscribe(key).await?;
        let entry = self.get_or_create_pool(key).await;
        let mut state = entry.state.lock().await;
        let snapshot = Envelope::new(true, state.cache.version(), state.cache.encode());
        conn.send(snapshot.to_bytes()).await.map_err(|_| Hijacked)?;
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        state.connections.push(ConnectionHandle { id, conn });
        Ok(id)
    }

    /// Remove a connection from its pool by id (swap-and-truncate, O(1)),
    /// then run `OnUnsubscribe` asynchronously (§4.4.6).
    pub async fn unsubscribe(&self, key: &str, id: ConnectionId) {
        let entry = {
            let pools = self.pools.read().await;
            match pools.get(key) {
                Some(e) => e.clone(),
                None => return,
            }
        };
        let mut state = entry.state.lock().await;
        let removed = if let Some(pos) = state.connections.iter().position(|c| c.id == id) {
            state.connections.swap_remove(pos);
            true
        } else {
            false
        };
        drop(state);
        if removed {
            spawn_unsubscribe_hook(self.hooks.clone(), key.to_owned());
        }
    }

    /// Close every connection on every pool. Used on server shutdown.
    pub async fn close_all(&self) {
        let pools = self.pools.read().await;
        for entry in pools.values() {
            let mut state = entry.state.lock().await;
            state.connections.clear();
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

async fn fan_out(
    connections: &mut Vec<ConnectionHandle>,
    bytes: Vec<u8>,
    pool_key: &str,
    hooks: &Arc<dyn SubscriptionHooks>,
) {
    if connections.is_empty() {
        return;
    }
    let mut failed = Vec::new();
    if connections.len() < PARALLEL_THRESHOLD {
        for handle in connections.iter() {
            if write_with_deadline(handle.conn.as_ref(), bytes.clone())
                .await
                .is_err()
            {
                failed.push(handle.id);
            }
        }
    } else {
        let mut tasks = Vec::with_capacity(connections.len());
        for handle in connections.iter() {
            let conn = handle.conn.clone();
            let bytes = bytes.clone();
            let id = handle.id;
            tasks.push(async move {
                let ok = write_with_deadline(conn.as_ref(), bytes).await.is_ok();
                (id, ok)
            });
        }
        let results = futures_util::future::join_all(tasks).await;
        for (id, ok) in results {
            if !ok {
                failed.push(id);
            }
        }
    }
    connections.retain(|c| !failed.contains(&c.id));
    // §4.4.4: a write failure during fan-out drops the connection the same
    // way an explicit unsubscribe does, including the hook notification.
    for _ in &failed {
        spawn_unsubscribe_hook(hooks.clone(), pool_key.to_owned());
    }
}

/// Run `OnUnsubscribe` on its own task so neither `unsubscribe` nor fan-out
/// ever waits on it (§4.4.6: "asynchronously").
fn spawn_unsubscribe_hook(hooks: Arc<dyn SubscriptionHooks>, key: String) {
    tokio::spawn(async move {
        hooks.on_unsubscribe(&key).await;
    });
}

async fn write_with_deadline(conn: &dyn Connection, bytes: Vec<u8>) -> Result<(), ConnectionError> {
    match tokio::time::timeout(WRITE_DEADLINE, conn.send(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError),
    }
}
