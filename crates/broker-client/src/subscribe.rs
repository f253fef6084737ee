//! The subscribe client reconnection state machine: Dial → Read → Backoff →
//! Dial | Exit. Grounded on `services/receiver/src/session.rs`'s
//! `tokio::select!` read loop over a `futures_util::Stream`/`Sink` pair, and
//! `services/receiver/src/local_proxy.rs`'s `watch<bool>` shutdown signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use broker_core::codec::{patch_list, patch_object};
use broker_protocol::{decode_envelope, path, Envelope, Object};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Reconnect delay on a dial failure: fixed, not tiered (§4.6 step b).
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

const MEDIUM_THRESHOLD: u32 = 30;
const MAX_THRESHOLD: u32 = 100;
const INITIAL_DELAY: Duration = Duration::from_millis(300);
const MEDIUM_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("protocol must not be empty")]
    ProtocolRequired,
    #[error("host must not be empty")]
    HostRequired,
    #[error("path must not be empty")]
    PathRequired,
    #[error("a glob path is not allowed for a single-object subscription")]
    GlobNotAllowed,
    #[error("a glob path is required for a list subscription")]
    GlobRequired,
    #[error("path '{0}' does not satisfy the path grammar")]
    InvalidPath(String),
}

/// Connect/read-loop errors surfaced through `on_error`; never fatal to the
/// process, only to the current connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("dial failed: {0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed envelope: {0}")]
    Envelope(#[from] broker_protocol::EnvelopeError),
    #[error("patch application failed: {0}")]
    Patch(#[from] broker_core::codec::PatchCacheError),
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),
}

/// A decoded message, carrying the same metadata the wire `Object` does.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta<T> {
    pub created: i64,
    pub updated: i64,
    pub index: String,
    pub data: T,
}

fn meta_from_object<T: DeserializeOwned>(obj: Object) -> Result<Meta<T>, serde_json::Error> {
    Ok(Meta {
        created: obj.created,
        updated: obj.updated,
        index: obj.index,
        data: serde_json::from_value(obj.data)?,
    })
}

/// Connection parameters for one subscription.
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    pub protocol: String,
    pub host: String,
    pub path: String,
    pub handshake_timeout: Duration,
}

impl SubscribeConfig {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        SubscribeConfig {
            protocol: protocol.into(),
            host: host.into(),
            path: path.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    fn validate(&self, require_glob: bool) -> Result<(), ConfigError> {
        if self.protocol.is_empty() {
            return Err(ConfigError::ProtocolRequired);
        }
        if self.host.is_empty() {
            return Err(ConfigError::HostRequired);
        }
        if self.path.is_empty() {
            return Err(ConfigError::PathRequired);
        }
        if !path::is_valid(&self.path) {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        let is_glob = path::is_glob(&self.path);
        if require_glob && !is_glob {
            return Err(ConfigError::GlobRequired);
        }
        if !require_glob && is_glob {
            return Err(ConfigError::GlobNotAllowed);
        }
        Ok(())
    }

    fn url(&self) -> String {
        format!("{}://{}/{}", self.protocol, self.host, self.path)
    }
}

/// A running subscription. Dropping this without calling `close` leaves the
/// background task running; call `close` to stop it and wait for exit.
pub struct SubscribeHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    retry_count: Arc<AtomicU64>,
}

impl SubscribeHandle {
    pub async fn close(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }

    /// Number of reconnect attempts since the last successfully read message.
    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }
}

/// Subscribe to a single literal key, invoking `on_message` with the
/// decoded object on every snapshot/patch frame.
pub fn subscribe_object<T, OnMessage, OnError>(
    config: SubscribeConfig,
    on_message: OnMessage,
    on_error: OnError,
) -> Result<SubscribeHandle, ConfigError>
where
    T: DeserializeOwned + Send + 'static,
    OnMessage: Fn(Meta<T>) + Send + Sync + 'static,
    OnError: Fn(ClientError) + Send + Sync + 'static,
{
    config.validate(false)?;
    Ok(spawn_loop(config, move |cache, envelope| {
        let (new_cache, object) = patch_object(&envelope, cache)?;
        let meta: Meta<T> = meta_from_object(object).map_err(ClientError::Decode)?;
        on_message(meta);
        Ok(new_cache)
    }, on_error))
}

/// Subscribe to a glob key, invoking `on_message` with the decoded list on
/// every snapshot/patch frame.
pub fn subscribe_list<T, OnMessage, OnError>(
    config: SubscribeConfig,
    on_message: OnMessage,
    on_error: OnError,
) -> Result<SubscribeHandle, ConfigError>
where
    T: DeserializeOwned + Send + 'static,
    OnMessage: Fn(Vec<Meta<T>>) + Send + Sync + 'static,
    OnError: Fn(ClientError) + Send + Sync + 'static,
{
    config.validate(true)?;
    Ok(spawn_loop(config, move |cache, envelope| {
        let (new_cache, objects) = patch_list(&envelope, cache)?;
        let metas = objects
            .into_iter()
            .map(meta_from_object)
            .collect::<Result<Vec<Meta<T>>, _>>()
            .map_err(ClientError::Decode)?;
        on_message(metas);
        Ok(new_cache)
    }, on_error))
}

fn spawn_loop<F, OnError>(config: SubscribeConfig, apply: F, on_error: OnError) -> SubscribeHandle
where
    F: Fn(&Value, Envelope) -> Result<Value, ClientError> + Send + Sync + 'static,
    OnError: Fn(ClientError) + Send + Sync + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let retry_count = Arc::new(AtomicU64::new(0));
    let task_retry_count = retry_count.clone();
    let task = tokio::spawn(run_subscribe_loop(config, apply, on_error, stop_rx, task_retry_count));
    SubscribeHandle {
        stop: stop_tx,
        task,
        retry_count,
    }
}

async fn run_subscribe_loop<F, OnError>(
    config: SubscribeConfig,
    apply: F,
    on_error: OnError,
    mut stop: watch::Receiver<bool>,
    retry_count: Arc<AtomicU64>,
) where
    F: Fn(&Value, Envelope) -> Result<Value, ClientError>,
    OnError: Fn(ClientError),
{
    let mut cache = Value::Null;
    loop {
        if *stop.borrow() {
            return;
        }

        let dial_result = tokio::time::timeout(
            config.handshake_timeout,
            tokio_tungstenite::connect_async(config.url()),
        )
        .await;

        let mut ws = match dial_result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                on_error(ClientError::Dial(err));
                if wait_or_stop(&mut stop, DIAL_RETRY_DELAY).await {
                    return;
                }
                continue;
            }
            Err(_elapsed) => {
                on_error(ClientError::Dial(
                    tokio_tungstenite::tungstenite::Error::ConnectionClosed,
                ));
                if wait_or_stop(&mut stop, DIAL_RETRY_DELAY).await {
                    return;
                }
                continue;
            }
        };

        'read: loop {
            tokio::select! {
                biased;
                _ = stop.changed() => {
                    let _ = ws.close(None).await;
                    return;
                }
                msg = ws.next() => {
                    match msg {
                        None => break 'read,
                        Some(Err(err)) => {
                            on_error(ClientError::Dial(err));
                            break 'read;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            match decode_envelope(&bytes) {
                                Ok(envelope) => match apply(&cache, envelope) {
                                    Ok(new_cache) => {
                                        cache = new_cache;
                                        retry_count.store(0, Ordering::Relaxed);
                                    }
                                    Err(err) => {
                                        on_error(err);
                                        break 'read;
                                    }
                                },
                                Err(err) => {
                                    on_error(ClientError::Envelope(err));
                                    break 'read;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => break 'read,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        if *stop.borrow() {
            return;
        }

        let attempt = retry_count.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = if attempt < u64::from(MEDIUM_THRESHOLD) {
            INITIAL_DELAY
        } else if attempt < u64::from(MAX_THRESHOLD) {
            MEDIUM_DELAY
        } else {
            MAX_DELAY
        };
        debug!(attempt, ?delay, "reconnecting");
        if wait_or_stop(&mut stop, delay).await {
            return;
        }
    }
}

/// Sleep for `delay`, waking early if `stop` flips to `true`. Returns
/// `true` if the wait ended because of cancellation.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => *stop.borrow(),
    }
}
