//! `subscribe_multiple`: fan a callback across N independent list
//! subscriptions, each owning its own reconnect state machine, funnelled
//! through a single aggregator task that holds the last-known state of
//! every path and reports which one just changed.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::subscribe::{subscribe_list, ClientError, Meta, SubscribeConfig, SubscribeHandle};

struct Update<T> {
    index: usize,
    states: Vec<Meta<T>>,
}

/// A running `subscribe_multiple` fan-in. Dropping this leaves the
/// background subscriptions running; call `close` to tear everything down.
pub struct MultiSubscribeHandle {
    handles: Vec<SubscribeHandle>,
    aggregator: JoinHandle<()>,
}

impl MultiSubscribeHandle {
    pub async fn close(self) {
        for handle in self.handles {
            handle.close().await;
        }
        let _ = self.aggregator.await;
    }
}

/// Subscribe to `paths.len()` glob keys at once. On every update to any one
/// of them, `on_update` is invoked with the current state of all paths and
/// a same-length mask with exactly one `true` entry marking which path just
/// changed.
pub fn subscribe_multiple<T, OnUpdate, OnError>(
    protocol: impl Into<String>,
    host: impl Into<String>,
    paths: Vec<String>,
    on_update: OnUpdate,
    on_error: OnError,
) -> Result<MultiSubscribeHandle, crate::subscribe::ConfigError>
where
    T: DeserializeOwned + Send + 'static,
    OnUpdate: Fn(&[Vec<Meta<T>>], &[bool]) + Send + Sync + 'static,
    OnError: Fn(ClientError) + Send + Sync + 'static,
{
    let protocol = protocol.into();
    let host = host.into();
    let n = paths.len();
    let (tx, mut rx) = mpsc::unbounded_channel::<Update<T>>();
    let on_error = Arc::new(on_error);

    let mut handles = Vec::with_capacity(n);
    for (index, path) in paths.into_iter().enumerate() {
        let config = SubscribeConfig::new(protocol.clone(), host.clone(), path);
        let tx = tx.clone();
        let on_error = on_error.clone();
        let handle = subscribe_list::<T, _, _>(
            config,
            move |states| {
                let _ = tx.send(Update { index, states });
            },
            move |err| on_error(err),
        )?;
        handles.push(handle);
    }
    drop(tx);

    let aggregator = tokio::spawn(async move {
        let mut states: Vec<Vec<Meta<T>>> = (0..n).map(|_| Vec::new()).collect();
        while let Some(update) = rx.recv().await {
            states[update.index] = update.states;
            let mut mask = vec![false; n];
            mask[update.index] = true;
            on_update(&states, &mask);
        }
    });

    Ok(MultiSubscribeHandle { handles, aggregator })
}
