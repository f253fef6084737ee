//! Reconnecting subscribe client: a background task that dials a broker's
//! WebSocket endpoint, folds inbound snapshot/patch frames into a local
//! cache, and decodes each resulting state into the caller's type.

pub mod multi;
pub mod subscribe;

pub use multi::{subscribe_multiple, MultiSubscribeHandle};
pub use subscribe::{
    subscribe_list, subscribe_object, ClientError, ConfigError, Meta, SubscribeConfig, SubscribeHandle,
};
