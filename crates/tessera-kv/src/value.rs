//! Versioned values and change streams

use crate::error::{KvError, KvResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

/// A value read from the store together with its version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Value {
    version: u64,
    data: Bytes,
}

impl Value {
    /// Create a new value
    pub fn new(version: u64, data: impl Into<Bytes>) -> Self {
        Self {
            version,
            data: data.into(),
        }
    }

    /// Version of the value; the first write of a key is version 1
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Raw bytes of the value
    #[must_use]
    pub const fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decode the value as a protobuf message
    pub fn decode<M: prost::Message + Default>(&self) -> KvResult<M> {
        Ok(M::decode(self.data.clone())?)
    }
}

/// A subscription to the changes of one key.
///
/// The stream always yields the latest value; intermediate versions written
/// between two polls are coalesced. `None` means the key was deleted.
#[derive(Debug)]
pub struct ValueWatch {
    key: String,
    rx: watch::Receiver<Option<Value>>,
}

impl ValueWatch {
    /// Key being watched
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest value without waiting
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }

    /// Wait until the value changes and return the new value
    pub async fn changed(&mut self) -> KvResult<Option<Value>> {
        self.rx
            .changed()
            .await
            .map_err(|_| KvError::WatchClosed(self.key.clone()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

/// Per-key change notifiers shared by the store backends
#[derive(Debug, Default)]
pub(crate) struct Watchables {
    senders: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
}

impl Watchables {
    /// Subscribe to a key. An existing value is delivered as the first change.
    pub(crate) fn subscribe(&self, key: &str, current: Option<Value>) -> ValueWatch {
        let mut senders = self.senders.lock();
        let sender = senders
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(current).0);
        let mut rx = sender.subscribe();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        ValueWatch {
            key: key.to_string(),
            rx,
        }
    }

    /// Publish a new value (or a deletion) to every subscriber of the key
    pub(crate) fn notify(&self, key: &str, value: Option<Value>) {
        if let Some(sender) = self.senders.lock().get(key) {
            sender.send_replace(value);
        }
    }
}
