//! Registry of live channels, keyed by remote authority.
//!
//! Holds at most one channel per `(host, port)`. Admission logic (who
//! gets announced, who gets rejected) lives in the coordinator; this is
//! the bare synchronized set.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::channel::Channel;
use crate::error::NetError;

pub struct Connections {
    channels: Mutex<HashMap<SocketAddr, Arc<Channel>>>,
}

impl Connections {
    pub fn new() -> Connections {
        Connections {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn exists(&self, authority: &SocketAddr) -> bool {
        self.lock().contains_key(authority)
    }

    /// Registers a channel. Fails with `AddressInUse` when a channel for
    /// the same authority is already live.
    pub fn store(&self, channel: Arc<Channel>) -> Result<(), NetError> {
        let authority = channel.authority();
        match self.lock().entry(authority) {
            Entry::Occupied(_) => Err(NetError::AddressInUse),
            Entry::Vacant(slot) => {
                slot.insert(channel);
                Ok(())
            }
        }
    }

    pub fn remove(&self, channel: &Channel) -> Result<(), NetError> {
        match self.lock().remove(&channel.authority()) {
            Some(_) => Ok(()),
            None => Err(NetError::NotFound),
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Stops every registered channel with `code` and clears the set.
    pub async fn stop_all(&self, code: NetError) {
        let drained: Vec<Arc<Channel>> = self.lock().drain().map(|(_, channel)| channel).collect();
        for channel in drained {
            channel.stop(code).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, Arc<Channel>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Connections {
    fn default() -> Self {
        Self::new()
    }
}
