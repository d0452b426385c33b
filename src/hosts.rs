//! The address book: known peers, persisted across runs.
//!
//! An in-memory set keyed by `(ip, port)` with load/save against a
//! configured file. The on-disk format is a bincode-encoded
//! `Vec<PeerAddress>`; deserialization is size-bounded so a corrupt or
//! hostile file cannot balloon memory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use bincode::Options;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::messages::PeerAddress;

/// Upper bound on a hosts file read back from disk (4 MiB, roughly
/// 100k addresses).
const MAX_HOSTS_FILE: u64 = 4 * 1024 * 1024;

pub struct Hosts {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<SocketAddr, PeerAddress>>,
}

impl Hosts {
    /// A book backed by `path`; `None` keeps it memory-only.
    pub fn new(path: Option<PathBuf>) -> Hosts {
        Hosts {
            path,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Populates the book from the backing file. An absent file is an
    /// empty book, not an error.
    pub fn load(&self) -> Result<(), NetError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            debug!(path = %path.display(), "no hosts file, starting empty");
            return Ok(());
        }

        let bytes = std::fs::read(path).map_err(|err| {
            warn!(path = %path.display(), error = %err, "hosts file read failed");
            NetError::FileSystem
        })?;
        let list: Vec<PeerAddress> = bincode::DefaultOptions::new()
            .with_limit(MAX_HOSTS_FILE)
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .deserialize(&bytes)
            .map_err(|err| {
                warn!(path = %path.display(), error = %err, "hosts file does not parse");
                NetError::FileSystem
            })?;

        let mut entries = self.lock();
        for address in list {
            entries.entry(address.authority()).or_insert(address);
        }
        debug!(count = entries.len(), "hosts loaded");
        Ok(())
    }

    /// Persists the current book to the backing file.
    pub fn save(&self) -> Result<(), NetError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list: Vec<PeerAddress> = self.lock().values().copied().collect();
        let bytes = bincode::serialize(&list).map_err(|err| {
            warn!(error = %err, "hosts serialization failed");
            NetError::FileSystem
        })?;
        std::fs::write(path, bytes).map_err(|err| {
            warn!(path = %path.display(), error = %err, "hosts file write failed");
            NetError::FileSystem
        })?;
        debug!(count = list.len(), path = %path.display(), "hosts saved");
        Ok(())
    }

    /// Picks one address uniformly at random.
    pub fn fetch(&self) -> Result<PeerAddress, NetError> {
        let entries = self.lock();
        if entries.is_empty() {
            return Err(NetError::NotFound);
        }
        let index = rand::thread_rng().gen_range(0..entries.len());
        entries
            .values()
            .nth(index)
            .copied()
            .ok_or(NetError::NotFound)
    }

    /// Inserts one address; a known authority keeps its original record.
    pub fn store(&self, address: PeerAddress) {
        self.lock().entry(address.authority()).or_insert(address);
    }

    /// Batch insert. Returns how many authorities were new.
    pub fn store_many<I>(&self, addresses: I) -> usize
    where
        I: IntoIterator<Item = PeerAddress>,
    {
        let mut entries = self.lock();
        let before = entries.len();
        for address in addresses {
            entries.entry(address.authority()).or_insert(address);
        }
        entries.len() - before
    }

    /// Deletes an authority; absent is a no-op.
    pub fn remove(&self, authority: &SocketAddr) {
        self.lock().remove(authority);
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, PeerAddress>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
