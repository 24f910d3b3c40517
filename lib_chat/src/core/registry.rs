//! # Client Registry
//!
//! The set of clients currently eligible for broadcasts.
//!
//! The map lives behind `Mutex<Arc<HashMap<..>>>`. Writers lock, mutate through
//! `Arc::make_mut` and unlock; the map is only cloned when a snapshot taken
//! earlier is still alive. Readers lock just long enough to clone the outer
//! `Arc`, so the broadcaster iterates a frozen view while connects and
//! disconnects keep landing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::frame::ChatFrame;

/// Registry-issued identity of one outbound connection.
pub type ClientId = u64;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// One particular registration of a client id.
///
/// Re-registering an id produces a new generation, so a worker that was
/// retired by the replacement cannot remove the entry that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub id: ClientId,
    pub generation: u64,
}

/// What the registry keeps for one client: the sending half of its delivery
/// mailbox and the token that stops its worker.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    key: ClientKey,
    mailbox: mpsc::Sender<Arc<ChatFrame>>,
    cancel: CancellationToken,
}

impl ClientEntry {
    pub fn new(id: ClientId, mailbox: mpsc::Sender<Arc<ChatFrame>>, cancel: CancellationToken) -> Self {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        Self {
            key: ClientKey { id, generation },
            mailbox,
            cancel,
        }
    }

    pub fn id(&self) -> ClientId {
        self.key.id
    }

    pub fn key(&self) -> ClientKey {
        self.key
    }

    /// Queues a frame for this client without waiting.
    pub fn offer(&self, frame: Arc<ChatFrame>) -> Result<(), TrySendError<Arc<ChatFrame>>> {
        self.mailbox.try_send(frame)
    }

    fn retire(&self) {
        self.cancel.cancel();
    }
}

type ClientMap = HashMap<ClientId, ClientEntry>;

/// A point-in-time view of the registry. Stays valid after the registry moves on.
#[derive(Debug, Clone)]
pub struct Snapshot(Arc<ClientMap>);

impl Snapshot {
    pub fn iter(&self) -> impl Iterator<Item = &ClientEntry> + '_ {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.0.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.0.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Thread-safe set of live clients.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<Arc<ClientMap>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a fresh id. Ids are never reused within a process.
    pub fn next_id(&self) -> ClientId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // Writers never leave the map half-updated, so a poisoned lock still
    // guards a consistent map.
    fn lock(&self) -> MutexGuard<'_, Arc<ClientMap>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a client. It is part of every snapshot taken after this returns.
    ///
    /// Registering an id that is already present replaces the old entry and
    /// stops its worker.
    pub fn register(&self, entry: ClientEntry) {
        let id = entry.key.id;
        let replaced = {
            let mut clients = self.lock();
            Arc::make_mut(&mut clients).insert(id, entry)
        };
        if let Some(old) = replaced {
            log::warn!("Client {} registered twice; previous entry retired", id);
            old.retire();
        }
        log::debug!("Client {} registered", id);
    }

    /// Removes a client if present and stops its worker.
    ///
    /// Returns `true` only for the call that actually removed it, so racing
    /// callers can tell who owns the follow-up (logging, counters).
    pub fn deregister(&self, id: ClientId) -> bool {
        let removed = {
            let mut clients = self.lock();
            if !clients.contains_key(&id) {
                return false;
            }
            Arc::make_mut(&mut clients).remove(&id)
        };
        Self::retire_removed(removed)
    }

    /// Like `deregister`, but only if `key` is still the live registration of
    /// its id. A stale key (its entry was replaced) removes nothing.
    pub fn deregister_entry(&self, key: ClientKey) -> bool {
        let removed = {
            let mut clients = self.lock();
            match clients.get(&key.id) {
                Some(current) if current.key == key => {}
                _ => return false,
            }
            Arc::make_mut(&mut clients).remove(&key.id)
        };
        Self::retire_removed(removed)
    }

    fn retire_removed(removed: Option<ClientEntry>) -> bool {
        match removed {
            Some(entry) => {
                entry.retire();
                log::debug!("Client {} deregistered", entry.key.id);
                true
            }
            None => false,
        }
    }

    /// Returns the current client set. Cheap: clones one `Arc`.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(Arc::clone(&self.lock()))
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
