//! Lock-free, copy-on-write view of every upstream's status.
//!
//! Readers load an `Arc<StateSnapshot>` without taking any lock and keep a
//! consistent picture for as long as they hold it. Writers build a new map
//! and swap it in; concurrent writers are serialized by `ArcSwap::rcu`.
//!
//! Each entry records the epoch of the actor that last wrote it. An actor
//! that has been retired (and so holds an older epoch) can no longer
//! overwrite an entry claimed by its successor.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use upmux_core::{ConnectionStatus, ServerStatus};

/// An immutable point-in-time view of all servers.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    generation: u64,
    servers: HashMap<String, Arc<ServerStatus>>,
    owners: HashMap<String, u64>,
}

impl StateSnapshot {
    /// Monotonically increasing; bumped by every successful write.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn server(&self, name: &str) -> Option<&Arc<ServerStatus>> {
        self.servers.get(name)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Arc<ServerStatus>> {
        self.servers.values()
    }

    /// Server names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.servers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn count_by_state(&self, status: ConnectionStatus) -> usize {
        self.servers
            .values()
            .filter(|s| s.status() == status)
            .count()
    }

    pub fn count_connected(&self) -> usize {
        self.count_by_state(ConnectionStatus::Ready)
    }

    fn with_entry(&self, status: ServerStatus, owner: Option<u64>) -> Self {
        let mut next = self.clone();
        next.generation += 1;
        if let Some(epoch) = owner {
            next.owners.insert(status.name.clone(), epoch);
        }
        next.servers.insert(status.name.clone(), Arc::new(status));
        next
    }

    fn without_entry(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.generation += 1;
        next.servers.remove(name);
        next.owners.remove(name);
        next
    }

    fn owned_by_newer(&self, name: &str, epoch: u64) -> bool {
        self.owners.get(name).is_some_and(|owner| *owner > epoch)
    }
}

/// The shared state view.
#[derive(Debug, Default)]
pub struct StateView {
    inner: ArcSwap<StateSnapshot>,
}

impl StateView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a server's status unconditionally.
    pub fn publish(&self, status: ServerStatus) {
        self.inner
            .rcu(|current| current.with_entry(status.clone(), None));
    }

    /// Publish on behalf of the actor holding `epoch`.
    ///
    /// Returns `false` (and writes nothing) when a newer epoch already owns
    /// the entry.
    pub fn publish_as(&self, epoch: u64, status: ServerStatus) -> bool {
        let mut accepted = false;
        self.inner.rcu(|current| {
            if current.owned_by_newer(&status.name, epoch) {
                accepted = false;
                Arc::clone(current)
            } else {
                accepted = true;
                Arc::new(current.with_entry(status.clone(), Some(epoch)))
            }
        });
        accepted
    }

    /// Apply `f` to a copy of an existing entry and publish the result.
    ///
    /// Returns `false` if the server has no entry.
    pub fn update<F>(&self, name: &str, f: F) -> bool
    where
        F: Fn(&mut ServerStatus),
    {
        let mut found = false;
        self.inner.rcu(|current| match current.servers.get(name) {
            Some(existing) => {
                found = true;
                let mut status = (**existing).clone();
                f(&mut status);
                status.name = name.to_string();
                status.updated_at = chrono::Utc::now();
                Arc::new(current.with_entry(status, None))
            }
            None => {
                found = false;
                Arc::clone(current)
            }
        });
        found
    }

    /// Drop a server's entry. No-op if absent.
    pub fn remove(&self, name: &str) {
        self.inner.rcu(|current| {
            if current.servers.contains_key(name) {
                Arc::new(current.without_entry(name))
            } else {
                Arc::clone(current)
            }
        });
    }

    /// Drop the entry only if it is not owned by an epoch newer than `epoch`.
    pub fn remove_as(&self, epoch: u64, name: &str) -> bool {
        let mut removed = false;
        self.inner.rcu(|current| {
            if current.servers.contains_key(name) && !current.owned_by_newer(name, epoch) {
                removed = true;
                Arc::new(current.without_entry(name))
            } else {
                removed = false;
                Arc::clone(current)
            }
        });
        removed
    }

    /// Lock-free load of the current snapshot.
    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.inner.load_full()
    }

    pub fn server(&self, name: &str) -> Option<Arc<ServerStatus>> {
        self.inner.load().server(name).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.load().len()
    }

    pub fn count_by_state(&self, status: ConnectionStatus) -> usize {
        self.inner.load().count_by_state(status)
    }

    pub fn count_connected(&self) -> usize {
        self.inner.load().count_connected()
    }

    pub fn generation(&self) -> u64 {
        self.inner.load().generation()
    }
}
