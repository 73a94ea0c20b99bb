//! Actor pool membership.
//!
//! The mutex here guards only which actors exist. It is never held across
//! an await and never guards per-actor state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use upmux_core::ServerConfig;

use super::plan::CurrentServer;
use crate::actor::ActorHandle;

/// An actor that has been asked to stop but has not been finalized.
#[derive(Debug)]
pub struct Retiring {
    pub handle: Arc<ActorHandle>,
    /// Flips to `true` once teardown and state cleanup are done.
    pub finished: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
pub struct PoolState {
    /// Highest snapshot version applied.
    pub version: Option<u64>,
    /// Last applied config per server, enabled or not.
    pub configs: HashMap<String, Arc<ServerConfig>>,
    /// Live actors by server name.
    pub actors: HashMap<String, Arc<ActorHandle>>,
    /// Stopping actors by epoch.
    pub retiring: HashMap<u64, Retiring>,
    pub shutting_down: bool,
}

impl PoolState {
    /// The pool as seen by the planner.
    pub fn current(&self) -> HashMap<String, CurrentServer> {
        self.configs
            .iter()
            .map(|(name, config)| {
                (
                    name.clone(),
                    CurrentServer {
                        config: Arc::clone(config),
                        has_actor: self.actors.contains_key(name),
                    },
                )
            })
            .collect()
    }

    /// Completion signals of every retiring actor for `server`.
    pub fn predecessors(&self, server: &str) -> Vec<watch::Receiver<bool>> {
        self.retiring
            .values()
            .filter(|r| r.handle.name() == server)
            .map(|r| r.finished.clone())
            .collect()
    }

    /// Move the live actor for `server` into the retiring set.
    pub fn retire(&mut self, server: &str) -> Option<(Arc<ActorHandle>, watch::Sender<bool>)> {
        let handle = self.actors.remove(server)?;
        let (finished_tx, finished) = watch::channel(false);
        self.retiring.insert(
            handle.epoch(),
            Retiring {
                handle: Arc::clone(&handle),
                finished,
            },
        );
        Some((handle, finished_tx))
    }

    /// Every handle, live or retiring.
    pub fn all_handles(&self) -> Vec<Arc<ActorHandle>> {
        self.actors
            .values()
            .chain(self.retiring.values().map(|r| &r.handle))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ActorPool {
    state: Mutex<PoolState>,
}

impl ActorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get(&self, server: &str) -> Option<Arc<ActorHandle>> {
        self.lock().actors.get(server).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().actors.len()
    }
}
