//! Reconciliation planning.
//!
//! [`compute_plan`] is a pure function from (desired snapshot, current pool)
//! to one action per server name. It does no I/O and never blocks, so the
//! supervisor can call it under its membership lock.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use upmux_core::{ConfigSnapshot, ReconcileCounts, ServerConfig};

/// What the supervisor does for one server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Already matches the desired state.
    None,
    /// Start an actor and connect it.
    Connect,
    /// Hand the running actor its new config.
    Reconnect,
    /// Stop the actor; the server stays listed as disabled.
    Disconnect,
    /// Stop the actor (if any) and drop the server entirely.
    Remove,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Connect => "connect",
            Self::Reconnect => "reconnect",
            Self::Disconnect => "disconnect",
            Self::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// One entry of a plan.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub server: String,
    pub kind: ActionKind,
    /// Desired config; `None` only for `Remove`.
    pub config: Option<Arc<ServerConfig>>,
}

/// What the supervisor currently knows about one server.
#[derive(Debug, Clone)]
pub struct CurrentServer {
    pub config: Arc<ServerConfig>,
    pub has_actor: bool,
}

/// The outcome of one reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub version: u64,
    /// The snapshot was older than one already applied and was ignored.
    pub stale: bool,
    pub actions: Vec<PlannedAction>,
}

impl ReconcilePlan {
    pub(crate) fn stale(version: u64) -> Self {
        Self {
            version,
            stale: true,
            actions: Vec::new(),
        }
    }

    pub fn counts(&self) -> ReconcileCounts {
        let mut counts = ReconcileCounts::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::None => counts.unchanged += 1,
                ActionKind::Connect => counts.connect += 1,
                ActionKind::Reconnect => counts.reconnect += 1,
                ActionKind::Disconnect => counts.disconnect += 1,
                ActionKind::Remove => counts.remove += 1,
            }
        }
        counts
    }

    /// The action planned for `server`, if the plan mentions it.
    pub fn action_for(&self, server: &str) -> Option<ActionKind> {
        self.actions
            .iter()
            .find(|a| a.server == server)
            .map(|a| a.kind)
    }

    /// Actions that do something.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedAction> {
        self.actions.iter().filter(|a| a.kind != ActionKind::None)
    }
}

/// Decide one action per server name in `desired ∪ current`.
///
/// Desired servers come first in snapshot order, then removals sorted by
/// name.
pub fn compute_plan(
    desired: &ConfigSnapshot,
    current: &HashMap<String, CurrentServer>,
) -> ReconcilePlan {
    let mut actions = Vec::with_capacity(desired.len() + current.len());

    for config in desired.servers() {
        let kind = match (current.get(&config.name), config.enabled) {
            (None, true) => ActionKind::Connect,
            (Some(cur), true) if !cur.has_actor => ActionKind::Connect,
            (Some(cur), true) if cur.config.differs_from(config) => ActionKind::Reconnect,
            (Some(cur), false) if cur.has_actor => ActionKind::Disconnect,
            _ => ActionKind::None,
        };
        actions.push(PlannedAction {
            server: config.name.clone(),
            kind,
            config: Some(Arc::clone(config)),
        });
    }

    let removed: BTreeSet<&String> = current
        .keys()
        .filter(|name| desired.server(name).is_none())
        .collect();
    for name in removed {
        actions.push(PlannedAction {
            server: name.clone(),
            kind: ActionKind::Remove,
            config: None,
        });
    }

    ReconcilePlan {
        version: desired.version(),
        stale: false,
        actions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current(configs: &[(ServerConfig, bool)]) -> HashMap<String, CurrentServer> {
        configs
            .iter()
            .map(|(config, has_actor)| {
                (
                    config.name.clone(),
                    CurrentServer {
                        config: Arc::new(config.clone()),
                        has_actor: *has_actor,
                    },
                )
            })
            .collect()
    }

    fn disabled(mut config: ServerConfig) -> ServerConfig {
        config.enabled = false;
        config
    }

    #[test]
    fn test_new_enabled_server_connects() {
        let snap = ConfigSnapshot::from_servers(1, vec![ServerConfig::remote("svc-a", "http://x")]);
        let plan = compute_plan(&snap, &HashMap::new());
        assert_eq!(plan.action_for("svc-a"), Some(ActionKind::Connect));
        assert_eq!(plan.counts().connect, 1);
    }

    #[test]
    fn test_unchanged_server_is_none() {
        let cfg = ServerConfig::remote("svc-a", "http://x");
        let snap = ConfigSnapshot::from_servers(2, vec![cfg.clone()]);
        let plan = compute_plan(&snap, &current(&[(cfg, true)]));
        assert_eq!(plan.action_for("svc-a"), Some(ActionKind::None));
        assert_eq!(plan.counts().changed(), 0);
    }

    #[test]
    fn test_changed_config_reconnects() {
        let old = ServerConfig::remote("svc-a", "http://x");
        let new = ServerConfig::remote("svc-a", "http://y");
        let snap = ConfigSnapshot::from_servers(2, vec![new]);
        let plan = compute_plan(&snap, &current(&[(old, true)]));
        assert_eq!(plan.action_for("svc-a"), Some(ActionKind::Reconnect));
    }

    #[test]
    fn test_disable_and_remove() {
        let a = ServerConfig::remote("svc-a", "http://a");
        let b = ServerConfig::remote("svc-b", "http://b");
        let snap = ConfigSnapshot::from_servers(3, vec![disabled(a.clone())]);
        let plan = compute_plan(&snap, &current(&[(a, true), (b, true)]));
        assert_eq!(plan.action_for("svc-a"), Some(ActionKind::Disconnect));
        assert_eq!(plan.action_for("svc-b"), Some(ActionKind::Remove));
        let counts = plan.counts();
        assert_eq!((counts.disconnect, counts.remove), (1, 1));
    }

    #[test]
    fn test_disabled_without_actor_stays_none() {
        let a = disabled(ServerConfig::remote("svc-a", "http://a"));
        let snap = ConfigSnapshot::from_servers(1, vec![a.clone()]);
        assert_eq!(
            compute_plan(&snap, &HashMap::new()).action_for("svc-a"),
            Some(ActionKind::None)
        );
        assert_eq!(
            compute_plan(&snap, &current(&[(a, false)])).action_for("svc-a"),
            Some(ActionKind::None)
        );
    }

    #[test]
    fn test_reenabled_server_connects() {
        let a = ServerConfig::remote("svc-a", "http://a");
        let snap = ConfigSnapshot::from_servers(4, vec![a.clone()]);
        let plan = compute_plan(&snap, &current(&[(disabled(a), false)]));
        assert_eq!(plan.action_for("svc-a"), Some(ActionKind::Connect));
    }

    #[test]
    fn test_removals_sorted_after_desired() {
        let snap = ConfigSnapshot::from_servers(5, vec![ServerConfig::remote("m", "http://m")]);
        let cur = current(&[
            (ServerConfig::remote("z", "http://z"), true),
            (ServerConfig::remote("b", "http://b"), false),
        ]);
        let plan = compute_plan(&snap, &cur);
        let order: Vec<&str> = plan.actions.iter().map(|a| a.server.as_str()).collect();
        assert_eq!(order, vec!["m", "b", "z"]);
    }
}
