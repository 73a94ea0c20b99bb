//! Hand-written port mocks shared by the runtime integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use upmux_core::{
    ConnectionStatus, ContainerLabels, ContainerState, DockerIsolationDefaults, LabelSelector,
    LaunchSpec, ManagedContainer, ResourceError, Sandbox, ServerConfig, ServerStatus, Session,
    ToolInfo, Transport, TransportError, TransportFactory, TransportKind,
};
use upmux_runtime::StateView;

/// How the mock transport answers a connect for one server.
#[derive(Debug, Clone)]
pub enum Behavior {
    Tools(usize),
    Fail(String),
    Unauthorized,
    Hang,
    Panic,
}

#[derive(Default)]
pub struct MockTransport {
    behaviors: Mutex<HashMap<String, Behavior>>,
    connects: Mutex<HashMap<String, usize>>,
    sessions: Mutex<HashMap<String, Vec<Arc<AtomicBool>>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, server: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(server.to_string(), behavior);
    }

    pub fn connects(&self, server: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .get(server)
            .copied()
            .unwrap_or(0)
    }

    /// Mark every open session for `server` as dead, as if the upstream exited.
    pub fn kill_sessions(&self, server: &str) {
        if let Some(sessions) = self.sessions.lock().unwrap().get(server) {
            for alive in sessions {
                alive.store(false, Ordering::SeqCst);
            }
        }
    }
}

struct MockSession {
    tools: usize,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Session for MockSession {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok((0..self.tools)
            .map(|i| ToolInfo::named(format!("tool-{i}")))
            .collect())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Session>, TransportError> {
        *self
            .connects
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_default() += 1;
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&config.name)
            .cloned()
            .unwrap_or(Behavior::Tools(2));

        match behavior {
            Behavior::Tools(tools) => {
                let alive = Arc::new(AtomicBool::new(true));
                self.sessions
                    .lock()
                    .unwrap()
                    .entry(config.name.clone())
                    .or_default()
                    .push(Arc::clone(&alive));
                Ok(Box::new(MockSession { tools, alive }))
            }
            Behavior::Fail(message) => Err(TransportError::Network(message)),
            Behavior::Unauthorized => Err(TransportError::Unauthorized {
                resource_metadata: None,
            }),
            Behavior::Hang => std::future::pending().await,
            Behavior::Panic => panic!("transport exploded"),
        }
    }
}

pub struct MockFactory(pub Arc<MockTransport>);

impl TransportFactory for MockFactory {
    fn transport_for(&self, _kind: TransportKind) -> Arc<dyn Transport> {
        Arc::clone(&self.0) as Arc<dyn Transport>
    }
}

/// In-memory container runtime. `stop` hangs for servers marked stuck;
/// label sweeps always succeed.
pub struct MockSandbox {
    instance: String,
    containers: Mutex<HashMap<String, ContainerLabels>>,
    stuck: Mutex<HashSet<String>>,
    created: AtomicUsize,
}

impl MockSandbox {
    pub fn new(instance: &str) -> Arc<Self> {
        Arc::new(Self {
            instance: instance.to_string(),
            containers: Mutex::new(HashMap::new()),
            stuck: Mutex::new(HashSet::new()),
            created: AtomicUsize::new(0),
        })
    }

    pub fn hang_stop_for(&self, server: &str) {
        self.stuck.lock().unwrap().insert(server.to_string());
    }

    pub fn running(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Drop `server`'s containers behind the actor's back.
    pub fn evict(&self, server: &str) {
        self.containers
            .lock()
            .unwrap()
            .retain(|_, labels| labels.server_name != server);
    }

    fn matching(&self, selector: &LabelSelector) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, labels)| selector.matches(labels))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn instance_id(&self) -> &str {
        &self.instance
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn create_labeled(
        &self,
        server: &ServerConfig,
        _defaults: &DockerIsolationDefaults,
    ) -> Result<ManagedContainer, ResourceError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let container_name = format!("upmux-{}-{n}", server.name);
        let labels = ContainerLabels::new(&self.instance, &server.name);
        self.containers
            .lock()
            .unwrap()
            .insert(container_name.clone(), labels.clone());
        Ok(ManagedContainer {
            server_name: server.name.clone(),
            container_name: container_name.clone(),
            cid_file: PathBuf::from(format!("/tmp/{container_name}.cid")),
            container_id: None,
            labels,
            launch: LaunchSpec {
                program: "docker".to_string(),
                args: vec!["run".to_string(), container_name],
            },
        })
    }

    async fn inspect(&self, container: &ManagedContainer) -> Result<ContainerState, ResourceError> {
        let present = self
            .containers
            .lock()
            .unwrap()
            .contains_key(&container.container_name);
        Ok(if present {
            ContainerState::Running
        } else {
            ContainerState::Missing
        })
    }

    async fn stop(&self, container: &ManagedContainer) -> Result<(), ResourceError> {
        let stuck = self.stuck.lock().unwrap().contains(&container.server_name);
        if stuck {
            std::future::pending::<()>().await;
        }
        self.containers
            .lock()
            .unwrap()
            .remove(&container.container_name);
        Ok(())
    }

    async fn list_by_label(&self, selector: &LabelSelector) -> Result<Vec<String>, ResourceError> {
        Ok(self.matching(selector))
    }

    async fn stop_by_label(&self, selector: &LabelSelector) -> Result<Vec<String>, ResourceError> {
        let names = self.matching(selector);
        let mut containers = self.containers.lock().unwrap();
        for name in &names {
            containers.remove(name);
        }
        Ok(names)
    }
}

/// Poll the state view until `pred` holds for `server`.
pub async fn wait_for_state<F>(state: &StateView, server: &str, pred: F) -> ServerStatus
where
    F: Fn(&ServerStatus) -> bool,
{
    for _ in 0..2_000 {
        if let Some(status) = state.server(server)
            && pred(status.as_ref())
        {
            return (*status).clone();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "server {server} never reached the expected state, last: {:?}",
        state.server(server)
    );
}

pub async fn wait_for_status(state: &StateView, server: &str, status: ConnectionStatus) -> ServerStatus {
    wait_for_state(state, server, |s| s.status() == status).await
}
