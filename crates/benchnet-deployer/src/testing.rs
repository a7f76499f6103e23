//! In-memory doubles for the external services the orchestrator drives.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;

use crate::backend::{BackendError, DeploymentBackend, InstanceSpec, InstanceState, Protocol};
use crate::machine::{
    ClusterClient, ClusterError, GroupVersionResource, HostRequest, HostStatus, ProvisionError,
    ProvisionedHost, Provisioner,
};
use crate::rpc::{BlockSummary, NodeRpc, NodeStatus, RpcConnector, RpcError};

/// Ordered record of every call made against the doubles that share it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

// Provisioning

#[derive(Default)]
struct ProvisionerState {
    active_after: Option<u32>,
    status_calls: u32,
    polls: HashMap<String, u32>,
    requests: Vec<HostRequest>,
    fail_deletes: bool,
}

#[derive(Clone)]
pub(crate) struct MockProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
    journal: Journal,
}

impl MockProvisioner {
    /// Every host reports active on its `polls`-th status query.
    pub fn active_after(polls: u32, journal: Journal) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProvisionerState {
                active_after: Some(polls),
                ..Default::default()
            })),
            journal,
        }
    }

    pub fn never_active(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn requests(&self) -> Vec<HostRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn status_calls(&self) -> u32 {
        self.state.lock().unwrap().status_calls
    }

    pub fn fail_deletes(&self) {
        self.state.lock().unwrap().fail_deletes = true;
    }
}

impl Provisioner for MockProvisioner {
    async fn provision(&self, request: HostRequest) -> Result<ProvisionedHost, ProvisionError> {
        self.journal.record(format!("provision {}", request.name));
        let mut state = self.state.lock().unwrap();
        state.requests.push(request);
        Ok(ProvisionedHost {
            id: format!("host-{}", state.requests.len()),
            ip: None,
            status: HostStatus::Provisioning,
        })
    }

    async fn status(&self, id: &str) -> Result<ProvisionedHost, ProvisionError> {
        self.journal.record(format!("status {id}"));
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        let active_after = state.active_after;
        let polls = state.polls.entry(id.to_string()).or_default();
        *polls += 1;
        let index = id.trim_start_matches("host-");
        Ok(ProvisionedHost {
            id: id.to_string(),
            ip: Some(format!("10.0.0.{index}")),
            status: match active_after {
                Some(n) if *polls >= n => HostStatus::Active,
                _ => HostStatus::Provisioning,
            },
        })
    }

    async fn delete(&self, id: &str) -> Result<(), ProvisionError> {
        self.journal.record(format!("delete host {id}"));
        if self.state.lock().unwrap().fail_deletes {
            return Err(ProvisionError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

// Cluster

#[derive(Default)]
struct ClusterState {
    crds_installed: bool,
    nodes: Vec<(String, BTreeMap<String, String>)>,
    resources: BTreeMap<(GroupVersionResource, String), Value>,
}

#[derive(Clone)]
pub(crate) struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
    journal: Journal,
}

impl MockCluster {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn install_crds(&self) {
        self.state.lock().unwrap().crds_installed = true;
    }

    pub fn add_node<'a>(&self, name: &str, labels: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let labels = labels
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.state
            .lock()
            .unwrap()
            .nodes
            .push((name.to_string(), labels));
    }

    pub fn nodes(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.nodes.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn resources(&self) -> BTreeMap<(GroupVersionResource, String), Value> {
        self.state.lock().unwrap().resources.clone()
    }
}

impl ClusterClient for MockCluster {
    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<String>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .filter(|(_, labels)| selector.iter().all(|(k, v)| labels.get(k) == Some(v)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn delete_node(&self, name: &str) -> Result<(), ClusterError> {
        self.journal.record(format!("delete node {name}"));
        let mut state = self.state.lock().unwrap();
        let before = state.nodes.len();
        state.nodes.retain(|(n, _)| n != name);
        if state.nodes.len() == before {
            return Err(ClusterError::NotFound {
                kind: "node".to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn custom_resource_exists(&self, _gvr: &GroupVersionResource) -> Result<bool, ClusterError> {
        Ok(self.state.lock().unwrap().crds_installed)
    }

    async fn create_custom_resource(
        &self,
        gvr: &GroupVersionResource,
        _namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<(), ClusterError> {
        self.journal.record(format!("create {}/{name}", gvr.resource));
        self.state
            .lock()
            .unwrap()
            .resources
            .insert((*gvr, name.to_string()), object);
        Ok(())
    }

    async fn delete_custom_resource(
        &self,
        gvr: &GroupVersionResource,
        _namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.journal.record(format!("delete {}/{name}", gvr.resource));
        self.state
            .lock()
            .unwrap()
            .resources
            .remove(&(*gvr, name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: gvr.resource.to_string(),
                name: name.to_string(),
            })
    }
}

// Deployment

#[derive(Debug, Clone)]
pub(crate) struct MockInstance {
    pub spec: InstanceSpec,
    pub state: InstanceState,
    pub files: BTreeMap<String, Bytes>,
}

#[derive(Default)]
struct BackendState {
    instances: Vec<MockInstance>,
    failures: HashSet<(String, &'static str)>,
}

/// Deployment backend that tracks instance state in memory.
///
/// Remote addresses are `203.0.113.<index + 1>:<port>` and only resolve while started.
#[derive(Clone)]
pub(crate) struct MockBackend {
    state: Arc<Mutex<BackendState>>,
    journal: Journal,
}

impl MockBackend {
    pub fn new(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    /// Make `operation` (`write`, `read`, `start`, `stop`, `destroy` or `resolve`) fail for
    /// `name`.
    pub fn fail(&self, name: &str, operation: &'static str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((name.to_string(), operation));
    }

    /// Undo [`fail`](Self::fail).
    pub fn recover(&self, name: &str, operation: &'static str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .remove(&(name.to_string(), operation));
    }

    /// Place a file in an instance as if the instance had written it.
    pub fn put_file(&self, name: &str, path: &str, contents: impl Into<Bytes>) {
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.spec.name == name)
            .unwrap();
        instance.files.insert(path.to_string(), contents.into());
    }

    pub fn instance(&self, handle: &usize) -> MockInstance {
        self.state.lock().unwrap().instances[*handle].clone()
    }

    pub fn instance_named(&self, name: &str) -> Option<MockInstance> {
        let state = self.state.lock().unwrap();
        state.instances.iter().find(|i| i.spec.name == name).cloned()
    }

    pub fn file(&self, name: &str, path: &str) -> Option<Bytes> {
        self.instance_named(name)?.files.get(path).cloned()
    }

    fn apply(
        &self,
        handle: usize,
        operation: &'static str,
        f: impl FnOnce(&mut MockInstance) -> Result<(), BackendError>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        let name = state.instances[handle].spec.name.clone();
        self.journal.record(format!("{operation} {name}"));
        if state.failures.contains(&(name.clone(), operation)) {
            return Err(BackendError::Io {
                name,
                operation,
                path: None,
                source: std::io::Error::other("injected failure"),
            });
        }
        f(&mut state.instances[handle])
    }
}

fn invalid(instance: &MockInstance, operation: &'static str) -> BackendError {
    BackendError::InvalidState {
        name: instance.spec.name.clone(),
        state: instance.state,
        operation,
    }
}

impl DeploymentBackend for MockBackend {
    type Handle = usize;

    async fn create(&self, spec: InstanceSpec) -> Result<usize, BackendError> {
        self.journal.record(format!("create {}", spec.name));
        let mut state = self.state.lock().unwrap();
        if state.instances.iter().any(|i| i.spec.name == spec.name) {
            return Err(BackendError::DuplicateInstance(spec.name));
        }
        state.instances.push(MockInstance {
            spec,
            state: InstanceState::Created,
            files: BTreeMap::new(),
        });
        Ok(state.instances.len() - 1)
    }

    async fn write_file(&self, handle: &usize, path: &str, contents: Bytes) -> Result<(), BackendError> {
        self.apply(*handle, "write", |instance| {
            instance.files.insert(path.to_string(), contents);
            Ok(())
        })
    }

    async fn read_file(&self, handle: &usize, path: &str) -> Result<Bytes, BackendError> {
        let mut contents = None;
        self.apply(*handle, "read", |instance| {
            contents = instance.files.get(path).cloned();
            Ok(())
        })?;
        contents.ok_or_else(|| BackendError::Io {
            name: self.instance(handle).spec.name,
            operation: "read",
            path: Some(path.into()),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }

    async fn start(&self, handle: &usize) -> Result<(), BackendError> {
        self.apply(*handle, "start", |instance| match instance.state {
            InstanceState::Created | InstanceState::Stopped => {
                instance.state = InstanceState::Started;
                Ok(())
            }
            _ => Err(invalid(instance, "start")),
        })
    }

    async fn stop(&self, handle: &usize) -> Result<(), BackendError> {
        self.apply(*handle, "stop", |instance| match instance.state {
            InstanceState::Started => {
                instance.state = InstanceState::Stopped;
                Ok(())
            }
            _ => Err(invalid(instance, "stop")),
        })
    }

    async fn destroy(&self, handle: &usize) -> Result<(), BackendError> {
        self.apply(*handle, "destroy", |instance| {
            instance.state = InstanceState::Destroyed;
            Ok(())
        })
    }

    async fn is_in_state(&self, handle: &usize, state: InstanceState) -> bool {
        self.state.lock().unwrap().instances[*handle].state == state
    }

    fn internal_address(&self, handle: &usize, protocol: Protocol) -> Result<String, BackendError> {
        let state = self.state.lock().unwrap();
        let instance = &state.instances[*handle];
        Ok(format!("{}:{}", instance.spec.name, protocol.default_port()))
    }

    async fn resolve_address(&self, handle: &usize, protocol: Protocol) -> Result<String, BackendError> {
        let state = self.state.lock().unwrap();
        let instance = &state.instances[*handle];
        let injected = state
            .failures
            .contains(&(instance.spec.name.clone(), "resolve"));
        if injected || instance.state != InstanceState::Started {
            return Err(BackendError::Unreachable {
                name: instance.spec.name.clone(),
                protocol,
                reason: format!("instance is {:?}", instance.state),
            });
        }
        Ok(format!("203.0.113.{}:{}", handle + 1, protocol.default_port()))
    }
}

// RPC

#[derive(Debug, Clone)]
pub(crate) struct MockChain {
    /// Status query on which the node first reports a non-zero height.
    pub ready_after: Option<u32>,
    pub status_calls: u32,
    pub earliest_height: u64,
    pub blocks: BTreeMap<u64, BlockSummary>,
    pub fail_blocks: bool,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            ready_after: Some(1),
            status_calls: 0,
            earliest_height: 1,
            blocks: BTreeMap::new(),
            fail_blocks: false,
        }
    }
}

/// Connector handing out scripted nodes keyed by address.
#[derive(Clone, Default)]
pub(crate) struct MockRpcConnector {
    chains: Arc<Mutex<HashMap<String, Arc<Mutex<MockChain>>>>>,
}

impl MockRpcConnector {
    fn chain(&self, address: &str) -> Arc<Mutex<MockChain>> {
        self.chains
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    pub fn script(&self, address: &str, f: impl FnOnce(&mut MockChain)) {
        f(&mut self.chain(address).lock().unwrap());
    }

    pub fn status_calls(&self, address: &str) -> u32 {
        self.chain(address).lock().unwrap().status_calls
    }
}

pub(crate) struct MockRpc {
    address: String,
    chain: Arc<Mutex<MockChain>>,
}

impl RpcConnector for MockRpcConnector {
    type Client = MockRpc;

    fn connect(&self, address: &str) -> Result<MockRpc, RpcError> {
        Ok(MockRpc {
            address: address.to_string(),
            chain: self.chain(address),
        })
    }
}

impl NodeRpc for MockRpc {
    fn address(&self) -> &str {
        &self.address
    }

    async fn status(&self) -> Result<NodeStatus, RpcError> {
        let mut chain = self.chain.lock().unwrap();
        chain.status_calls += 1;
        let ready = chain.ready_after.is_some_and(|n| chain.status_calls >= n);
        let tip = chain.blocks.keys().next_back().copied().unwrap_or(1);
        Ok(NodeStatus {
            latest_block_height: if ready { tip } else { 0 },
            earliest_block_height: chain.earliest_height,
            syncing: false,
        })
    }

    async fn block(&self, height: u64) -> Result<BlockSummary, RpcError> {
        let chain = self.chain.lock().unwrap();
        if chain.fail_blocks {
            return Err(RpcError::Unavailable {
                address: self.address.clone(),
                reason: "injected failure".to_string(),
            });
        }
        chain
            .blocks
            .get(&height)
            .copied()
            .ok_or_else(|| RpcError::Unavailable {
                address: self.address.clone(),
                reason: format!("no block at height {height}"),
            })
    }
}
