//! Dedicated hosts obtained from an external provisioning service.
//!
//! A [`Machine`] wraps one provisioned host together with the cluster-side objects that make it
//! schedulable: the cluster node it registers as, and the MetalLB address pool and L2
//! advertisement that announce its IP. Unlike network teardown, removing a machine is strict:
//! the host is a billed resource, so every failure is returned immediately.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::poll::{PollError, PollPolicy, poll_until};

/// Namespace MetalLB objects live in.
pub const METALLB_NAMESPACE: &str = "metallb-system";

/// Label every cluster node carries with its host name.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Identifies a kind of custom resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersionResource {
    pub group: &'static str,
    pub version: &'static str,
    pub resource: &'static str,
}

impl GroupVersionResource {
    pub const IP_ADDRESS_POOL: Self = Self {
        group: "metallb.io",
        version: "v1beta1",
        resource: "ipaddresspools",
    };

    pub const L2_ADVERTISEMENT: Self = Self {
        group: "metallb.io",
        version: "v1beta1",
        resource: "l2advertisements",
    };
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

/// What to ask the provisioning service for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub name: String,
    pub region: String,
    /// Size class (plan) of the host.
    pub size: String,
    pub os: String,
    /// Cloud-init lines. `%KEY%` placeholders are replaced from `substitutions`.
    pub user_data: Vec<String>,
    pub substitutions: BTreeMap<String, String>,
}

impl MachineSpec {
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        size: impl Into<String>,
        os: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            size: size.into(),
            os: os.into(),
            user_data: Vec::new(),
            substitutions: BTreeMap::new(),
        }
    }

    pub fn with_user_data<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_data.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn with_substitution(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.substitutions.insert(key.into(), value.into());
        self
    }

    /// The user data script with every known placeholder substituted.
    pub fn render_user_data(&self) -> String {
        let mut rendered = self.user_data.join("\n");
        for (key, value) in &self.substitutions {
            rendered = rendered.replace(&format!("%{key}%"), value);
        }
        rendered
    }

    fn request(&self) -> HostRequest {
        HostRequest {
            name: self.name.clone(),
            os: self.os.clone(),
            plan: self.size.clone(),
            region: self.region.clone(),
            user_data: self.render_user_data(),
        }
    }
}

/// A request sent to the [`Provisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequest {
    pub name: String,
    pub os: String,
    pub plan: String,
    pub region: String,
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    Provisioning,
    Active,
    Other(String),
}

/// A host as reported by the provisioning service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedHost {
    pub id: String,
    pub ip: Option<String>,
    pub status: HostStatus,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("provisioning request rejected: {0}")]
    Rejected(String),
    #[error("provisioning service unavailable: {0}")]
    Unavailable(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("cluster API error: {0}")]
    Api(String),
}

/// External service that creates, reports on and deletes hosts.
pub trait Provisioner: Send + Sync {
    fn provision(
        &self,
        request: HostRequest,
    ) -> impl Future<Output = Result<ProvisionedHost, ProvisionError>> + Send;

    fn status(&self, id: &str)
    -> impl Future<Output = Result<ProvisionedHost, ProvisionError>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), ProvisionError>> + Send;
}

/// The subset of the cluster API a machine needs.
pub trait ClusterClient: Send + Sync {
    /// Names of the cluster nodes matching every label in `selector`.
    fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<String>, ClusterError>> + Send;

    fn delete_node(&self, name: &str) -> impl Future<Output = Result<(), ClusterError>> + Send;

    fn custom_resource_exists(
        &self,
        gvr: &GroupVersionResource,
    ) -> impl Future<Output = Result<bool, ClusterError>> + Send;

    fn create_custom_resource(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    fn delete_custom_resource(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;
}

#[derive(thiserror::Error, Debug)]
pub enum MachineError {
    #[error("failed to provision machine {name}")]
    Provision {
        name: String,
        #[source]
        source: ProvisionError,
    },
    #[error("cannot {operation} machine {name}: host is not provisioned")]
    NotProvisioned {
        name: String,
        operation: &'static str,
    },
    #[error("cannot {operation} machine {name}: it was removed")]
    Removed {
        name: String,
        operation: &'static str,
    },
    #[error("machine {name} has no IP address")]
    NoAddress { name: String },
    #[error("timed out waiting for machine {name} to become active")]
    Timeout {
        name: String,
        #[source]
        source: PollError<ProvisionError>,
    },
    #[error("failed to delete host {id} of machine {name}")]
    Delete {
        name: String,
        id: String,
        #[source]
        source: ProvisionError,
    },
    #[error("failed to {operation} for machine {name}")]
    Cluster {
        name: String,
        operation: String,
        #[source]
        source: ClusterError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Provisioning call accepted; the host is not confirmed yet.
    Polling,
    Active,
    TimedOut,
    Removed,
}

/// One provisioned host.
pub struct Machine<P, C> {
    spec: MachineSpec,
    provisioner: Arc<P>,
    cluster: Arc<C>,
    /// Provisioning id returned by the provision call.
    handle: Option<String>,
    /// Host record, populated once the host is reported active.
    host: Option<ProvisionedHost>,
    state: MachineState,
}

impl<P, C> fmt::Debug for Machine<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.spec.name)
            .field("region", &self.spec.region)
            .field("size", &self.spec.size)
            .field("handle", &self.handle)
            .field("host", &self.host)
            .field("state", &self.state)
            .finish()
    }
}

impl<P: Provisioner, C: ClusterClient> Machine<P, C> {
    /// Issue one provisioning call. The machine starts out polling.
    pub async fn provision(
        provisioner: Arc<P>,
        cluster: Arc<C>,
        spec: MachineSpec,
    ) -> Result<Self, MachineError> {
        let host = provisioner
            .provision(spec.request())
            .await
            .map_err(|source| MachineError::Provision {
                name: spec.name.clone(),
                source,
            })?;
        info!(machine = %spec.name, id = %host.id, region = %spec.region, size = %spec.size, "machine requested");
        Ok(Self {
            spec,
            provisioner,
            cluster,
            handle: Some(host.id),
            host: None,
            state: MachineState::Polling,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn host(&self) -> Option<&ProvisionedHost> {
        self.host.as_ref()
    }

    /// Labels that pin a workload onto this machine's cluster node.
    pub fn node_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(HOSTNAME_LABEL.to_string(), self.spec.name.clone())])
    }

    fn handle(&self, operation: &'static str) -> Result<&str, MachineError> {
        if self.state == MachineState::Removed {
            return Err(MachineError::Removed {
                name: self.spec.name.clone(),
                operation,
            });
        }
        self.handle
            .as_deref()
            .ok_or_else(|| MachineError::NotProvisioned {
                name: self.spec.name.clone(),
                operation,
            })
    }

    fn active_host(&self, operation: &'static str) -> Result<&ProvisionedHost, MachineError> {
        self.handle(operation)?;
        self.host
            .as_ref()
            .ok_or_else(|| MachineError::NotProvisioned {
                name: self.spec.name.clone(),
                operation,
            })
    }

    /// The public IP of the active host.
    pub fn ip(&self) -> Result<&str, MachineError> {
        self.active_host("read the address of")?
            .ip
            .as_deref()
            .ok_or_else(|| MachineError::NoAddress {
                name: self.spec.name.clone(),
            })
    }

    /// Poll the provisioning service until the host is active or the budget is exhausted.
    pub async fn wait_for_creation(&mut self, policy: &PollPolicy) -> Result<(), MachineError> {
        let id = self.handle("wait for")?.to_string();
        if self.state == MachineState::Active {
            return Ok(());
        }

        let provisioner = &*self.provisioner;
        let id = id.as_str();
        let description = format!("machine {} active", self.spec.name);
        let result = poll_until(policy, &description, move || async move {
            let host = provisioner.status(id).await?;
            Ok::<_, ProvisionError>((host.status == HostStatus::Active).then_some(host))
        })
        .await;

        match result {
            Ok(host) => {
                info!(machine = %self.spec.name, id = %host.id, ip = ?host.ip, "machine active");
                self.host = Some(host);
                self.state = MachineState::Active;
                Ok(())
            }
            Err(source) => {
                self.state = MachineState::TimedOut;
                Err(MachineError::Timeout {
                    name: self.spec.name.clone(),
                    source,
                })
            }
        }
    }

    /// Announce the host's IP through MetalLB, if MetalLB is installed.
    pub async fn setup_address_pools(&self) -> Result<(), MachineError> {
        let ip = self.ip()?;
        let name = self.name();

        let pool = json!({
            "metadata": { "name": name, "namespace": METALLB_NAMESPACE },
            "spec": { "addresses": [format!("{ip}-{ip}")] },
        });
        let advertisement = json!({
            "metadata": { "name": name, "namespace": METALLB_NAMESPACE },
            "spec": {
                "ipAddressPools": [name],
                "nodeSelectors": [{ "matchLabels": { HOSTNAME_LABEL: name } }],
            },
        });

        for (gvr, object) in [
            (GroupVersionResource::IP_ADDRESS_POOL, pool),
            (GroupVersionResource::L2_ADVERTISEMENT, advertisement),
        ] {
            let exists = self
                .cluster
                .custom_resource_exists(&gvr)
                .await
                .map_err(|source| self.cluster_error(format!("check for {gvr}"), source))?;
            if !exists {
                debug!(machine = %name, %gvr, "resource kind not installed, skipping");
                continue;
            }
            self.cluster
                .create_custom_resource(&gvr, METALLB_NAMESPACE, name, object)
                .await
                .map_err(|source| self.cluster_error(format!("create {gvr}"), source))?;
            info!(machine = %name, %gvr, "created");
        }
        Ok(())
    }

    /// Delete the host, its cluster nodes and its address pool objects, in that order.
    ///
    /// Stops at the first failure. Cluster objects that do not exist are skipped.
    pub async fn remove(&mut self) -> Result<(), MachineError> {
        let id = self.handle("remove")?.to_string();
        let name = self.spec.name.clone();

        self.provisioner
            .delete(&id)
            .await
            .map_err(|source| MachineError::Delete {
                name: name.clone(),
                id: id.clone(),
                source,
            })?;
        info!(machine = %name, %id, "host deleted");

        let nodes = self
            .cluster
            .list_nodes(&self.node_selector())
            .await
            .map_err(|source| self.cluster_error("list cluster nodes".to_string(), source))?;
        for node in nodes {
            match self.cluster.delete_node(&node).await {
                Ok(()) => info!(machine = %name, %node, "cluster node deleted"),
                Err(ClusterError::NotFound { .. }) => {}
                Err(source) => {
                    return Err(self.cluster_error(format!("delete cluster node {node}"), source));
                }
            }
        }

        for gvr in [
            GroupVersionResource::IP_ADDRESS_POOL,
            GroupVersionResource::L2_ADVERTISEMENT,
        ] {
            match self
                .cluster
                .delete_custom_resource(&gvr, METALLB_NAMESPACE, &name)
                .await
            {
                Ok(()) => info!(machine = %name, %gvr, "deleted"),
                Err(ClusterError::NotFound { .. }) => debug!(machine = %name, %gvr, "not present"),
                Err(source) => return Err(self.cluster_error(format!("delete {gvr}"), source)),
            }
        }

        self.host = None;
        self.state = MachineState::Removed;
        Ok(())
    }

    fn cluster_error(&self, operation: String, source: ClusterError) -> MachineError {
        MachineError::Cluster {
            name: self.spec.name.clone(),
            operation,
            source,
        }
    }
}
