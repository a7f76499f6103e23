//! Pin every instance onto its own provisioned machine.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::{BackendError, DeploymentBackend, InstanceSpec, InstanceState, Protocol};
use crate::machine::{ClusterClient, Machine, MachineError, MachineSpec, Provisioner};
use crate::poll::PollPolicy;

/// Host parameters shared by every machine the backend provisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineTemplate {
    pub region: String,
    pub size: String,
    pub os: String,
    pub user_data: Vec<String>,
    pub substitutions: BTreeMap<String, String>,
}

impl MachineTemplate {
    fn spec(&self, name: &str) -> MachineSpec {
        MachineSpec {
            name: name.to_string(),
            region: self.region.clone(),
            size: self.size.clone(),
            os: self.os.clone(),
            user_data: self.user_data.clone(),
            substitutions: self.substitutions.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BareMetalHandle<H> {
    pub inner: H,
    pub machine: String,
}

/// A backend that provisions one dedicated machine per instance and schedules the instance on
/// it through an inner (cluster) backend.
///
/// Remote addresses are the machine's public IP and the protocol's standard port; internal
/// addresses come from the inner backend.
pub struct BareMetalBackend<I, P, C> {
    inner: I,
    provisioner: Arc<P>,
    cluster: Arc<C>,
    template: MachineTemplate,
    policy: PollPolicy,
    machines: Mutex<HashMap<String, Machine<P, C>>>,
}

impl<I, P, C> BareMetalBackend<I, P, C>
where
    I: DeploymentBackend,
    P: Provisioner,
    C: ClusterClient,
{
    pub fn new(inner: I, provisioner: Arc<P>, cluster: Arc<C>, template: MachineTemplate) -> Self {
        Self {
            inner,
            provisioner,
            cluster,
            template,
            policy: PollPolicy::PROVISIONING,
            machines: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }

    async fn prepare(
        &self,
        machine: &mut Machine<P, C>,
        mut spec: InstanceSpec,
    ) -> Result<I::Handle, BackendError> {
        machine.wait_for_creation(&self.policy).await?;
        machine.setup_address_pools().await?;
        spec.node_selector.extend(machine.node_selector());
        self.inner.create(spec).await
    }
}

impl<I, P, C> DeploymentBackend for BareMetalBackend<I, P, C>
where
    I: DeploymentBackend,
    P: Provisioner + 'static,
    C: ClusterClient + 'static,
{
    type Handle = BareMetalHandle<I::Handle>;

    async fn create(&self, spec: InstanceSpec) -> Result<Self::Handle, BackendError> {
        let name = spec.name.clone();
        if self.machines.lock().await.contains_key(&name) {
            return Err(BackendError::DuplicateInstance(name));
        }

        let mut machine = Machine::provision(
            self.provisioner.clone(),
            self.cluster.clone(),
            self.template.spec(&name),
        )
        .await?;

        match self.prepare(&mut machine, spec).await {
            Ok(inner) => {
                info!(instance = %name, ip = ?machine.host().and_then(|h| h.ip.as_deref()), "instance pinned to machine");
                self.machines.lock().await.insert(name.clone(), machine);
                Ok(BareMetalHandle {
                    inner,
                    machine: name,
                })
            }
            Err(e) => {
                // The host is billed from the provisioning call on.
                if let Err(remove) = machine.remove().await {
                    error!(instance = %name, "failed to release machine after failed create: {remove}");
                }
                Err(e)
            }
        }
    }

    async fn write_file(
        &self,
        handle: &Self::Handle,
        path: &str,
        contents: Bytes,
    ) -> Result<(), BackendError> {
        self.inner.write_file(&handle.inner, path, contents).await
    }

    async fn read_file(&self, handle: &Self::Handle, path: &str) -> Result<Bytes, BackendError> {
        self.inner.read_file(&handle.inner, path).await
    }

    async fn start(&self, handle: &Self::Handle) -> Result<(), BackendError> {
        self.inner.start(&handle.inner).await
    }

    async fn stop(&self, handle: &Self::Handle) -> Result<(), BackendError> {
        self.inner.stop(&handle.inner).await
    }

    /// Destroy the instance, then remove its machine. Machine removal is not best-effort.
    async fn destroy(&self, handle: &Self::Handle) -> Result<(), BackendError> {
        self.inner.destroy(&handle.inner).await?;

        let Some(mut machine) = self.machines.lock().await.remove(&handle.machine) else {
            // Already removed by an earlier destroy.
            return Ok(());
        };
        if let Err(e) = machine.remove().await {
            self.machines
                .lock()
                .await
                .insert(handle.machine.clone(), machine);
            return Err(e.into());
        }
        Ok(())
    }

    async fn is_in_state(&self, handle: &Self::Handle, state: InstanceState) -> bool {
        self.inner.is_in_state(&handle.inner, state).await
    }

    fn internal_address(
        &self,
        handle: &Self::Handle,
        protocol: Protocol,
    ) -> Result<String, BackendError> {
        self.inner.internal_address(&handle.inner, protocol)
    }

    async fn resolve_address(
        &self,
        handle: &Self::Handle,
        protocol: Protocol,
    ) -> Result<String, BackendError> {
        let machines = self.machines.lock().await;
        let machine = machines
            .get(&handle.machine)
            .ok_or_else(|| BackendError::from(MachineError::Removed {
                name: handle.machine.clone(),
                operation: "resolve an address on",
            }))?;
        Ok(format!("{}:{}", machine.ip()?, protocol.default_port()))
    }
}
