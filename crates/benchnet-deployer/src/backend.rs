//! Deployment backends: where node and load-client instances run.
//!
//! The orchestrator only talks to a [`DeploymentBackend`]; it never branches on which kind of
//! backend it drives. Two implementations ship with this crate:
//!
//! - [`local::LocalBackend`] runs every instance as a process on the orchestrator's host.
//! - [`bare_metal::BareMetalBackend`] provisions a dedicated [`Machine`](crate::machine::Machine)
//!   per instance and pins the instance onto it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;

use crate::config::Resources;
use crate::machine::MachineError;

pub mod bare_metal;
pub mod local;

/// The network-facing services an instance exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    P2p,
    Rpc,
    Grpc,
    Prometheus,
}

impl Protocol {
    /// The port a node listens on for this protocol when it owns the host.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::P2p => 26656,
            Self::Rpc => 26657,
            Self::Grpc => 9090,
            Self::Prometheus => 26660,
        }
    }
}

/// Lifecycle state of a deployed instance as observed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Started,
    Stopped,
    Destroyed,
}

/// Everything a backend needs to run one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Unique name of the instance within the network.
    pub name: String,
    /// Image (or executable) to run.
    pub image: String,
    /// Image tag or build version.
    pub version: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: Resources,
    /// Labels the instance must be scheduled onto.
    pub node_selector: BTreeMap<String, String>,
}

impl InstanceSpec {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        version: impl Into<String>,
        resources: Resources,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            version: version.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            resources,
            node_selector: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    #[error("instance {0} already exists")]
    DuplicateInstance(String),
    #[error("cannot {operation} instance {name} while it is {state:?}")]
    InvalidState {
        name: String,
        state: InstanceState,
        operation: &'static str,
    },
    #[error("no ports left for instance {name} at index {index}")]
    PortsExhausted { name: String, index: usize },
    #[error("invalid path {path:?} for instance {name}")]
    InvalidPath { name: String, path: String },
    #[error("failed to {operation} instance {name}: {source}")]
    Io {
        name: String,
        operation: &'static str,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("instance {name} has no reachable {protocol:?} address: {reason}")]
    Unreachable {
        name: String,
        protocol: Protocol,
        reason: String,
    },
    #[error(transparent)]
    Machine(#[from] MachineError),
}

/// The capability set every deployment substrate provides.
pub trait DeploymentBackend: Send + Sync {
    /// Opaque reference to one deployed instance.
    type Handle: Clone + fmt::Debug + Send + Sync;

    /// Allocate an instance. Nothing runs until [`start`](Self::start).
    fn create(
        &self,
        spec: InstanceSpec,
    ) -> impl Future<Output = Result<Self::Handle, BackendError>> + Send;

    /// Write a file relative to the instance's home directory.
    fn write_file(
        &self,
        handle: &Self::Handle,
        path: &str,
        contents: Bytes,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Read a file relative to the instance's home directory.
    fn read_file(
        &self,
        handle: &Self::Handle,
        path: &str,
    ) -> impl Future<Output = Result<Bytes, BackendError>> + Send;

    fn start(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn stop(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Release every resource held by the instance.
    fn destroy(&self, handle: &Self::Handle)
    -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Whether the instance is currently observed in `state`.
    fn is_in_state(
        &self,
        handle: &Self::Handle,
        state: InstanceState,
    ) -> impl Future<Output = bool> + Send;

    /// Address other instances of the same network use to reach this one.
    fn internal_address(
        &self,
        handle: &Self::Handle,
        protocol: Protocol,
    ) -> Result<String, BackendError>;

    /// Address reachable from outside the network the instance runs in.
    fn resolve_address(
        &self,
        handle: &Self::Handle,
        protocol: Protocol,
    ) -> impl Future<Output = Result<String, BackendError>> + Send;
}
