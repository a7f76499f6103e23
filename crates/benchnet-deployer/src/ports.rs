//! Port allocation for instances sharing one host.

use serde::{Deserialize, Serialize};

use crate::backend::Protocol;

/// Default offset between instances for port allocation.
pub const DEFAULT_PORT_OFFSET: u16 = 100;

/// Port allocation strategy for assigning ports to instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAllocationStrategy {
    pub p2p_base: u16,
    pub rpc_base: u16,
    pub grpc_base: u16,
    pub prometheus_base: u16,
    /// Offset between consecutive instances.
    pub node_offset: u16,
}

impl Default for PortAllocationStrategy {
    fn default() -> Self {
        Self {
            p2p_base: Protocol::P2p.default_port(),
            rpc_base: Protocol::Rpc.default_port(),
            grpc_base: Protocol::Grpc.default_port(),
            prometheus_base: Protocol::Prometheus.default_port(),
            node_offset: DEFAULT_PORT_OFFSET,
        }
    }
}

impl PortAllocationStrategy {
    /// Allocate ports for the instance at the given index, or `None` once any of them would
    /// leave the port range.
    pub fn allocate(&self, index: usize) -> Option<NodePorts> {
        let offset = u16::try_from(index).ok()?.checked_mul(self.node_offset)?;
        Some(NodePorts {
            p2p: self.p2p_base.checked_add(offset)?,
            rpc: self.rpc_base.checked_add(offset)?,
            grpc: self.grpc_base.checked_add(offset)?,
            prometheus: self.prometheus_base.checked_add(offset)?,
        })
    }
}

/// All ports allocated to a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePorts {
    pub p2p: u16,
    pub rpc: u16,
    pub grpc: u16,
    pub prometheus: u16,
}

impl NodePorts {
    pub fn get(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::P2p => self.p2p,
            Protocol::Rpc => self.rpc,
            Protocol::Grpc => self.grpc,
            Protocol::Prometheus => self.prometheus,
        }
    }
}
