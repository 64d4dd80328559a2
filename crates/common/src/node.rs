//! Node identity and lifecycle types.
//!
//! Every node in the fleet is in exactly one of three provisioning states
//! at any time. The set of allowed transitions is a closed set; anything
//! not listed in [`NodeStatus::can_transition_to`] is forbidden.
//!
//! ```text
//! From            → To              Trigger
//! ─────────────── ─────────────── ─────────────────────────────
//! Unprovisioned   → Provisioned    FinishProvisioning
//! Provisioned     → Paused         PauseNode
//! Paused          → Provisioned    ResumeNode
//! Provisioned     → Unprovisioned  Deprovision
//! Paused          → Unprovisioned  Deprovision
//! ```
//!
//! StartProvisioning, CreateKey and ApplyCert do not change the state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IamError;

/// Upper bound on the node id length, in bytes.
pub const MAX_NODE_ID_LEN: usize = 64;

/// Upper bound on the number of node attributes.
pub const MAX_ATTRS: usize = 16;

/// Upper bound on the number of functional services one workload instance
/// may register permissions for.
pub const MAX_NUM_SERVICES: usize = 16;

/// Attribute marking the main node of the fleet.
pub const ATTR_MAIN_NODE: &str = "MainNode";

/// Provisioning lifecycle status of a fleet node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// No credentials installed; only provisioning operations are useful.
    Unprovisioned,
    /// Fully provisioned and serving.
    Provisioned,
    /// Provisioned but administratively paused.
    Paused,
}

impl NodeStatus {
    /// Whether the transition `self -> to` is a member of the closed set.
    ///
    /// Self-transitions are not listed here; the provisioning state
    /// machine treats them as explicit no-ops where the operation allows
    /// it (pause on paused, deprovision on unprovisioned).
    pub fn can_transition_to(self, to: NodeStatus) -> bool {
        matches!(
            (self, to),
            (NodeStatus::Unprovisioned, NodeStatus::Provisioned)
                | (NodeStatus::Provisioned, NodeStatus::Paused)
                | (NodeStatus::Paused, NodeStatus::Provisioned)
                | (NodeStatus::Provisioned, NodeStatus::Unprovisioned)
                | (NodeStatus::Paused, NodeStatus::Unprovisioned)
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Unprovisioned => f.write_str("unprovisioned"),
            NodeStatus::Provisioned => f.write_str("provisioned"),
            NodeStatus::Paused => f.write_str("paused"),
        }
    }
}

impl FromStr for NodeStatus {
    type Err = IamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("unprovisioned") => Ok(NodeStatus::Unprovisioned),
            s if s.eq_ignore_ascii_case("provisioned") => Ok(NodeStatus::Provisioned),
            s if s.eq_ignore_ascii_case("paused") => Ok(NodeStatus::Paused),
            other => Err(IamError::invalid_argument(format!("unknown node status: {other}"))),
        }
    }
}

/// One CPU entry of a node, as reported at registration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub model_name: String,
    pub num_cores: u64,
    pub num_threads: u64,
    pub arch: String,
    pub max_dmips: u64,
}

/// One storage partition of a node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub types: Vec<String>,
    pub path: String,
    pub total_size: u64,
}

/// Identity and hardware description of one fleet node.
///
/// `id` is immutable for the lifetime of the node. `status` is mutated
/// only through the provisioning state machine (for the local node) or
/// recorded from a remote node's own report.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: String,
    pub node_type: String,
    pub name: String,
    pub os_type: String,
    pub status: Option<NodeStatus>,
    pub attrs: BTreeMap<String, String>,
    pub cpus: Vec<CpuInfo>,
    pub partitions: Vec<PartitionInfo>,
    pub max_dmips: u64,
    pub total_ram: u64,
}

impl NodeIdentity {
    /// Whether this node carries the main-node attribute.
    ///
    /// Attribute names are compared case-insensitively, matching the
    /// case-insensitive configuration contract.
    pub fn is_main(&self) -> bool {
        self.attrs
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(ATTR_MAIN_NODE))
    }

    /// Validates the registration-time constraints on this identity.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(IamError::invalid_argument("node id is empty"));
        }
        if self.id.len() > MAX_NODE_ID_LEN {
            return Err(IamError::invalid_argument(format!(
                "node id exceeds {MAX_NODE_ID_LEN} bytes"
            )));
        }
        if self.attrs.len() > MAX_ATTRS {
            return Err(IamError::invalid_argument(format!(
                "node has more than {MAX_ATTRS} attributes"
            )));
        }
        Ok(())
    }
}

/// Identity of one workload instance, ordering-significant for
/// permission lookups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub service_id: String,
    pub subject_id: String,
    pub instance: u64,
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service_id, self.subject_id, self.instance)
    }
}
