//! # edgeiam-proto
//!
//! Generated tonic bindings for the IAM v5 schema plus the conversions
//! between wire messages and the domain types of `edgeiam-common`.
//!
//! The schema lives in `proto/iam.proto` and is compiled by `build.rs`.

use std::collections::BTreeMap;

use edgeiam_common::{IamError, NodeIdentity, NodeStatus};

pub mod v5 {
    tonic::include_proto!("edgeiam.v5");
}

pub use v5::*;

impl ErrorInfo {
    /// Builds an in-band error body from a domain error.
    pub fn from_error(err: &IamError) -> Self {
        ErrorInfo { kind: err.kind().to_string(), message: err.message().to_string() }
    }
}

/// Converts an optional in-band error body back into a domain error.
pub fn error_from_info(info: Option<&ErrorInfo>) -> Option<IamError> {
    let info = info?;
    let kind = match info.kind.as_str() {
        "invalid argument" => edgeiam_common::ErrorKind::InvalidArgument,
        "not found" => edgeiam_common::ErrorKind::NotFound,
        "already exists" => edgeiam_common::ErrorKind::AlreadyExists,
        "permission denied" => edgeiam_common::ErrorKind::PermissionDenied,
        "unavailable" => edgeiam_common::ErrorKind::Unavailable,
        "timed out" => edgeiam_common::ErrorKind::TimedOut,
        "resource exhausted" => edgeiam_common::ErrorKind::ResourceExhausted,
        "wrong state" => edgeiam_common::ErrorKind::WrongState,
        _ => edgeiam_common::ErrorKind::Internal,
    };
    Some(IamError::new(kind, info.message.clone()))
}

impl From<&NodeIdentity> for NodeInfo {
    fn from(node: &NodeIdentity) -> Self {
        NodeInfo {
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            name: node.name.clone(),
            status: node.status.map(|s| s.to_string()).unwrap_or_default(),
            os_type: node.os_type.clone(),
            cpus: node
                .cpus
                .iter()
                .map(|cpu| CpuInfo {
                    model_name: cpu.model_name.clone(),
                    num_cores: cpu.num_cores,
                    num_threads: cpu.num_threads,
                    arch: cpu.arch.clone(),
                    max_dmips: cpu.max_dmips,
                })
                .collect(),
            max_dmips: node.max_dmips,
            total_ram: node.total_ram,
            attrs: node
                .attrs
                .iter()
                .map(|(name, value)| NodeAttribute { name: name.clone(), value: value.clone() })
                .collect(),
            partitions: node
                .partitions
                .iter()
                .map(|p| PartitionInfo {
                    name: p.name.clone(),
                    types: p.types.clone(),
                    path: p.path.clone(),
                    total_size: p.total_size,
                })
                .collect(),
            error: None,
        }
    }
}

impl TryFrom<&NodeInfo> for NodeIdentity {
    type Error = IamError;

    fn try_from(info: &NodeInfo) -> Result<Self, Self::Error> {
        let status = if info.status.is_empty() {
            None
        } else {
            Some(info.status.parse::<NodeStatus>()?)
        };

        let node = NodeIdentity {
            id: info.node_id.clone(),
            node_type: info.node_type.clone(),
            name: info.name.clone(),
            os_type: info.os_type.clone(),
            status,
            attrs: info
                .attrs
                .iter()
                .map(|attr| (attr.name.clone(), attr.value.clone()))
                .collect::<BTreeMap<_, _>>(),
            cpus: info
                .cpus
                .iter()
                .map(|cpu| edgeiam_common::CpuInfo {
                    model_name: cpu.model_name.clone(),
                    num_cores: cpu.num_cores,
                    num_threads: cpu.num_threads,
                    arch: cpu.arch.clone(),
                    max_dmips: cpu.max_dmips,
                })
                .collect(),
            partitions: info
                .partitions
                .iter()
                .map(|p| edgeiam_common::PartitionInfo {
                    name: p.name.clone(),
                    types: p.types.clone(),
                    path: p.path.clone(),
                    total_size: p.total_size,
                })
                .collect(),
            max_dmips: info.max_dmips,
            total_ram: info.total_ram,
        };
        node.validate()?;

        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> NodeIdentity {
        let mut node = NodeIdentity {
            id: "node0".into(),
            node_type: "secondary".into(),
            name: "edge-node-0".into(),
            os_type: "linux".into(),
            status: Some(NodeStatus::Unprovisioned),
            max_dmips: 4000,
            total_ram: 2 * 1024 * 1024 * 1024,
            ..Default::default()
        };
        node.attrs.insert("NodeRunners".into(), "runc".into());
        node.cpus.push(edgeiam_common::CpuInfo {
            model_name: "cortex-a53".into(),
            num_cores: 4,
            num_threads: 4,
            arch: "aarch64".into(),
            max_dmips: 4000,
        });
        node.partitions.push(edgeiam_common::PartitionInfo {
            name: "services".into(),
            types: vec!["services".into()],
            path: "/var/edgeiam/services".into(),
            total_size: 1 << 30,
        });
        node
    }

    #[test]
    fn test_node_identity_conversion_round_trip() {
        let node = sample_node();
        let wire: NodeInfo = (&node).into();
        assert_eq!(wire.node_id, "node0");
        assert_eq!(wire.status, "unprovisioned");
        assert_eq!(wire.cpus.len(), 1);

        let back: NodeIdentity = (&wire).try_into().unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_node_info_without_id_rejected() {
        let wire = NodeInfo { status: "provisioned".into(), ..Default::default() };
        let err = NodeIdentity::try_from(&wire).unwrap_err();
        assert_eq!(err.kind(), edgeiam_common::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_node_info_with_bad_status_rejected() {
        let wire = NodeInfo { node_id: "node0".into(), status: "offline".into(), ..Default::default() };
        assert!(NodeIdentity::try_from(&wire).is_err());
    }

    #[test]
    fn test_error_info_round_trip() {
        let err = IamError::unavailable("stream is closed");
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.kind, "unavailable");

        let back = error_from_info(Some(&info)).unwrap();
        assert_eq!(back.kind(), edgeiam_common::ErrorKind::Unavailable);
        assert_eq!(back.message(), "stream is closed");

        assert!(error_from_info(None).is_none());
    }
}
