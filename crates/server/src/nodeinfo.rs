//! Local node identity assembly.
//!
//! Composes the static [`NodeIdentity`] of the local node from the
//! configured paths and attributes: node id from the id file, total RAM
//! from the meminfo file, the CPU description from the cpuinfo file.
//! The live provisioning status is filled in by the server context from
//! the state machine; it is not part of the static identity.

use std::path::Path;

use tracing::warn;

use edgeiam_common::config::NodeInfoConfig;
use edgeiam_common::{CpuInfo, IamError, NodeIdentity, PartitionInfo, Result};

/// Loads the static identity of the local node.
pub fn load_local_node(config: &NodeInfoConfig) -> Result<NodeIdentity> {
    let id = read_node_id(Path::new(&config.node_id_path))?;

    let total_ram = match read_mem_total(Path::new(&config.mem_info_path)) {
        Some(bytes) => bytes,
        None => {
            warn!(path = %config.mem_info_path, "can't read memory size");
            0
        }
    };

    let cpus = match read_cpu_info(Path::new(&config.cpu_info_path), config.max_dmips) {
        Some(cpus) => cpus,
        None => {
            warn!(path = %config.cpu_info_path, "can't read cpu info");
            Vec::new()
        }
    };

    let node = NodeIdentity {
        id,
        node_type: config.node_type.clone(),
        name: config.node_name.clone(),
        os_type: config.os_type.clone(),
        status: None,
        attrs: config.attrs.clone(),
        cpus,
        partitions: config
            .partitions
            .iter()
            .map(|partition| PartitionInfo {
                name: partition.name.clone(),
                types: partition.types.clone(),
                path: partition.path.clone(),
                total_size: 0,
            })
            .collect(),
        max_dmips: config.max_dmips,
        total_ram,
    };
    node.validate()?;

    Ok(node)
}

fn read_node_id(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|_| IamError::not_found(format!("can't read node id: {}", path.display())))?;

    raw.lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| IamError::not_found(format!("node id file is empty: {}", path.display())))
}

/// `MemTotal` of a meminfo-format file, in bytes.
fn read_mem_total(path: &Path) -> Option<u64> {
    let raw = std::fs::read_to_string(path).ok()?;

    for line in raw.lines() {
        let Some(rest) = line.strip_prefix("MemTotal:") else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let value: u64 = fields.next()?.parse().ok()?;
        let unit = fields.next().unwrap_or("kB");
        let factor = match unit {
            "kB" => 1024,
            "MB" => 1024 * 1024,
            _ => 1,
        };
        return Some(value * factor);
    }

    None
}

/// One aggregate CPU entry from a cpuinfo-format file: model name of the
/// first processor block, one core per `processor` line.
fn read_cpu_info(path: &Path, max_dmips: u64) -> Option<Vec<CpuInfo>> {
    let raw = std::fs::read_to_string(path).ok()?;

    let mut model_name = String::new();
    let mut processors = 0u64;

    for line in raw.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();

        match key {
            "processor" => processors += 1,
            "model name" if model_name.is_empty() => model_name = value.to_string(),
            _ => {}
        }
    }

    if processors == 0 {
        return None;
    }

    Some(vec![CpuInfo {
        model_name,
        num_cores: processors,
        num_threads: processors,
        arch: std::env::consts::ARCH.to_string(),
        max_dmips,
    }])
}
