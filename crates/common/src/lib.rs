//! # edgeiam-common
//!
//! Shared vocabulary of the edge IAM fleet: node identity and lifecycle
//! types, the error taxonomy spoken across both gRPC endpoints, and the
//! JSON configuration contract.
//!
//! This crate is the data contract between the server core, the
//! collaborator implementations and the tests. It contains no IO beyond
//! config loading and no async code.

pub mod config;
pub mod error;
pub mod node;

pub use error::{ErrorKind, IamError};
pub use node::{CpuInfo, InstanceIdent, NodeIdentity, NodeStatus, PartitionInfo};

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, IamError>;

/// IAM wire schema version served by `GetApiVersion`.
pub const API_VERSION: u64 = 5;
