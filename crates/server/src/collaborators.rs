//! Collaborator interfaces consumed by the dispatcher.
//!
//! The server core holds these behind `Arc<dyn ...>` references and never
//! owns the cycle back: cert-change and subject-change notifications come
//! out of the collaborators as broadcast receivers consumed by separately
//! owned watcher tasks.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::broadcast;

use edgeiam_common::{InstanceIdent, NodeIdentity, NodeStatus, Result};

/// Metadata of one stored certificate. Immutable once produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertInfo {
    pub cert_type: String,
    pub key_url: String,
    pub cert_url: String,
    /// Lowercase hex, no prefix.
    pub serial: String,
    pub issuer: Vec<u8>,
    /// Unix timestamp, seconds.
    pub not_after: u64,
}

/// Capabilities of one workload towards the functional servers:
/// functional-server id -> (key -> value).
pub type ServicePermissions = HashMap<String, HashMap<String, String>>;

/// Key/certificate storage and the provisioning credential lifecycle.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Certificate types this store manages.
    async fn cert_types(&self) -> Result<Vec<String>>;

    async fn start_provisioning(&self, password: &str) -> Result<()>;

    async fn finish_provisioning(&self, password: &str) -> Result<()>;

    /// Removes all provisioned credentials.
    async fn deprovision(&self, password: &str) -> Result<()>;

    /// Mints a key pair for `cert_type` and returns a PEM CSR for `subject`.
    async fn create_key(&self, cert_type: &str, subject: &str, password: &str) -> Result<String>;

    /// Installs a signed PEM certificate and returns its metadata.
    async fn apply_cert(&self, cert_type: &str, cert_pem: &str) -> Result<CertInfo>;

    /// Looks a certificate up by type and optionally issuer/serial.
    async fn get_cert(&self, cert_type: &str, issuer: &[u8], serial: &str) -> Result<CertInfo>;

    /// Change feed of applied certificates, one event per apply.
    fn subscribe_cert_changed(&self) -> broadcast::Receiver<CertInfo>;
}

/// Source of the unit identity and the subject set.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn system_id(&self) -> Result<String>;

    async fn unit_model(&self) -> Result<String>;

    async fn subjects(&self) -> Result<Vec<String>>;

    /// Change feed of the full subject set.
    fn subscribe_subjects_changed(&self) -> broadcast::Receiver<Vec<String>>;
}

/// Issues and resolves per-workload secrets mapped to capability sets.
pub trait PermissionStore: Send + Sync {
    /// Registers an instance and returns a freshly minted opaque secret.
    fn register_instance(
        &self,
        instance: InstanceIdent,
        permissions: ServicePermissions,
    ) -> Result<String>;

    fn unregister_instance(&self, instance: &InstanceIdent) -> Result<()>;

    /// Resolves a secret for one functional server.
    fn get_permissions(
        &self,
        secret: &str,
        functional_server_id: &str,
    ) -> Result<(InstanceIdent, HashMap<String, String>)>;
}

/// Last-known identity of every fleet member, main node included.
pub trait NodeInfoStore: Send + Sync {
    fn set_node_info(&self, info: NodeIdentity) -> Result<()>;

    fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<()>;

    fn node_info(&self, node_id: &str) -> Result<NodeIdentity>;

    fn all_node_ids(&self) -> Vec<String>;

    /// Whether the store has ever seen this node.
    fn has_node(&self, node_id: &str) -> bool;

    /// Change feed of node identities, one event per info/status update.
    fn subscribe_node_changed(&self) -> broadcast::Receiver<NodeIdentity>;
}

/// Runs one configured command line (provisioning hooks).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `argv` to completion; non-zero exit is an `Internal` error.
    /// An empty argv is a no-op.
    async fn run(&self, argv: &[String]) -> Result<()>;
}
