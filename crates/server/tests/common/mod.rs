//! Shared fixture for the end-to-end tests: a main node served
//! in-process on loopback with hand-rolled mock collaborators.

// Each test binary uses a different subset of the fixture.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint};

use edgeiam_common::config::{CertModuleConfig, CertModulePlugin, FileCertModuleParams};
use edgeiam_common::{InstanceIdent, NodeIdentity, Result};
use edgeiam_proto::iam_public_nodes_service_client::IamPublicNodesServiceClient;
use edgeiam_proto::{node_message, NodeInfo, NodeMessage, ServerMessage};
use edgeiam_server::collaborators::{
    CommandRunner, IdentityProvider, NodeInfoStore, PermissionStore, ServicePermissions,
};
use edgeiam_server::keystore::FileCredentialStore;
use edgeiam_server::nodestore::MemoryNodeStore;
use edgeiam_server::permstore::MemoryPermissionStore;
use edgeiam_server::provisioning::{ProvisioningCmds, ProvisioningStateMachine};
use edgeiam_server::{IamServer, ServerContext, ServerSettings};

/// Records command invocations instead of spawning processes.
pub struct RecordingRunner {
    pub calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { calls: Mutex::new(Vec::new()) })
    }

    pub fn count_of(&self, cmd: &str) -> usize {
        self.calls.lock().iter().filter(|argv| argv.first().map(String::as_str) == Some(cmd)).count()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, argv: &[String]) -> Result<()> {
        if !argv.is_empty() {
            self.calls.lock().push(argv.to_vec());
        }
        Ok(())
    }
}

/// Identity provider with test-controllable subjects.
pub struct MockIdentity {
    subjects: Mutex<Vec<String>>,
    changed_tx: broadcast::Sender<Vec<String>>,
}

impl MockIdentity {
    pub fn new() -> Arc<Self> {
        let (changed_tx, _) = broadcast::channel(16);
        Arc::new(Self { subjects: Mutex::new(Vec::new()), changed_tx })
    }

    pub fn push_subjects(&self, subjects: Vec<String>) {
        *self.subjects.lock() = subjects.clone();
        let _ = self.changed_tx.send(subjects);
    }
}

#[async_trait]
impl IdentityProvider for MockIdentity {
    async fn system_id(&self) -> Result<String> {
        Ok("SYS-TEST".to_string())
    }

    async fn unit_model(&self) -> Result<String> {
        Ok("edge-test".to_string())
    }

    async fn subjects(&self) -> Result<Vec<String>> {
        Ok(self.subjects.lock().clone())
    }

    fn subscribe_subjects_changed(&self) -> broadcast::Receiver<Vec<String>> {
        self.changed_tx.subscribe()
    }
}

/// Permission store that counts collaborator invocations.
pub struct CountingPermStore {
    inner: MemoryPermissionStore,
    pub register_calls: AtomicUsize,
}

impl CountingPermStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: MemoryPermissionStore::new(), register_calls: AtomicUsize::new(0) })
    }
}

impl PermissionStore for CountingPermStore {
    fn register_instance(
        &self,
        instance: InstanceIdent,
        permissions: ServicePermissions,
    ) -> Result<String> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.register_instance(instance, permissions)
    }

    fn unregister_instance(&self, instance: &InstanceIdent) -> Result<()> {
        self.inner.unregister_instance(instance)
    }

    fn get_permissions(
        &self,
        secret: &str,
        functional_server_id: &str,
    ) -> Result<(InstanceIdent, std::collections::HashMap<String, String>)> {
        self.inner.get_permissions(secret, functional_server_id)
    }
}

/// A running main node plus handles on its collaborators.
pub struct Fleet {
    pub server: IamServer,
    pub ctx: Arc<ServerContext>,
    pub runner: Arc<RecordingRunner>,
    pub identity: Arc<MockIdentity>,
    pub permissions: Arc<CountingPermStore>,
    pub credentials: Arc<FileCredentialStore>,
    pub dir: tempfile::TempDir,
}

impl Fleet {
    pub fn state_file(&self) -> std::path::PathBuf {
        self.dir.path().join(".provisionstate")
    }

    pub async fn public_channel(&self) -> Channel {
        connect(self.server.public_addr()).await
    }

    pub async fn protected_channel(&self) -> Channel {
        connect(self.server.protected_addr()).await
    }
}

async fn connect(addr: std::net::SocketAddr) -> Channel {
    Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .expect("connect to in-process server")
}

pub fn iam_cert_module(alternative_names: &[&str]) -> CertModuleConfig {
    CertModuleConfig {
        id: "iam".into(),
        algorithm: "ecc".into(),
        max_items: 4,
        extended_key_usage: vec!["clientAuth".into(), "serverAuth".into()],
        alternative_names: alternative_names.iter().map(|s| s.to_string()).collect(),
        disabled: false,
        skip_validation: false,
        self_signed: false,
        plugin: CertModulePlugin::File(FileCertModuleParams::default()),
    }
}

/// Starts a main node in provisioning mode (plaintext endpoints).
pub async fn start_main_node(node_id: &str) -> Fleet {
    start_node(node_id, true, &[]).await
}

/// Starts a node; `provisioning_mode = false` requires a certificate
/// already applied for the `iam` storage (see the TLS helpers).
pub async fn start_node(
    node_id: &str,
    provisioning_mode: bool,
    alternative_names: &[&str],
) -> Fleet {
    let dir = tempfile::tempdir().unwrap();

    let mut attrs = BTreeMap::new();
    attrs.insert("MainNode".to_string(), String::new());
    let local = NodeIdentity {
        id: node_id.to_string(),
        node_type: "main".into(),
        name: format!("{node_id}-name"),
        os_type: "linux".into(),
        attrs,
        max_dmips: 4000,
        total_ram: 1 << 30,
        ..Default::default()
    };

    let runner = RecordingRunner::new();
    let state = ProvisioningStateMachine::new(
        dir.path().join(".provisionstate"),
        ProvisioningCmds {
            start_provisioning: vec!["start".into()],
            disk_encryption: vec!["encrypt".into()],
            finish_provisioning: vec!["finish".into()],
            deprovision: vec!["deprovision".into()],
        },
        runner.clone(),
    )
    .unwrap();

    let credentials = Arc::new(
        FileCredentialStore::new(dir.path(), &[iam_cert_module(alternative_names)]).unwrap(),
    );
    let identity = MockIdentity::new();
    let permissions = CountingPermStore::new();
    let node_store: Arc<dyn NodeInfoStore> = Arc::new(MemoryNodeStore::new());

    let ctx = ServerContext::new(
        local,
        state,
        node_store,
        credentials.clone(),
        Some(identity.clone() as Arc<dyn IdentityProvider>),
        Some(permissions.clone() as Arc<dyn PermissionStore>),
    )
    .await
    .unwrap();

    let settings = ServerSettings {
        public_url: "127.0.0.1:0".into(),
        protected_url: "127.0.0.1:0".into(),
        ca_cert: dir.path().join("ca.pem").display().to_string(),
        cert_storage: "iam".into(),
        provisioning_mode,
    };

    let server = IamServer::start(settings, ctx.clone()).await.unwrap();

    Fleet { server, ctx, runner, identity, permissions, credentials, dir }
}

/// An emulated secondary node connected over `RegisterNode`.
pub struct SecondaryNode {
    pub node_id: String,
    pub outbound: mpsc::Sender<NodeMessage>,
    pub inbound: tonic::Streaming<ServerMessage>,
}

impl SecondaryNode {
    /// Connects to the public endpoint and registers with `status`.
    pub async fn connect(fleet: &Fleet, node_id: &str, status: &str) -> Self {
        let channel = fleet.public_channel().await;
        let mut client = IamPublicNodesServiceClient::new(channel);

        let (outbound, rx) = mpsc::channel::<NodeMessage>(8);
        outbound.send(node_info_frame(node_id, status)).await.unwrap();

        let response = client.register_node(ReceiverStream::new(rx)).await.unwrap();
        let inbound = response.into_inner();

        let node = Self { node_id: node_id.to_string(), outbound, inbound };
        node.wait_registered(fleet).await;
        node
    }

    async fn wait_registered(&self, fleet: &Fleet) {
        for _ in 0..100 {
            if fleet.ctx.registry.lookup(&self.node_id).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node {} did not register in time", self.node_id);
    }

    /// Receives the next forwarded request frame.
    pub async fn next_request(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(10), self.inbound.next())
            .await
            .expect("timed out waiting for a forwarded request")
            .expect("stream ended")
            .expect("stream errored")
    }

    /// Sends a response frame correlated to `request`.
    pub async fn respond(&self, request: &ServerMessage, payload: node_message::Payload) {
        self.outbound
            .send(NodeMessage {
                correlation_id: request.correlation_id.clone(),
                payload: Some(payload),
            })
            .await
            .unwrap();
    }
}

pub fn node_info_frame(node_id: &str, status: &str) -> NodeMessage {
    NodeMessage {
        correlation_id: String::new(),
        payload: Some(node_message::Payload::NodeInfo(NodeInfo {
            node_id: node_id.into(),
            node_type: "secondary".into(),
            name: format!("{node_id}-name"),
            status: status.into(),
            os_type: "linux".into(),
            ..Default::default()
        })),
    }
}

/// CA able to sign keystore CSRs and client identities.
pub struct TestCa {
    ca: rcgen::Certificate,
}

impl TestCa {
    pub fn new() -> Self {
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(rcgen::DnType::CommonName, "edgeiam test CA");
        Self { ca: rcgen::Certificate::from_params(params).unwrap() }
    }

    pub fn ca_pem(&self) -> String {
        self.ca.serialize_pem().unwrap()
    }

    pub fn sign_csr(&self, csr_pem: &str) -> String {
        rcgen::CertificateSigningRequest::from_pem(csr_pem)
            .unwrap()
            .serialize_pem_with_signer(&self.ca)
            .unwrap()
    }

    /// Client identity (cert PEM, key PEM) with the given common name.
    pub fn client_identity(&self, common_name: &str) -> (String, String) {
        let mut params = rcgen::CertificateParams::default();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params.distinguished_name.push(rcgen::DnType::CommonName, common_name);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        (cert.serialize_pem_with_signer(&self.ca).unwrap(), cert.serialize_private_key_pem())
    }
}
