//! Certificate rotation: the protected endpoint is restarted with the
//! rotated credentials while the public endpoint keeps serving.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Certificate, ClientTlsConfig, Endpoint, Identity};

use common::{iam_cert_module, MockIdentity, RecordingRunner, TestCa};
use edgeiam_common::NodeIdentity;
use edgeiam_proto::iam_version_service_client::IamVersionServiceClient;
use edgeiam_proto::Empty;
use edgeiam_server::collaborators::{
    CredentialStore, IdentityProvider, NodeInfoStore, PermissionStore,
};
use edgeiam_server::keystore::FileCredentialStore;
use edgeiam_server::nodestore::MemoryNodeStore;
use edgeiam_server::permstore::MemoryPermissionStore;
use edgeiam_server::provisioning::{ProvisioningCmds, ProvisioningStateMachine};
use edgeiam_server::{IamServer, ServerContext, ServerSettings};

async fn probe(
    addr: std::net::SocketAddr,
    trust_pem: &str,
    identity: Option<Identity>,
) -> Result<u64, String> {
    let mut tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(trust_pem))
        .domain_name("localhost");
    if let Some(identity) = identity {
        tls = tls.identity(identity);
    }

    let channel = Endpoint::from_shared(format!("https://{addr}"))
        .map_err(|e| e.to_string())?
        .tls_config(tls)
        .map_err(|e| e.to_string())?
        .connect()
        .await
        .map_err(|e| e.to_string())?;

    let version = IamVersionServiceClient::new(channel)
        .get_api_version(Empty {})
        .await
        .map_err(|e| e.to_string())?;
    Ok(version.into_inner().version)
}

#[tokio::test]
async fn test_cert_rotation_restarts_protected_endpoint_only() {
    let dir = tempfile::tempdir().unwrap();
    let client_ca = TestCa::new();
    let old_ca = TestCa::new();
    let new_ca = TestCa::new();

    // Server credentials signed by the old CA, installed before startup.
    let credentials =
        Arc::new(FileCredentialStore::new(dir.path(), &[iam_cert_module(&["localhost"])]).unwrap());
    let csr = credentials.create_key("iam", "main", "pw").await.unwrap();
    credentials.apply_cert("iam", &old_ca.sign_csr(&csr)).await.unwrap();

    // Clients of the protected endpoint authenticate against this CA.
    let ca_cert_path = dir.path().join("client-ca.pem");
    std::fs::write(&ca_cert_path, client_ca.ca_pem()).unwrap();
    let (client_cert, client_key) = client_ca.client_identity("operator");
    let client_identity = Identity::from_pem(client_cert, client_key);

    let mut attrs = BTreeMap::new();
    attrs.insert("MainNode".to_string(), String::new());
    let local = NodeIdentity { id: "main".into(), attrs, ..Default::default() };

    let state = ProvisioningStateMachine::new(
        dir.path().join(".provisionstate"),
        ProvisioningCmds::default(),
        RecordingRunner::new(),
    )
    .unwrap();

    let ctx = ServerContext::new(
        local,
        state,
        Arc::new(MemoryNodeStore::new()) as Arc<dyn NodeInfoStore>,
        credentials.clone(),
        Some(MockIdentity::new() as Arc<dyn IdentityProvider>),
        Some(Arc::new(MemoryPermissionStore::new()) as Arc<dyn PermissionStore>),
    )
    .await
    .unwrap();

    let settings = ServerSettings {
        public_url: "127.0.0.1:0".into(),
        protected_url: "127.0.0.1:0".into(),
        ca_cert: ca_cert_path.display().to_string(),
        cert_storage: "iam".into(),
        provisioning_mode: false,
    };
    let server = IamServer::start(settings, ctx).await.unwrap();
    let public_addr = server.public_addr();
    let protected_addr = server.protected_addr();

    // Both endpoints answer under the old server certificate.
    assert_eq!(probe(public_addr, &old_ca.ca_pem(), None).await.unwrap(), 5);
    assert_eq!(
        probe(protected_addr, &old_ca.ca_pem(), Some(client_identity.clone())).await.unwrap(),
        5
    );

    // A client trusting only the new CA cannot handshake yet.
    assert!(probe(protected_addr, &new_ca.ca_pem(), Some(client_identity.clone())).await.is_err());

    // Rotate: fresh key, certificate signed by the new CA.
    let csr = credentials.create_key("iam", "main", "pw").await.unwrap();
    credentials.apply_cert("iam", &new_ca.sign_csr(&csr)).await.unwrap();

    // The protected endpoint rebinds with the rotated credentials.
    let mut rotated = false;
    for _ in 0..100 {
        if probe(protected_addr, &new_ca.ca_pem(), Some(client_identity.clone())).await.is_ok() {
            rotated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(rotated, "protected endpoint did not pick up the rotated certificate");

    // The public endpoint still serves with its original certificate.
    assert_eq!(probe(public_addr, &old_ca.ca_pem(), None).await.unwrap(), 5);

    server.stop().await;
}
