//! Endpoint assembly and server lifecycle.
//!
//! [`IamServer::start`] binds both endpoints (listener first, so tests
//! can bind port 0 and discover the address), spawns the background
//! tasks and returns a running server. The protected endpoint runs in a
//! supervisor loop: a certificate rotation of the configured storage
//! triggers a graceful drain bounded by [`DRAIN_GRACE`], a hard teardown
//! of whatever outlives it, and a rebind with credentials rebuilt from
//! the freshly stored certificate. The public endpoint is unaffected.
//!
//! In provisioning mode both endpoints serve without TLS and the
//! provisioning RPC family is admitted on the protected endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::server::{Router, TcpIncoming};
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use edgeiam_common::config::Config;
use edgeiam_common::{IamError, NodeIdentity, NodeStatus, Result};
use edgeiam_proto::iam_certificate_service_server::IamCertificateServiceServer;
use edgeiam_proto::iam_nodes_service_server::IamNodesServiceServer;
use edgeiam_proto::iam_permissions_service_server::IamPermissionsServiceServer;
use edgeiam_proto::iam_provisioning_service_server::IamProvisioningServiceServer;
use edgeiam_proto::iam_public_identity_service_server::IamPublicIdentityServiceServer;
use edgeiam_proto::iam_public_nodes_service_server::IamPublicNodesServiceServer;
use edgeiam_proto::iam_public_permissions_service_server::IamPublicPermissionsServiceServer;
use edgeiam_proto::iam_public_service_server::IamPublicServiceServer;
use edgeiam_proto::iam_version_service_server::IamVersionServiceServer;

use crate::cert_watcher;
use crate::collaborators::{CredentialStore, IdentityProvider, NodeInfoStore, PermissionStore};
use crate::protected::ProtectedHandler;
use crate::provisioning::ProvisioningStateMachine;
use crate::public::PublicHandler;
use crate::registry::{NodeStreamHandle, NodeStreamRegistry};
use crate::shutdown::Shutdown;
use crate::stream_writer::{CertWriterSet, StreamWriter};
use crate::tls;

/// Bound on draining in-flight RPCs during a protected-endpoint restart
/// and on final shutdown.
pub const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Node statuses admitted on the public register-node stream.
pub const PUBLIC_ALLOWED_STATUSES: &[NodeStatus] = &[NodeStatus::Unprovisioned];

/// Node statuses admitted on the protected register-node stream.
pub const PROTECTED_ALLOWED_STATUSES: &[NodeStatus] =
    &[NodeStatus::Provisioned, NodeStatus::Paused];

/// Endpoint addresses and TLS settings.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    pub public_url: String,
    pub protected_url: String,
    pub ca_cert: String,
    pub cert_storage: String,
    pub provisioning_mode: bool,
}

impl ServerSettings {
    pub fn from_config(config: &Config, provisioning_mode: bool) -> Self {
        Self {
            public_url: config.iam_public_server_url.clone(),
            protected_url: config.iam_protected_server_url.clone(),
            ca_cert: config.ca_cert.clone(),
            cert_storage: config.cert_storage.clone(),
            provisioning_mode,
        }
    }
}

/// Shared state of both RPC surfaces.
///
/// The dispatcher exclusively owns the stream registry; the registry
/// exclusively owns each stream handle; collaborators are held behind
/// one-way `Arc<dyn ...>` references (change notifications flow back as
/// broadcast channels consumed by separately owned tasks, never as
/// back-pointers).
pub struct ServerContext {
    local_info: NodeIdentity,
    pub state: ProvisioningStateMachine,
    pub registry: NodeStreamRegistry,
    pub node_store: Arc<dyn NodeInfoStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub identity: Option<Arc<dyn IdentityProvider>>,
    pub permissions: Option<Arc<dyn PermissionStore>>,
    pub node_changed: StreamWriter<edgeiam_proto::NodeInfo>,
    pub subjects_changed: StreamWriter<edgeiam_proto::Subjects>,
    pub cert_changed: CertWriterSet<edgeiam_proto::CertInfo>,
    pub shutdown: Shutdown,
}

impl ServerContext {
    /// Builds the context and seeds the node store with the local node.
    pub async fn new(
        local_info: NodeIdentity,
        state: ProvisioningStateMachine,
        node_store: Arc<dyn NodeInfoStore>,
        credentials: Arc<dyn CredentialStore>,
        identity: Option<Arc<dyn IdentityProvider>>,
        permissions: Option<Arc<dyn PermissionStore>>,
    ) -> Result<Arc<Self>> {
        local_info.validate()?;

        let ctx = Arc::new(Self {
            local_info,
            state,
            registry: NodeStreamRegistry::new(),
            node_store,
            credentials,
            identity,
            permissions,
            node_changed: StreamWriter::new(),
            subjects_changed: StreamWriter::new(),
            cert_changed: CertWriterSet::new(),
            shutdown: Shutdown::new(),
        });

        let mut seeded = ctx.local_info.clone();
        seeded.status = Some(ctx.state.current().await);
        ctx.node_store.set_node_info(seeded)?;

        Ok(ctx)
    }

    pub fn self_id(&self) -> &str {
        &self.local_info.id
    }

    pub fn is_main(&self) -> bool {
        self.local_info.is_main()
    }

    /// Identity of the local node with its live provisioning status.
    pub async fn self_info(&self) -> NodeIdentity {
        let mut info = self.local_info.clone();
        info.status = Some(self.state.current().await);
        info
    }

    /// Resolves the stream handle of a remote node.
    ///
    /// A node the store knows but whose stream is gone is `Unavailable`
    /// (the retry loop will pick it up if it reconnects); a node the
    /// store has never seen is `NotFound`.
    pub fn lookup_stream(&self, node_id: &str) -> Result<Arc<NodeStreamHandle>> {
        match self.registry.lookup(node_id) {
            Some(handle) => Ok(handle),
            None if self.node_store.has_node(node_id) => {
                Err(IamError::unavailable(format!("stream not found: {node_id}")))
            }
            None => Err(IamError::not_found(format!("node {node_id} is unknown"))),
        }
    }

    /// Single close signal: cancels outstanding calls, drains the
    /// registry and removes every subscription. Idempotent.
    pub fn close(&self) {
        self.shutdown.trigger();
        self.registry.close();
        self.node_changed.close();
        self.subjects_changed.close();
        self.cert_changed.close();
    }
}

/// A running IAM server: both endpoints plus background tasks.
pub struct IamServer {
    ctx: Arc<ServerContext>,
    public_addr: SocketAddr,
    protected_addr: SocketAddr,
    restart_tx: watch::Sender<u64>,
    tasks: Vec<JoinHandle<()>>,
}

impl IamServer {
    /// Binds both endpoints and spawns the server tasks.
    pub async fn start(settings: ServerSettings, ctx: Arc<ServerContext>) -> Result<Self> {
        let public_bind = correct_address(&settings.public_url)?;
        let protected_bind = correct_address(&settings.protected_url)?;

        let public_listener = bind(public_bind).await?;
        let protected_listener = bind(protected_bind).await?;
        let public_addr = local_addr(&public_listener)?;
        let protected_addr = local_addr(&protected_listener)?;

        info!(%public_addr, %protected_addr, provisioning_mode = settings.provisioning_mode, "starting IAM server");

        let public_tls = if settings.provisioning_mode {
            None
        } else {
            let cert = ctx.credentials.get_cert(&settings.cert_storage, &[], "").await?;
            Some(tls::public_tls(&cert)?)
        };

        let (restart_tx, _) = watch::channel(0u64);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_public_endpoint(
            ctx.clone(),
            public_listener,
            public_tls,
        )));
        tasks.push(tokio::spawn(run_protected_endpoint(
            ctx.clone(),
            settings.clone(),
            protected_addr,
            protected_listener,
            restart_tx.clone(),
        )));
        tasks.push(tokio::spawn(cert_watcher::run(
            ctx.clone(),
            settings.cert_storage.clone(),
            restart_tx.clone(),
        )));
        tasks.push(tokio::spawn(run_state_observer(ctx.clone())));
        tasks.push(tokio::spawn(run_node_changed_fan(ctx.clone())));
        if ctx.identity.is_some() {
            tasks.push(tokio::spawn(run_subjects_fan(ctx.clone())));
        }

        Ok(Self { ctx, public_addr, protected_addr, restart_tx, tasks })
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// Bound address of the public endpoint.
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Bound address of the protected endpoint.
    pub fn protected_addr(&self) -> SocketAddr {
        self.protected_addr
    }

    /// Requests an asynchronous restart of the protected endpoint.
    pub fn restart_protected(&self) {
        self.restart_tx.send_modify(|generation| *generation += 1);
    }

    /// Runs until shutdown is triggered.
    pub async fn wait(&self) {
        self.ctx.shutdown.wait().await;
    }

    /// Triggers shutdown and joins every task.
    pub async fn stop(self) {
        self.ctx.close();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("IAM server stopped");
    }
}

/// Maps `":8089"` to `0.0.0.0:8089` and parses the result.
pub fn correct_address(url: &str) -> Result<SocketAddr> {
    if url.is_empty() {
        return Err(IamError::invalid_argument("bad address"));
    }

    let full = if url.starts_with(':') { format!("0.0.0.0{url}") } else { url.to_string() };
    full.parse()
        .map_err(|_| IamError::invalid_argument(format!("bad address: {url}")))
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| IamError::internal(format!("can't bind {addr}: {e}")))
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| IamError::internal(format!("can't resolve bound address: {e}")))
}

fn incoming(listener: TcpListener) -> Result<TcpIncoming> {
    TcpIncoming::from_listener(listener, true, None)
        .map_err(|e| IamError::internal(format!("can't accept connections: {e}")))
}

fn builder_with_tls(tls_config: Option<tonic::transport::ServerTlsConfig>) -> Result<Server> {
    let builder = Server::builder();
    match tls_config {
        Some(config) => builder
            .tls_config(config)
            .map_err(|e| IamError::internal(format!("bad TLS config: {e}"))),
        None => Ok(builder),
    }
}

/// Registers the public service set on `builder`.
///
/// The identity and nodes services exist on the main node only; the
/// permissions service only when a permission store is configured.
fn public_router(
    mut builder: Server,
    ctx: &Arc<ServerContext>,
    allowed_statuses: &'static [NodeStatus],
) -> Router {
    let handler = PublicHandler::new(ctx.clone(), allowed_statuses);

    let identity_service = (ctx.is_main() && ctx.identity.is_some())
        .then(|| IamPublicIdentityServiceServer::new(handler.clone()));
    let permissions_service = ctx
        .permissions
        .is_some()
        .then(|| IamPublicPermissionsServiceServer::new(handler.clone()));
    let nodes_service = ctx
        .is_main()
        .then(|| IamPublicNodesServiceServer::new(handler.clone()));

    builder
        .add_service(IamVersionServiceServer::new(handler.clone()))
        .add_service(IamPublicServiceServer::new(handler))
        .add_optional_service(identity_service)
        .add_optional_service(permissions_service)
        .add_optional_service(nodes_service)
}

/// Registers the protected service set: the public surface plus the
/// node, certificate and permission services, and in provisioning mode
/// the provisioning family.
fn protected_router(builder: Server, ctx: &Arc<ServerContext>, provisioning_mode: bool) -> Router {
    let handler = ProtectedHandler::new(ctx.clone());

    let nodes_service = ctx.is_main().then(|| IamNodesServiceServer::new(handler.clone()));
    let provisioning_service = (ctx.is_main() && provisioning_mode)
        .then(|| IamProvisioningServiceServer::new(handler.clone()));
    let certificate_service =
        ctx.is_main().then(|| IamCertificateServiceServer::new(handler.clone()));
    let permissions_service =
        ctx.permissions.is_some().then(|| IamPermissionsServiceServer::new(handler));

    public_router(builder, ctx, PROTECTED_ALLOWED_STATUSES)
        .add_optional_service(nodes_service)
        .add_optional_service(provisioning_service)
        .add_optional_service(certificate_service)
        .add_optional_service(permissions_service)
}

async fn run_public_endpoint(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    tls_config: Option<tonic::transport::ServerTlsConfig>,
) {
    let incoming = match incoming(listener) {
        Ok(incoming) => incoming,
        Err(err) => {
            error!(error = %err, "public endpoint failed");
            ctx.shutdown.trigger();
            return;
        }
    };

    let builder = match builder_with_tls(tls_config) {
        Ok(builder) => builder,
        Err(err) => {
            error!(error = %err, "public endpoint failed");
            ctx.shutdown.trigger();
            return;
        }
    };

    let router = public_router(builder, &ctx, PUBLIC_ALLOWED_STATUSES);
    let shutdown = ctx.shutdown.clone();
    let mut serve = tokio::spawn(async move {
        let drain = {
            let shutdown = shutdown.clone();
            async move { shutdown.wait().await }
        };
        router.serve_with_incoming_shutdown(incoming, drain).await
    });

    tokio::select! {
        result = &mut serve => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "public endpoint stopped");
                    ctx.shutdown.trigger();
                }
                Err(err) => {
                    error!(error = %err, "public endpoint task failed");
                    ctx.shutdown.trigger();
                }
            }
        }
        _ = ctx.shutdown.wait() => {
            // Long-lived subscription streams keep the graceful path
            // open; bound the drain and tear down whatever outlives it.
            if tokio::time::timeout(DRAIN_GRACE, &mut serve).await.is_err() {
                debug!("drain grace elapsed, aborting public endpoint");
                serve.abort();
                let _ = serve.await;
            }
        }
    }
}

async fn run_protected_endpoint(
    ctx: Arc<ServerContext>,
    settings: ServerSettings,
    addr: SocketAddr,
    first_listener: TcpListener,
    restart_tx: watch::Sender<u64>,
) {
    let mut listener = Some(first_listener);

    loop {
        let round = serve_protected_once(&ctx, &settings, addr, listener.take(), &restart_tx).await;

        match round {
            Ok(EndpointRound::Shutdown) => break,
            Ok(EndpointRound::Restart) => {
                info!("protected endpoint restarting with rotated credentials");
            }
            Err(err) => {
                error!(error = %err, "protected endpoint failed");
                ctx.shutdown.trigger();
                break;
            }
        }
    }
}

enum EndpointRound {
    Shutdown,
    Restart,
}

async fn serve_protected_once(
    ctx: &Arc<ServerContext>,
    settings: &ServerSettings,
    addr: SocketAddr,
    listener: Option<TcpListener>,
    restart_tx: &watch::Sender<u64>,
) -> Result<EndpointRound> {
    let listener = match listener {
        Some(listener) => listener,
        None => bind(addr).await?,
    };

    let tls_config = if settings.provisioning_mode {
        None
    } else {
        // Rebuilt every round so a rotation lands in the next bind.
        let cert = ctx.credentials.get_cert(&settings.cert_storage, &[], "").await?;
        Some(tls::protected_mtls(&cert, &settings.ca_cert)?)
    };

    let builder = builder_with_tls(tls_config)?;
    let router = protected_router(builder, ctx, settings.provisioning_mode);

    let shutdown = ctx.shutdown.clone();
    let mut restart_trigger = restart_tx.subscribe();
    let drain = async move {
        tokio::select! {
            _ = shutdown.wait() => {}
            _ = restart_trigger.changed() => {}
        }
    };

    let incoming = incoming(listener)?;
    let start_generation = *restart_tx.borrow();
    let mut serve = tokio::spawn(async move {
        router.serve_with_incoming_shutdown(incoming, drain).await
    });

    let mut restart_rx = restart_tx.subscribe();
    let round = tokio::select! {
        result = &mut serve => {
            // The serve task may win the race against the signal that
            // stopped it; recheck which one fired.
            let restarted = *restart_tx.borrow() != start_generation && !ctx.shutdown.is_triggered();
            return match result {
                Ok(Ok(())) if restarted => Ok(EndpointRound::Restart),
                Ok(Ok(())) => Ok(EndpointRound::Shutdown),
                Ok(Err(e)) => Err(IamError::internal(format!("protected endpoint failed: {e}"))),
                Err(e) => Err(IamError::internal(format!("protected endpoint task failed: {e}"))),
            };
        }
        _ = ctx.shutdown.wait() => EndpointRound::Shutdown,
        _ = restart_rx.changed() => EndpointRound::Restart,
    };

    // Drain in-flight RPCs up to the grace bound, then tear down hard.
    match tokio::time::timeout(DRAIN_GRACE, &mut serve).await {
        Ok(result) => {
            if let Ok(Err(err)) = result {
                warn!(error = %err, "protected endpoint ended with error during drain");
            }
        }
        Err(_) => {
            debug!("drain grace elapsed, aborting protected endpoint");
            serve.abort();
            let _ = serve.await;
        }
    }

    Ok(round)
}

/// Mirrors local provisioning transitions into the node store, which in
/// turn feeds the node-changed subscribers.
async fn run_state_observer(ctx: Arc<ServerContext>) {
    let mut changes = ctx.state.subscribe();
    loop {
        tokio::select! {
            _ = ctx.shutdown.wait() => break,
            changed = changes.recv() => match changed {
                Ok(status) => {
                    if let Err(err) = ctx.node_store.set_node_status(ctx.self_id(), status) {
                        warn!(error = %err, "failed to record local status");
                    }
                }
                Err(_) => break,
            },
        }
    }
}

/// Fans node-store changes out to SubscribeNodeChanged subscribers.
async fn run_node_changed_fan(ctx: Arc<ServerContext>) {
    let mut changes = ctx.node_store.subscribe_node_changed();
    loop {
        tokio::select! {
            _ = ctx.shutdown.wait() => break,
            changed = changes.recv() => match changed {
                Ok(node) => {
                    ctx.node_changed.write((&node).into());
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "node change fan lagged");
                }
                Err(_) => break,
            },
        }
    }
}

/// Fans subject-set changes out to SubscribeSubjectsChanged subscribers.
async fn run_subjects_fan(ctx: Arc<ServerContext>) {
    let Some(identity) = ctx.identity.clone() else {
        return;
    };

    let mut changes = identity.subscribe_subjects_changed();
    loop {
        tokio::select! {
            _ = ctx.shutdown.wait() => break,
            changed = changes.recv() => match changed {
                Ok(subjects) => {
                    ctx.subjects_changed.write(edgeiam_proto::Subjects { subjects });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subjects fan lagged");
                }
                Err(_) => break,
            },
        }
    }
}
