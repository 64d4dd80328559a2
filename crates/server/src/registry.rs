//! Registry of live secondary-node streams.
//!
//! Every secondary node keeps one `RegisterNode` bidi stream open towards
//! the main node. [`handle_node_stream`] runs the per-stream reader: the
//! first frame must be the node's `NodeInfo`, which is validated (non-empty
//! id, TLS identity match when mTLS is in force, status inside the
//! endpoint's allowed set) and recorded with the [`NodeInfoStore`] before
//! the handle is published. Thereafter the stream carries correlated
//! request/response pairs; later `NodeInfo` frames are unsolicited status
//! pushes and only update the store.
//!
//! At most one handle is registered per node id at any instant. A live
//! duplicate registration is rejected with `AlreadyExists`; registering
//! over a dead predecessor closes it first, failing its in-flight calls
//! with `Unavailable`. Removal is identity-checked so a late cleanup of a
//! superseded handle cannot evict a fresh registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tracing::{debug, warn};

use edgeiam_common::{IamError, NodeIdentity, NodeStatus, Result};
use edgeiam_proto::{node_message, server_message, NodeMessage, ServerMessage};

use crate::collaborators::NodeInfoStore;
use crate::correlator::StreamCorrelator;

/// One live register-node stream.
///
/// Owns the stream's correlator; the outbound half of the transport is
/// the correlator's frame sender, the inbound half is the reader loop in
/// [`handle_node_stream`].
pub struct NodeStreamHandle {
    node_id: String,
    correlator: StreamCorrelator,
    created_at: Instant,
    closed: AtomicBool,
}

impl NodeStreamHandle {
    pub fn new(node_id: String, outbound: mpsc::Sender<ServerMessage>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            correlator: StreamCorrelator::new(outbound),
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn correlator(&self) -> &StreamCorrelator {
        &self.correlator
    }

    /// Terminates the handle: fails in-flight calls with `Unavailable`
    /// and rejects new ones. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.correlator.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn call(
        &self,
        request: server_message::Request,
        timeout: std::time::Duration,
    ) -> Result<node_message::Payload> {
        if self.is_closed() {
            return Err(IamError::unavailable("stream is closed"));
        }
        self.correlator.call(request, timeout).await
    }

    /// Sends a get-cert-types request and waits for the response.
    pub async fn get_cert_types(
        &self,
        request: edgeiam_proto::GetCertTypesRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::CertTypes> {
        match self.call(server_message::Request::GetCertTypes(request), timeout).await? {
            node_message::Payload::CertTypes(response) => Ok(response),
            other => Err(unexpected_response("cert types", &other)),
        }
    }

    /// Sends a start-provisioning request and waits for the response.
    pub async fn start_provisioning(
        &self,
        request: edgeiam_proto::StartProvisioningRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::StartProvisioningResponse> {
        match self.call(server_message::Request::StartProvisioning(request), timeout).await? {
            node_message::Payload::StartProvisioning(response) => Ok(response),
            other => Err(unexpected_response("start provisioning", &other)),
        }
    }

    /// Sends a finish-provisioning request and waits for the response.
    pub async fn finish_provisioning(
        &self,
        request: edgeiam_proto::FinishProvisioningRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::FinishProvisioningResponse> {
        match self.call(server_message::Request::FinishProvisioning(request), timeout).await? {
            node_message::Payload::FinishProvisioning(response) => Ok(response),
            other => Err(unexpected_response("finish provisioning", &other)),
        }
    }

    /// Sends a deprovision request and waits for the response.
    pub async fn deprovision(
        &self,
        request: edgeiam_proto::DeprovisionRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::DeprovisionResponse> {
        match self.call(server_message::Request::Deprovision(request), timeout).await? {
            node_message::Payload::Deprovision(response) => Ok(response),
            other => Err(unexpected_response("deprovision", &other)),
        }
    }

    /// Sends a pause-node request and waits for the response.
    pub async fn pause_node(
        &self,
        request: edgeiam_proto::PauseNodeRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::PauseNodeResponse> {
        match self.call(server_message::Request::PauseNode(request), timeout).await? {
            node_message::Payload::PauseNode(response) => Ok(response),
            other => Err(unexpected_response("pause node", &other)),
        }
    }

    /// Sends a resume-node request and waits for the response.
    pub async fn resume_node(
        &self,
        request: edgeiam_proto::ResumeNodeRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::ResumeNodeResponse> {
        match self.call(server_message::Request::ResumeNode(request), timeout).await? {
            node_message::Payload::ResumeNode(response) => Ok(response),
            other => Err(unexpected_response("resume node", &other)),
        }
    }

    /// Sends a create-key request and waits for the response.
    pub async fn create_key(
        &self,
        request: edgeiam_proto::CreateKeyRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::CreateKeyResponse> {
        match self.call(server_message::Request::CreateKey(request), timeout).await? {
            node_message::Payload::CreateKey(response) => Ok(response),
            other => Err(unexpected_response("create key", &other)),
        }
    }

    /// Sends an apply-cert request and waits for the response.
    pub async fn apply_cert(
        &self,
        request: edgeiam_proto::ApplyCertRequest,
        timeout: std::time::Duration,
    ) -> Result<edgeiam_proto::ApplyCertResponse> {
        match self.call(server_message::Request::ApplyCert(request), timeout).await? {
            node_message::Payload::ApplyCert(response) => Ok(response),
            other => Err(unexpected_response("apply cert", &other)),
        }
    }
}

fn unexpected_response(expected: &str, got: &node_message::Payload) -> IamError {
    IamError::internal(format!("expected {expected} response, got {got:?}"))
}

/// Map node id -> active stream handle.
pub struct NodeStreamRegistry {
    handles: Mutex<HashMap<String, Arc<NodeStreamHandle>>>,
    closed: AtomicBool,
}

impl NodeStreamRegistry {
    pub fn new() -> Self {
        Self { handles: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) }
    }

    /// Publishes a handle under its node id.
    ///
    /// A live handle already registered under the same id fails the new
    /// registration with `AlreadyExists`. A dead predecessor is closed
    /// (cancelling whatever calls it still carried) and replaced.
    pub fn register(&self, handle: Arc<NodeStreamHandle>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IamError::wrong_state("registry is closed"));
        }

        let superseded = {
            let mut handles = self.handles.lock();
            let live_duplicate =
                handles.get(handle.node_id()).is_some_and(|existing| !existing.is_closed());
            if live_duplicate {
                return Err(IamError::already_exists(format!(
                    "node {} is already registered",
                    handle.node_id()
                )));
            }
            handles.insert(handle.node_id().to_string(), handle.clone())
        };

        if let Some(old) = superseded {
            debug!(node_id = %handle.node_id(), "superseding dead stream handle");
            old.close();
        }

        Ok(())
    }

    pub fn lookup(&self, node_id: &str) -> Option<Arc<NodeStreamHandle>> {
        self.handles.lock().get(node_id).cloned()
    }

    /// Removes `handle` if it is still the registered one. A no-op when a
    /// fresh registration has already taken the slot.
    pub fn remove(&self, node_id: &str, handle: &Arc<NodeStreamHandle>) {
        let mut handles = self.handles.lock();
        if let Some(current) = handles.get(node_id) {
            if Arc::ptr_eq(current, handle) {
                handles.remove(node_id);
            }
        }
    }

    /// Snapshot iteration over the registered handles.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<NodeStreamHandle>)) {
        let snapshot: Vec<_> = self.handles.lock().values().cloned().collect();
        for handle in &snapshot {
            visitor(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Closes every handle and drains the registry. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.handles.lock());
        for handle in drained.values() {
            handle.close();
        }
    }
}

impl Default for NodeStreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the reader side of one register-node stream to completion.
///
/// Returns when the stream ends, errors, or a registration rule is
/// violated. The handle, if one was published, is closed and removed
/// before returning; its in-flight calls fail with `Unavailable`. The
/// node's recorded status is left unchanged.
pub async fn handle_node_stream(
    registry: &NodeStreamRegistry,
    node_store: &Arc<dyn NodeInfoStore>,
    allowed_statuses: &[NodeStatus],
    tls_identity: Option<String>,
    mut inbound: impl Stream<Item = std::result::Result<NodeMessage, Status>> + Unpin,
    outbound: mpsc::Sender<ServerMessage>,
) -> Result<()> {
    let mut handle: Option<Arc<NodeStreamHandle>> = None;

    let result = loop {
        let frame = match inbound.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(status)) => break Err(IamError::from(status)),
            None => break Ok(()),
        };

        let Some(payload) = frame.payload else {
            continue;
        };

        match payload {
            node_message::Payload::NodeInfo(info) => {
                let node = match NodeIdentity::try_from(&info) {
                    Ok(node) => node,
                    Err(err) => break Err(err),
                };

                debug!(node_id = %node.id, status = ?node.status, "received node info");

                if let Err(err) = accept_node_info(
                    registry,
                    node_store,
                    allowed_statuses,
                    tls_identity.as_deref(),
                    &mut handle,
                    node,
                    &outbound,
                ) {
                    break Err(err);
                }
            }
            other => match &handle {
                Some(handle) => {
                    if !handle.correlator().complete(&frame.correlation_id, other) {
                        debug!(
                            node_id = %handle.node_id(),
                            correlation_id = %frame.correlation_id,
                            "dropping frame without pending call"
                        );
                    }
                }
                None => {
                    break Err(IamError::invalid_argument(
                        "first frame on register-node stream must be node info",
                    ));
                }
            },
        }
    };

    if let Some(handle) = handle {
        handle.close();
        registry.remove(handle.node_id(), &handle);
        warn!(node_id = %handle.node_id(), "node stream closed, node unreachable");
    }

    result
}

fn accept_node_info(
    registry: &NodeStreamRegistry,
    node_store: &Arc<dyn NodeInfoStore>,
    allowed_statuses: &[NodeStatus],
    tls_identity: Option<&str>,
    handle: &mut Option<Arc<NodeStreamHandle>>,
    node: NodeIdentity,
    outbound: &mpsc::Sender<ServerMessage>,
) -> Result<()> {
    if let Some(peer) = tls_identity {
        if peer != node.id {
            return Err(IamError::permission_denied(format!(
                "node id {} does not match TLS identity {peer}",
                node.id
            )));
        }
    }

    let status = node
        .status
        .ok_or_else(|| IamError::invalid_argument("node info has no status"))?;

    if !allowed_statuses.contains(&status) {
        warn!(node_id = %node.id, %status, "node status is not in allowed list");
        return Err(IamError::permission_denied(format!(
            "node status {status} is not allowed on this endpoint"
        )));
    }

    match handle {
        Some(existing) => {
            if existing.node_id() != node.id {
                return Err(IamError::permission_denied(format!(
                    "stream registered as {} cannot report node {}",
                    existing.node_id(),
                    node.id
                )));
            }
            node_store.set_node_info(node)
        }
        None => {
            let fresh = NodeStreamHandle::new(node.id.clone(), outbound.clone());
            registry.register(fresh.clone())?;
            node_store.set_node_info(node)?;
            *handle = Some(fresh);
            Ok(())
        }
    }
}
