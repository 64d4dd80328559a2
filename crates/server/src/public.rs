//! The public RPC surface.
//!
//! Served with server-auth-only TLS (plaintext in provisioning mode) on
//! the public endpoint, and re-registered on the protected endpoint with
//! a wider set of statuses admitted on the register-node stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use edgeiam_common::{IamError, NodeIdentity, NodeStatus, API_VERSION};
use edgeiam_proto::iam_public_identity_service_server::IamPublicIdentityService;
use edgeiam_proto::iam_public_nodes_service_server::IamPublicNodesService;
use edgeiam_proto::iam_public_permissions_service_server::IamPublicPermissionsService;
use edgeiam_proto::iam_public_service_server::IamPublicService;
use edgeiam_proto::iam_version_service_server::IamVersionService;
use edgeiam_proto::{
    ApiVersion, CertInfo, Empty, GetCertRequest, GetNodeInfoRequest, NodeIds, NodeInfo,
    NodeMessage, PermissionsRequest, PermissionsResponse, ServerMessage, Subjects,
    SubscribeCertChangedRequest, SystemInfo,
};

use crate::collaborators::{IdentityProvider, PermissionStore};
use crate::dispatch;
use crate::registry::handle_node_stream;
use crate::server::ServerContext;
use crate::tls;

const REGISTER_STREAM_CAPACITY: usize = 16;

/// Handler of the public service set.
#[derive(Clone)]
pub struct PublicHandler {
    ctx: Arc<ServerContext>,
    allowed_statuses: &'static [NodeStatus],
}

impl PublicHandler {
    pub fn new(ctx: Arc<ServerContext>, allowed_statuses: &'static [NodeStatus]) -> Self {
        Self { ctx, allowed_statuses }
    }

    fn identity(&self) -> Result<Arc<dyn IdentityProvider>, Status> {
        self.ctx
            .identity
            .clone()
            .ok_or_else(|| IamError::wrong_state("identity provider is not configured").into())
    }

    fn permissions(&self) -> Result<Arc<dyn PermissionStore>, Status> {
        self.ctx
            .permissions
            .clone()
            .ok_or_else(|| IamError::wrong_state("permissions handler is not enabled").into())
    }
}

#[tonic::async_trait]
impl IamVersionService for PublicHandler {
    async fn get_api_version(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ApiVersion>, Status> {
        debug!("process get API version");

        Ok(Response::new(ApiVersion { version: API_VERSION }))
    }
}

#[tonic::async_trait]
impl IamPublicService for PublicHandler {
    async fn get_node_info(&self, _request: Request<Empty>) -> Result<Response<NodeInfo>, Status> {
        debug!("process get node info");

        let info = self.ctx.self_info().await;
        Ok(Response::new((&info).into()))
    }

    async fn get_cert(
        &self,
        request: Request<GetCertRequest>,
    ) -> Result<Response<CertInfo>, Status> {
        let req = request.into_inner();

        debug!(cert_type = %req.cert_type, serial = %req.serial, "process get cert");

        let cert = self
            .ctx
            .credentials
            .get_cert(&req.cert_type, &req.issuer, &req.serial)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(CertInfo {
            cert_type: cert.cert_type,
            key_url: cert.key_url,
            cert_url: cert.cert_url,
            serial: cert.serial,
            issuer: cert.issuer,
            not_after: cert.not_after,
        }))
    }

    type SubscribeCertChangedStream = ReceiverStream<Result<CertInfo, Status>>;

    async fn subscribe_cert_changed(
        &self,
        request: Request<SubscribeCertChangedRequest>,
    ) -> Result<Response<Self::SubscribeCertChangedStream>, Status> {
        let req = request.into_inner();

        debug!(cert_type = %req.cert_type, "process subscribe cert changed");

        let rx = self.ctx.cert_changed.subscribe(&req.cert_type).map_err(Status::from)?;
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[tonic::async_trait]
impl IamPublicIdentityService for PublicHandler {
    async fn get_system_info(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<SystemInfo>, Status> {
        debug!("process get system info");

        let identity = self.identity()?;
        let system_id = identity.system_id().await.map_err(Status::from)?;
        let unit_model = identity.unit_model().await.map_err(Status::from)?;

        Ok(Response::new(SystemInfo { system_id, unit_model }))
    }

    async fn get_subjects(&self, _request: Request<Empty>) -> Result<Response<Subjects>, Status> {
        debug!("process get subjects");

        let subjects = self.identity()?.subjects().await.map_err(Status::from)?;
        Ok(Response::new(Subjects { subjects }))
    }

    type SubscribeSubjectsChangedStream = ReceiverStream<Result<Subjects, Status>>;

    async fn subscribe_subjects_changed(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::SubscribeSubjectsChangedStream>, Status> {
        debug!("process subscribe subjects changed");

        let rx = self.ctx.subjects_changed.subscribe().map_err(Status::from)?;
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[tonic::async_trait]
impl IamPublicPermissionsService for PublicHandler {
    async fn get_permissions(
        &self,
        request: Request<PermissionsRequest>,
    ) -> Result<Response<PermissionsResponse>, Status> {
        let req = request.into_inner();

        debug!(functional_server_id = %req.functional_server_id, "process get permissions");

        let (instance, permissions) = self
            .permissions()?
            .get_permissions(&req.secret, &req.functional_server_id)
            .map_err(Status::from)?;

        Ok(Response::new(PermissionsResponse {
            instance: Some(edgeiam_proto::InstanceIdent {
                service_id: instance.service_id,
                subject_id: instance.subject_id,
                instance: instance.instance,
            }),
            permissions: Some(edgeiam_proto::Permissions { permissions }),
        }))
    }
}

#[tonic::async_trait]
impl IamPublicNodesService for PublicHandler {
    async fn get_all_node_ids(&self, _request: Request<Empty>) -> Result<Response<NodeIds>, Status> {
        debug!("process get all node IDs");

        Ok(Response::new(NodeIds { ids: self.ctx.node_store.all_node_ids() }))
    }

    async fn get_node_info(
        &self,
        request: Request<GetNodeInfoRequest>,
    ) -> Result<Response<NodeInfo>, Status> {
        let req = request.into_inner();

        debug!(node_id = %req.node_id, "process get node info");

        let info: NodeIdentity = if dispatch::is_local(&req.node_id, self.ctx.self_id()) {
            self.ctx.self_info().await
        } else {
            self.ctx.node_store.node_info(&req.node_id).map_err(Status::from)?
        };

        Ok(Response::new((&info).into()))
    }

    type SubscribeNodeChangedStream = ReceiverStream<Result<NodeInfo, Status>>;

    async fn subscribe_node_changed(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::SubscribeNodeChangedStream>, Status> {
        debug!("process subscribe node changed");

        let rx = self.ctx.node_changed.subscribe().map_err(Status::from)?;
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type RegisterNodeStream = ReceiverStream<Result<ServerMessage, Status>>;

    async fn register_node(
        &self,
        request: Request<Streaming<NodeMessage>>,
    ) -> Result<Response<Self::RegisterNodeStream>, Status> {
        debug!("process register node");

        if self.ctx.shutdown.is_triggered() {
            return Err(IamError::wrong_state("handler is closed").into());
        }

        let tls_identity = tls::peer_identity(&request);
        let inbound = request.into_inner();

        // The correlator writes raw frames; the pump wraps them for the
        // response stream so reader errors can terminate it with a status.
        let (frame_tx, mut frame_rx) = mpsc::channel::<ServerMessage>(REGISTER_STREAM_CAPACITY);
        let (out_tx, out_rx) =
            mpsc::channel::<Result<ServerMessage, Status>>(REGISTER_STREAM_CAPACITY);

        let pump_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if pump_tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        });

        let ctx = self.ctx.clone();
        let allowed_statuses = self.allowed_statuses;
        tokio::spawn(async move {
            let result = handle_node_stream(
                &ctx.registry,
                &ctx.node_store,
                allowed_statuses,
                tls_identity,
                inbound,
                frame_tx,
            )
            .await;

            if let Err(err) = result {
                let _ = out_tx.send(Err(err.into())).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }
}
