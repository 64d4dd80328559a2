//! The protected RPC surface.
//!
//! Served behind mutual TLS (plaintext in provisioning mode). Every
//! request bearing a node id is routed: an empty id or the local node's
//! id executes against local collaborators, anything else is forwarded
//! over the target's register-node stream with the retry policy of
//! [`dispatch`].
//!
//! Operations where partial work may have occurred (the provisioning
//! family, pause/resume, create-key, apply-cert) return transport-level
//! OK and report failures in-band through the response's `error` field,
//! so one node's failure does not poison a fleet-wide view. Requests
//! that are impossible to attempt (unknown target, capacity exceeded,
//! shutdown) fail with a non-OK transport status.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, error};

use edgeiam_common::node::MAX_NUM_SERVICES;
use edgeiam_common::{IamError, NodeStatus};
use edgeiam_proto::iam_certificate_service_server::IamCertificateService;
use edgeiam_proto::iam_nodes_service_server::IamNodesService;
use edgeiam_proto::iam_permissions_service_server::IamPermissionsService;
use edgeiam_proto::iam_provisioning_service_server::IamProvisioningService;
use edgeiam_proto::{
    ApplyCertRequest, ApplyCertResponse, CertTypes, CreateKeyRequest, CreateKeyResponse,
    DeprovisionRequest, DeprovisionResponse, Empty, ErrorInfo, FinishProvisioningRequest,
    FinishProvisioningResponse, GetCertTypesRequest, PauseNodeRequest, PauseNodeResponse,
    RegisterInstanceRequest, RegisterInstanceResponse, ResumeNodeRequest, ResumeNodeResponse,
    StartProvisioningRequest, StartProvisioningResponse, UnregisterInstanceRequest,
};

use crate::collaborators::{PermissionStore, ServicePermissions};
use crate::dispatch::{self, forward_with_retry, DEFAULT_TIMEOUT, PROVISIONING_TIMEOUT};
use crate::provisioning::ProvisioningOp;
use crate::server::ServerContext;

/// Handler of the protected service set.
#[derive(Clone)]
pub struct ProtectedHandler {
    ctx: Arc<ServerContext>,
}

impl ProtectedHandler {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    fn is_local(&self, node_id: &str) -> bool {
        dispatch::is_local(node_id, self.ctx.self_id())
    }

    fn permissions(&self) -> Result<Arc<dyn PermissionStore>, Status> {
        self.ctx
            .permissions
            .clone()
            .ok_or_else(|| IamError::wrong_state("permissions handler is not enabled").into())
    }

    /// Records the outcome of a fleet lifecycle operation with the node
    /// store. Local transitions are mirrored by the state observer task,
    /// so only remote outcomes are recorded here.
    fn record_remote_status(&self, node_id: &str, status: NodeStatus) -> Option<ErrorInfo> {
        match self.ctx.node_store.set_node_status(node_id, status) {
            Ok(()) => None,
            Err(err) => {
                error!(node_id, error = %err, "set node status failed");
                Some(ErrorInfo::from_error(&err))
            }
        }
    }

    /// Applies a lifecycle operation to the local state machine,
    /// reporting failure in-band.
    async fn apply_local(&self, op: ProvisioningOp) -> Option<ErrorInfo> {
        match self.ctx.state.apply(op).await {
            Ok(_) => None,
            Err(err) => {
                error!(?op, error = %err, "local transition failed");
                Some(ErrorInfo::from_error(&err))
            }
        }
    }
}

#[tonic::async_trait]
impl IamNodesService for ProtectedHandler {
    async fn pause_node(
        &self,
        request: Request<PauseNodeRequest>,
    ) -> Result<Response<PauseNodeResponse>, Status> {
        let req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, "process pause node");

        if self.is_local(&node_id) {
            let error = self.apply_local(ProvisioningOp::PauseNode).await;
            return Ok(Response::new(PauseNodeResponse { error }));
        }

        let ctx = self.ctx.clone();
        let mut response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move { ctx.lookup_stream(&node_id)?.pause_node(req, DEFAULT_TIMEOUT).await }
        })
        .await
        .map_err(Status::from)?;

        if response.error.is_none() {
            response.error = self.record_remote_status(&node_id, NodeStatus::Paused);
        }
        Ok(Response::new(response))
    }

    async fn resume_node(
        &self,
        request: Request<ResumeNodeRequest>,
    ) -> Result<Response<ResumeNodeResponse>, Status> {
        let req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, "process resume node");

        if self.is_local(&node_id) {
            let error = self.apply_local(ProvisioningOp::ResumeNode).await;
            return Ok(Response::new(ResumeNodeResponse { error }));
        }

        let ctx = self.ctx.clone();
        let mut response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move { ctx.lookup_stream(&node_id)?.resume_node(req, DEFAULT_TIMEOUT).await }
        })
        .await
        .map_err(Status::from)?;

        if response.error.is_none() {
            response.error = self.record_remote_status(&node_id, NodeStatus::Provisioned);
        }
        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl IamProvisioningService for ProtectedHandler {
    async fn get_cert_types(
        &self,
        request: Request<GetCertTypesRequest>,
    ) -> Result<Response<CertTypes>, Status> {
        let req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, "process get cert types");

        if self.is_local(&node_id) {
            let types = self.ctx.credentials.cert_types().await.map_err(Status::from)?;
            return Ok(Response::new(CertTypes { types }));
        }

        let ctx = self.ctx.clone();
        let response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move { ctx.lookup_stream(&node_id)?.get_cert_types(req, DEFAULT_TIMEOUT).await }
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(response))
    }

    async fn start_provisioning(
        &self,
        request: Request<StartProvisioningRequest>,
    ) -> Result<Response<StartProvisioningResponse>, Status> {
        let req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, "process start provisioning");

        if self.is_local(&node_id) {
            if let Err(err) = self.ctx.credentials.start_provisioning(&req.password).await {
                error!(error = %err, "start provisioning failed");
                return Ok(Response::new(StartProvisioningResponse {
                    error: Some(ErrorInfo::from_error(&err)),
                }));
            }

            let error = self.apply_local(ProvisioningOp::StartProvisioning).await;
            return Ok(Response::new(StartProvisioningResponse { error }));
        }

        let ctx = self.ctx.clone();
        let response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move {
                ctx.lookup_stream(&node_id)?.start_provisioning(req, PROVISIONING_TIMEOUT).await
            }
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(response))
    }

    async fn finish_provisioning(
        &self,
        request: Request<FinishProvisioningRequest>,
    ) -> Result<Response<FinishProvisioningResponse>, Status> {
        let req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, "process finish provisioning");

        if self.is_local(&node_id) {
            if let Err(err) = self.ctx.credentials.finish_provisioning(&req.password).await {
                error!(error = %err, "finish provisioning failed");
                return Ok(Response::new(FinishProvisioningResponse {
                    error: Some(ErrorInfo::from_error(&err)),
                }));
            }

            let error = self.apply_local(ProvisioningOp::FinishProvisioning).await;
            return Ok(Response::new(FinishProvisioningResponse { error }));
        }

        let ctx = self.ctx.clone();
        let mut response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move {
                ctx.lookup_stream(&node_id)?.finish_provisioning(req, PROVISIONING_TIMEOUT).await
            }
        })
        .await
        .map_err(Status::from)?;

        if response.error.is_none() {
            response.error = self.record_remote_status(&node_id, NodeStatus::Provisioned);
        }
        Ok(Response::new(response))
    }

    async fn deprovision(
        &self,
        request: Request<DeprovisionRequest>,
    ) -> Result<Response<DeprovisionResponse>, Status> {
        let req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, "process deprovision");

        if self.is_local(&node_id) {
            if let Err(err) = self.ctx.credentials.deprovision(&req.password).await {
                error!(error = %err, "deprovision failed");
                return Ok(Response::new(DeprovisionResponse {
                    error: Some(ErrorInfo::from_error(&err)),
                }));
            }

            let error = self.apply_local(ProvisioningOp::Deprovision).await;
            return Ok(Response::new(DeprovisionResponse { error }));
        }

        let ctx = self.ctx.clone();
        let mut response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move {
                ctx.lookup_stream(&node_id)?.deprovision(req, PROVISIONING_TIMEOUT).await
            }
        })
        .await
        .map_err(Status::from)?;

        if response.error.is_none() {
            response.error = self.record_remote_status(&node_id, NodeStatus::Unprovisioned);
        }
        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl IamCertificateService for ProtectedHandler {
    async fn create_key(
        &self,
        request: Request<CreateKeyRequest>,
    ) -> Result<Response<CreateKeyResponse>, Status> {
        let mut req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, cert_type = %req.cert_type, "process create key");

        // An empty subject is substituted with the unit identity before
        // local execution or forwarding.
        if req.subject.is_empty() {
            let Some(identity) = self.ctx.identity.clone() else {
                let err = IamError::not_found("subject can't be empty");
                error!(error = %err, "create key failed");
                return Ok(Response::new(CreateKeyResponse {
                    node_id,
                    cert_type: req.cert_type,
                    csr: String::new(),
                    error: Some(ErrorInfo::from_error(&err)),
                }));
            };

            match identity.system_id().await {
                Ok(system_id) => req.subject = system_id,
                Err(err) => {
                    error!(error = %err, "get system ID failed");
                    return Ok(Response::new(CreateKeyResponse {
                        node_id,
                        cert_type: req.cert_type,
                        csr: String::new(),
                        error: Some(ErrorInfo::from_error(&err)),
                    }));
                }
            }
        }

        if self.is_local(&node_id) {
            let created = self
                .ctx
                .credentials
                .create_key(&req.cert_type, &req.subject, &req.password)
                .await;

            let response = match created {
                Ok(csr) => {
                    CreateKeyResponse { node_id, cert_type: req.cert_type, csr, error: None }
                }
                Err(err) => {
                    error!(error = %err, "create key failed");
                    CreateKeyResponse {
                        node_id,
                        cert_type: req.cert_type,
                        csr: String::new(),
                        error: Some(ErrorInfo::from_error(&err)),
                    }
                }
            };
            return Ok(Response::new(response));
        }

        let ctx = self.ctx.clone();
        let response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move { ctx.lookup_stream(&node_id)?.create_key(req, DEFAULT_TIMEOUT).await }
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(response))
    }

    async fn apply_cert(
        &self,
        request: Request<ApplyCertRequest>,
    ) -> Result<Response<ApplyCertResponse>, Status> {
        let req = request.into_inner();
        let node_id = req.node_id.clone();

        debug!(%node_id, cert_type = %req.cert_type, "process apply cert");

        if self.is_local(&node_id) {
            let applied = self.ctx.credentials.apply_cert(&req.cert_type, &req.cert).await;

            let response = match applied {
                Ok(cert) => ApplyCertResponse {
                    node_id,
                    cert_type: req.cert_type,
                    cert_url: cert.cert_url,
                    serial: cert.serial,
                    error: None,
                },
                Err(err) => {
                    error!(error = %err, "apply cert failed");
                    ApplyCertResponse {
                        node_id,
                        cert_type: req.cert_type,
                        cert_url: String::new(),
                        serial: String::new(),
                        error: Some(ErrorInfo::from_error(&err)),
                    }
                }
            };
            return Ok(Response::new(response));
        }

        let ctx = self.ctx.clone();
        let response = forward_with_retry(&self.ctx.shutdown, || {
            let ctx = ctx.clone();
            let req = req.clone();
            let node_id = node_id.clone();
            async move { ctx.lookup_stream(&node_id)?.apply_cert(req, DEFAULT_TIMEOUT).await }
        })
        .await
        .map_err(Status::from)?;

        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl IamPermissionsService for ProtectedHandler {
    async fn register_instance(
        &self,
        request: Request<RegisterInstanceRequest>,
    ) -> Result<Response<RegisterInstanceResponse>, Status> {
        let req = request.into_inner();

        // Capacity is enforced before the collaborator is touched.
        if req.permissions.len() > MAX_NUM_SERVICES {
            return Err(IamError::resource_exhausted(format!(
                "more than {MAX_NUM_SERVICES} services in permissions"
            ))
            .into());
        }

        let instance = instance_from_proto(req.instance)?;

        debug!(instance = %instance, "process register instance");

        let permissions: ServicePermissions = req
            .permissions
            .into_iter()
            .map(|(service, perms)| (service, perms.permissions))
            .collect();

        let secret = self
            .permissions()?
            .register_instance(instance, permissions)
            .map_err(Status::from)?;

        Ok(Response::new(RegisterInstanceResponse { secret }))
    }

    async fn unregister_instance(
        &self,
        request: Request<UnregisterInstanceRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let instance = instance_from_proto(req.instance)?;

        debug!(instance = %instance, "process unregister instance");

        self.permissions()?.unregister_instance(&instance).map_err(Status::from)?;

        Ok(Response::new(Empty {}))
    }
}

fn instance_from_proto(
    instance: Option<edgeiam_proto::InstanceIdent>,
) -> Result<edgeiam_common::InstanceIdent, Status> {
    let instance =
        instance.ok_or_else(|| IamError::invalid_argument("instance field is required"))?;

    Ok(edgeiam_common::InstanceIdent {
        service_id: instance.service_id,
        subject_id: instance.subject_id,
        instance: instance.instance,
    })
}
