//! Certificate-rotation watcher.
//!
//! Consumes the credential store's cert-change feed. Every stored
//! certificate is fanned out to the matching `SubscribeCertChanged`
//! subscribers; a rotation of the endpoint storage type additionally
//! requests a restart of the protected endpoint so new mTLS handshakes
//! use the fresh credentials.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::collaborators::CertInfo;
use crate::server::ServerContext;

/// Runs until shutdown or until the credential store drops its feed.
pub async fn run(ctx: Arc<ServerContext>, cert_storage: String, restart_tx: watch::Sender<u64>) {
    let mut changes = ctx.credentials.subscribe_cert_changed();

    loop {
        tokio::select! {
            _ = ctx.shutdown.wait() => break,
            changed = changes.recv() => match changed {
                Ok(cert) => handle_change(&ctx, &cert_storage, &restart_tx, cert),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "cert change watcher lagged");
                }
                Err(_) => break,
            },
        }
    }
}

fn handle_change(
    ctx: &Arc<ServerContext>,
    cert_storage: &str,
    restart_tx: &watch::Sender<u64>,
    cert: CertInfo,
) {
    let wire = edgeiam_proto::CertInfo {
        cert_type: cert.cert_type.clone(),
        key_url: cert.key_url.clone(),
        cert_url: cert.cert_url.clone(),
        serial: cert.serial.clone(),
        issuer: cert.issuer.clone(),
        not_after: cert.not_after,
    };
    ctx.cert_changed.write(&cert.cert_type, wire);

    if cert.cert_type == cert_storage {
        info!(cert_type = %cert.cert_type, serial = %cert.serial, "endpoint certificate rotated");
        restart_tx.send_modify(|generation| *generation += 1);
    }
}
