//! # edgeiam-server
//!
//! The dispatching IAM server of the edge fleet. A main node terminates
//! two gRPC endpoints (anonymous-TLS public, mutual-TLS protected),
//! executes requests targeting itself against local collaborators, and
//! forwards requests targeting a secondary node over that node's
//! long-lived `RegisterNode` stream.
//!
//! Module map, leaves first:
//!
//! - [`stream_writer`] — per-subscription fan-out of server-streamed events
//! - [`correlator`] — request/response correlation over one bidi stream
//! - [`registry`] — node-id -> live stream handle registry
//! - [`provisioning`] — the provisioning state machine
//! - [`collaborators`] — traits the dispatcher consumes
//! - [`dispatch`] — local/remote routing and the retry policy
//! - [`public`], [`protected`] — the RPC surfaces
//! - [`cert_watcher`] — certificate-rotation driven endpoint restart
//! - [`server`] — endpoint assembly and lifecycle
//!
//! Collaborator implementations used by the binary (and reusable in
//! tests) live in [`identity`], [`keystore`], [`permstore`],
//! [`nodestore`] and [`nodeinfo`].

pub mod cert_watcher;
pub mod collaborators;
pub mod correlator;
pub mod dispatch;
pub mod identity;
pub mod keystore;
pub mod nodeinfo;
pub mod nodestore;
pub mod permstore;
pub mod protected;
pub mod provisioning;
pub mod public;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod stream_writer;
pub mod tls;

pub use server::{IamServer, ServerContext, ServerSettings};
pub use shutdown::Shutdown;
