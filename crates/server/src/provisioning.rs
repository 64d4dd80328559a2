//! The provisioning state machine of the local node.
//!
//! Encodes which lifecycle operations are legal in which state and owns
//! the only durable state of the server: the provisioning state file.
//!
//! | Operation          | Legal from            | To            |
//! |--------------------|-----------------------|---------------|
//! | StartProvisioning  | Unprovisioned         | Unprovisioned |
//! | FinishProvisioning | Unprovisioned         | Provisioned   |
//! | Deprovision        | Provisioned, Paused   | Unprovisioned |
//! | PauseNode          | Provisioned           | Paused        |
//! | ResumeNode         | Paused                | Provisioned   |
//!
//! Pause on a Paused node and Deprovision on an Unprovisioned node
//! succeed as no-ops: no commands run, nothing is persisted, no
//! observers fire. Transitions are serialized by an async mutex so only
//! one may be in progress at a time.
//!
//! Side effects on a real transition: entering Provisioned runs the
//! finish-provisioning command; entering Unprovisioned runs the
//! deprovision command and removes the state file; leaving Unprovisioned
//! persists the new state atomically (write temp + rename).
//! StartProvisioning additionally runs the start-provisioning and
//! disk-encryption commands without changing state.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use edgeiam_common::{IamError, NodeStatus, Result};

use crate::collaborators::CommandRunner;

const STATE_CHANGED_CAPACITY: usize = 16;

/// Lifecycle operation requested against the local node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProvisioningOp {
    StartProvisioning,
    FinishProvisioning,
    Deprovision,
    PauseNode,
    ResumeNode,
}

impl ProvisioningOp {
    /// Target state of the operation; `None` leaves the state unchanged.
    fn target(self) -> Option<NodeStatus> {
        match self {
            ProvisioningOp::StartProvisioning => None,
            ProvisioningOp::FinishProvisioning => Some(NodeStatus::Provisioned),
            ProvisioningOp::Deprovision => Some(NodeStatus::Unprovisioned),
            ProvisioningOp::PauseNode => Some(NodeStatus::Paused),
            ProvisioningOp::ResumeNode => Some(NodeStatus::Provisioned),
        }
    }

    /// Whether the operation is legal from `from`, and whether it is a
    /// no-op there.
    fn check(self, from: NodeStatus) -> Result<bool> {
        let legal = match self {
            ProvisioningOp::StartProvisioning => from == NodeStatus::Unprovisioned,
            ProvisioningOp::FinishProvisioning => from == NodeStatus::Unprovisioned,
            ProvisioningOp::Deprovision => true,
            ProvisioningOp::PauseNode => {
                from == NodeStatus::Provisioned || from == NodeStatus::Paused
            }
            ProvisioningOp::ResumeNode => from == NodeStatus::Paused,
        };

        if !legal {
            return Err(IamError::permission_denied(format!(
                "{self:?} is not allowed while {from}"
            )));
        }

        let noop = match self {
            ProvisioningOp::Deprovision => from == NodeStatus::Unprovisioned,
            ProvisioningOp::PauseNode => from == NodeStatus::Paused,
            _ => false,
        };
        Ok(noop)
    }
}

/// Command lines run on lifecycle transitions.
#[derive(Clone, Debug, Default)]
pub struct ProvisioningCmds {
    pub start_provisioning: Vec<String>,
    pub disk_encryption: Vec<String>,
    pub finish_provisioning: Vec<String>,
    pub deprovision: Vec<String>,
}

/// Result of one applied operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub from: NodeStatus,
    pub to: NodeStatus,
    /// False when the operation was accepted as a no-op.
    pub changed: bool,
}

/// Serialized, persistent provisioning state of the local node.
pub struct ProvisioningStateMachine {
    state: tokio::sync::Mutex<NodeStatus>,
    state_path: PathBuf,
    cmds: ProvisioningCmds,
    runner: Arc<dyn CommandRunner>,
    changed_tx: broadcast::Sender<NodeStatus>,
}

impl ProvisioningStateMachine {
    /// Creates the machine, reading the initial state from `state_path`.
    /// A missing file means Unprovisioned.
    pub fn new(
        state_path: impl Into<PathBuf>,
        cmds: ProvisioningCmds,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let state_path = state_path.into();
        let initial = read_state(&state_path)?;
        let (changed_tx, _) = broadcast::channel(STATE_CHANGED_CAPACITY);

        debug!(state = %initial, path = %state_path.display(), "provisioning state loaded");

        Ok(Self {
            state: tokio::sync::Mutex::new(initial),
            state_path,
            cmds,
            runner,
            changed_tx,
        })
    }

    /// Current state. Suspends briefly if a transition is in progress.
    pub async fn current(&self) -> NodeStatus {
        *self.state.lock().await
    }

    /// Observer feed of every state change.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeStatus> {
        self.changed_tx.subscribe()
    }

    /// Applies one lifecycle operation.
    ///
    /// Holds the transition lock for the whole operation so transitions
    /// are serialized, including their command hooks and persistence.
    pub async fn apply(&self, op: ProvisioningOp) -> Result<Transition> {
        let mut state = self.state.lock().await;
        let from = *state;
        let noop = op.check(from)?;

        if noop {
            debug!(?op, state = %from, "operation is a no-op");
            return Ok(Transition { from, to: from, changed: false });
        }

        match op {
            ProvisioningOp::StartProvisioning => {
                self.runner.run(&self.cmds.start_provisioning).await?;
                self.runner.run(&self.cmds.disk_encryption).await?;
                return Ok(Transition { from, to: from, changed: false });
            }
            ProvisioningOp::FinishProvisioning | ProvisioningOp::ResumeNode => {
                if op == ProvisioningOp::FinishProvisioning {
                    self.runner.run(&self.cmds.finish_provisioning).await?;
                }
                self.write_state(NodeStatus::Provisioned)?;
            }
            ProvisioningOp::PauseNode => {
                self.write_state(NodeStatus::Paused)?;
            }
            ProvisioningOp::Deprovision => {
                self.runner.run(&self.cmds.deprovision).await?;
                self.remove_state_file();
            }
        }

        let to = op.target().unwrap_or(from);
        *state = to;
        drop(state);

        info!(%from, %to, "provisioning state changed");
        let _ = self.changed_tx.send(to);

        Ok(Transition { from, to, changed: true })
    }

    fn write_state(&self, state: NodeStatus) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.state_path.with_extension("tmp");
        std::fs::write(&tmp, state.to_string())?;
        std::fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    fn remove_state_file(&self) {
        let _ = std::fs::remove_file(&self.state_path);
    }
}

fn read_state(path: &std::path::Path) -> Result<NodeStatus> {
    match std::fs::read_to_string(path) {
        Ok(raw) => {
            let line = raw.lines().next().unwrap_or("");
            line.parse()
        }
        Err(_) => Ok(NodeStatus::Unprovisioned),
    }
}

/// Command runner spawning real processes.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String]) -> Result<()> {
        let Some((cmd, args)) = argv.split_first() else {
            return Ok(());
        };

        let output = tokio::process::Command::new(cmd)
            .args(args)
            .output()
            .await
            .map_err(|e| IamError::internal(format!("can't exec {cmd}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(IamError::internal(format!(
                "{cmd} failed: code={:?}, output={}",
                output.status.code(),
                stderr.trim()
            )));
        }

        Ok(())
    }
}
