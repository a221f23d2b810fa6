//! Strictly ordered creation of the nodes of one role.
//!
//! Slot `i` starts only after slot `i - 1` is ready, and every slot except
//! the bootstrap slot waits for the bootstrap node. A failed slot halts the
//! role: later slots are skipped, ready nodes are kept and nothing is rolled
//! back. Cancellation stops new slots from starting; a creation already in
//! flight runs to completion.

use std::fmt;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ProvisionError;
use crate::topology::{NodeSpec, ProvisionedNode, Role, K3S_API_PORT};

/// Lifecycle of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not started yet.
    Pending,
    /// Creation in flight.
    Creating,
    /// Node exists and is usable as a predecessor.
    Ready,
    /// Creation failed.
    Failed,
    /// Never started: a predecessor failed or the run was cancelled.
    Skipped,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The node every other node joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapNode {
    /// Private address.
    pub private_ip: Ipv4Addr,
    /// Cloud instance identifier.
    pub instance_id: u64,
    /// Instance name.
    pub name: String,
}

impl BootstrapNode {
    /// Kubernetes API endpoint (`SERVER_API`).
    #[must_use]
    pub fn api_endpoint(&self) -> String {
        format!("https://{}:{K3S_API_PORT}", self.private_ip)
    }
}

impl From<&ProvisionedNode> for BootstrapNode {
    fn from(node: &ProvisionedNode) -> Self {
        Self {
            private_ip: node.private_ip,
            instance_id: node.instance_id,
            name: node.name.clone(),
        }
    }
}

/// Creates (or adopts) the node of one slot.
#[async_trait]
pub trait NodeLauncher: Send + Sync {
    /// Launch the node for `spec`.
    ///
    /// `bootstrap` is `None` only for the bootstrap slot itself.
    async fn launch(
        &self,
        spec: &NodeSpec,
        bootstrap: Option<&BootstrapNode>,
    ) -> Result<ProvisionedNode, ProvisionError>;
}

/// Outcome of running one role.
#[derive(Debug)]
pub struct RoleRollout {
    /// Role.
    pub role: Role,
    /// Desired node count.
    pub desired_count: u32,
    /// Ready nodes in index order.
    pub nodes: Vec<ProvisionedNode>,
    /// Error of the slot that halted the role.
    pub failure: Option<ProvisionError>,
    /// Whether cancellation stopped the role.
    pub cancelled: bool,
    /// Indexes that never started.
    pub skipped: Vec<u32>,
}

impl RoleRollout {
    /// Every desired node is ready.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && !self.cancelled && self.nodes.len() == self.desired_count as usize
    }
}

/// Per-role slot state machine.
#[derive(Debug)]
pub struct Sequencer {
    role: Role,
    states: Vec<SlotState>,
    bootstrap: Option<BootstrapNode>,
    nodes: Vec<ProvisionedNode>,
    failure: Option<ProvisionError>,
    cancelled: bool,
}

impl Sequencer {
    /// Sequencer for `count` slots of a role, all pending.
    #[must_use]
    pub fn new(role: Role, count: u32) -> Self {
        Self {
            role,
            states: vec![SlotState::Pending; count as usize],
            bootstrap: None,
            nodes: Vec::new(),
            failure: None,
            cancelled: false,
        }
    }

    /// Provide the bootstrap node created by another sequencer.
    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: BootstrapNode) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Role of this sequencer.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// State of a slot.
    #[must_use]
    pub fn state(&self, index: u32) -> Option<SlotState> {
        self.states.get(index as usize).copied()
    }

    /// Bootstrap node, once known.
    #[must_use]
    pub const fn bootstrap(&self) -> Option<&BootstrapNode> {
        self.bootstrap.as_ref()
    }

    fn count(&self) -> u32 {
        u32::try_from(self.states.len()).unwrap_or(u32::MAX)
    }

    fn spec(&self, index: u32) -> NodeSpec {
        NodeSpec {
            role: self.role,
            index,
            desired_count: self.count(),
        }
    }

    fn next_pending(&self) -> Option<u32> {
        self.states
            .iter()
            .position(|s| *s == SlotState::Pending)
            .and_then(|i| u32::try_from(i).ok())
    }

    /// Whether the guard of slot `index` holds.
    #[must_use]
    pub fn can_start(&self, index: u32) -> bool {
        if self.state(index) != Some(SlotState::Pending) {
            return false;
        }
        let predecessor_ready = index == 0 || self.state(index - 1) == Some(SlotState::Ready);
        let bootstrap_ready = self.spec(index).is_bootstrap() || self.bootstrap.is_some();
        predecessor_ready && bootstrap_ready
    }

    fn skip_remaining(&mut self) {
        for state in &mut self.states {
            if *state == SlotState::Pending {
                *state = SlotState::Skipped;
            }
        }
    }

    /// Advance one slot. Returns `false` once the role is terminal.
    async fn step(&mut self, launcher: &dyn NodeLauncher, cancel: &CancellationToken) -> bool {
        if self.failure.is_some() || self.cancelled {
            return false;
        }
        let Some(index) = self.next_pending() else {
            return false;
        };

        if cancel.is_cancelled() {
            warn!(role = %self.role, index, "Cancelled, not starting further nodes");
            self.cancelled = true;
            self.skip_remaining();
            return false;
        }

        if !self.can_start(index) {
            self.failure = Some(ProvisionError::OutOfOrder {
                role: self.role,
                index,
            });
            self.skip_remaining();
            return false;
        }

        let spec = self.spec(index);
        self.states[index as usize] = SlotState::Creating;
        info!(role = %self.role, index, count = spec.desired_count, "Creating node");

        match launcher.launch(&spec, self.bootstrap.as_ref()).await {
            Ok(node) => {
                info!(
                    role = %self.role,
                    index,
                    name = %node.name,
                    private_ip = %node.private_ip,
                    "Node ready"
                );
                if spec.is_bootstrap() {
                    self.bootstrap = Some(BootstrapNode::from(&node));
                }
                self.states[index as usize] = SlotState::Ready;
                self.nodes.push(node);
                true
            }
            Err(e) => {
                error!(role = %self.role, index, error = %e, "Node failed, halting role");
                self.states[index as usize] = SlotState::Failed;
                self.failure = Some(e);
                self.skip_remaining();
                false
            }
        }
    }

    /// Create the bootstrap slot only.
    ///
    /// Does nothing when the role has no slots or slot 0 is not the
    /// bootstrap slot.
    ///
    /// # Errors
    /// Returns the bootstrap node's error; the run cannot continue without it.
    pub async fn run_bootstrap(
        &mut self,
        launcher: &dyn NodeLauncher,
        cancel: &CancellationToken,
    ) -> Result<Option<BootstrapNode>, ProvisionError> {
        if self.count() == 0 || !self.spec(0).is_bootstrap() {
            return Ok(None);
        }
        if self.state(0) == Some(SlotState::Pending) {
            self.step(launcher, cancel).await;
        }
        if let Some(e) = self.failure.take() {
            return Err(e);
        }
        Ok(self.bootstrap.clone())
    }

    /// Advance until every slot is terminal.
    pub async fn run(
        mut self,
        launcher: &dyn NodeLauncher,
        cancel: &CancellationToken,
    ) -> RoleRollout {
        while self.step(launcher, cancel).await {}

        let skipped = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == SlotState::Skipped)
            .filter_map(|(i, _)| u32::try_from(i).ok())
            .collect();

        RoleRollout {
            role: self.role,
            desired_count: self.count(),
            nodes: self.nodes,
            failure: self.failure,
            cancelled: self.cancelled,
            skipped,
        }
    }
}
