mod local;
mod mock;

use crate::report::{ContainerState, FinalStatus};
use crate::spec::{File, Resources};
use crate::SkeinResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

pub use local::LocalCluster;
pub use mock::MockCluster;

/// Container exit statuses reported by the cluster, mirroring yarn's
/// `ContainerExitStatus` constants.
pub mod exit_status {
    pub const SUCCESS: i32 = 0;
    pub const INVALID: i32 = -1000;
    pub const ABORTED: i32 = -100;
    pub const DISKS_FAILED: i32 = -101;
    pub const PREEMPTED: i32 = -102;
    pub const KILLED_EXCEEDED_VMEM: i32 = -103;
    pub const KILLED_EXCEEDED_PMEM: i32 = -104;
    pub const KILLED_BY_APPMASTER: i32 = -105;
    pub const KILLED_BY_RESOURCEMANAGER: i32 = -106;
    pub const KILLED_AFTER_APP_COMPLETION: i32 = -107;
}

/// Exit status 0 succeeded; user- or cluster-initiated terminations are
/// killed; anything else failed.
pub fn classify_exit_status(status: i32) -> ContainerState {
    match status {
        exit_status::SUCCESS => ContainerState::Succeeded,
        exit_status::ABORTED
        | exit_status::PREEMPTED
        | exit_status::KILLED_BY_APPMASTER
        | exit_status::KILLED_BY_RESOURCEMANAGER
        | exit_status::KILLED_AFTER_APP_COMPLETION => ContainerState::Killed,
        _ => ContainerState::Failed,
    }
}

/// Opaque container identifier minted by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct YarnContainerId(pub String);

impl YarnContainerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for YarnContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub id: YarnContainerId,
    pub resources: Resources,
}

#[derive(Debug, Clone)]
pub struct Completed {
    pub id: YarnContainerId,
    pub exit_status: i32,
    pub diagnostics: String,
}

/// Everything the node manager needs to start a container.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub files: BTreeMap<String, File>,
    pub env: BTreeMap<String, String>,
    pub commands: Vec<String>,
}

/// Events pushed by the cluster into the application master's event loop.
#[derive(Debug)]
pub enum ClusterEvent {
    ContainersAllocated(Vec<Allocation>),
    ContainersCompleted(Vec<Completed>),
    ShutdownRequested,
    NodesUpdated { updated: usize },
}

pub type ClusterEventSink = tokio::sync::mpsc::UnboundedSender<ClusterEvent>;
pub type ClusterEventStream = tokio::sync::mpsc::UnboundedReceiver<ClusterEvent>;

pub fn event_channel() -> (ClusterEventSink, ClusterEventStream) {
    tokio::sync::mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub struct Registration {
    /// The largest single-container allocation this cluster will grant.
    pub maximum_resources: Resources,
}

/// The narrow surface the application master drives.
///
/// The real yarn protocols (and any other resource manager) live behind this
/// boundary; the crate ships a deterministic in-memory [`MockCluster`] for
/// tests and a [`LocalCluster`] that runs containers as local processes.
#[async_trait]
pub trait ClusterInterface: Send + Sync + 'static {
    async fn register(&self, addr: SocketAddr, tracking_url: &str) -> SkeinResult<Registration>;

    async fn unregister(&self, final_status: FinalStatus, diagnostics: &str) -> SkeinResult<()>;

    /// Ask for one container per entry. Grants come back asynchronously as
    /// [`ClusterEvent::ContainersAllocated`].
    async fn request_containers(&self, requests: &[Resources]) -> SkeinResult<()>;

    /// Hand back a granted container that will not be used.
    async fn release_container(&self, id: &YarnContainerId) -> SkeinResult<()>;

    async fn launch_container(&self, id: &YarnContainerId, ctx: LaunchContext) -> SkeinResult<()>;

    /// Ask the cluster to stop a launched container. Completion is reported
    /// back through [`ClusterEvent::ContainersCompleted`].
    async fn stop_container(&self, id: &YarnContainerId) -> SkeinResult<()>;
}
