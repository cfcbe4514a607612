pub mod aggregator;
pub mod liveness;
pub mod pending;

pub use aggregator::{ForkerAggregator, ForkerTimings};
pub use liveness::LivenessTable;
pub use pending::{PendingCommands, WaitOutcome};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{ForkerStatus, IsolateDescription, IsolateId, NodeId};

/// In-process notification about forkers joining or leaving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkerEvent {
    Registered {
        forker: IsolateId,
        node: NodeId,
    },
    Unregistered {
        forker: IsolateId,
        node: Option<NodeId>,
    },
}

/// Orders understood by the forkers.
#[async_trait]
pub trait ForkerService: Send + Sync {
    async fn start_isolate(&self, description: &IsolateDescription) -> ForkerStatus;

    /// Fire and forget.
    async fn stop_isolate(&self, isolate_id: &str);

    async fn ping(&self, isolate_id: &str) -> ForkerStatus;

    /// Tells every forker to stop accepting new isolates.
    async fn set_platform_stopping(&self);

    fn subscribe(&self) -> broadcast::Receiver<ForkerEvent>;
}
