use serde::{Deserialize, Serialize};

use crate::storage::StatusState;
use crate::types::{IsolateId, NodeId};

/// Handshake progress of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceState {
    Registered,    // Known, handshake not started
    Synchronizing, // SYN-ACK exchanged
    Validated,     // ACK exchanged
    Notified,      // Local listeners told
}

impl PresenceState {
    pub fn is_validated(&self) -> bool {
        matches!(self, PresenceState::Validated | PresenceState::Notified)
    }
}

impl StatusState for PresenceState {
    /// Presence only moves forward.
    fn can_change_to(&self, next: Self) -> bool {
        next > *self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Registered { id: IsolateId, node: NodeId },
    Unregistered { id: IsolateId, node: NodeId },
}
