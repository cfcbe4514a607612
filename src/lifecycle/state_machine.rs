use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::StatusState;

/// Lifecycle of a managed isolate, as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolateState {
    Waiting,
    Requested,
    Loading,
    Full,
}

impl IsolateState {
    pub const ALL: [IsolateState; 4] = [
        IsolateState::Waiting,
        IsolateState::Requested,
        IsolateState::Loading,
        IsolateState::Full,
    ];

    pub const RUNNING: [IsolateState; 3] = [
        IsolateState::Requested,
        IsolateState::Loading,
        IsolateState::Full,
    ];

    pub fn is_running(&self) -> bool {
        !matches!(self, IsolateState::Waiting)
    }
}

impl fmt::Display for IsolateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolateState::Waiting => "WAITING",
            IsolateState::Requested => "REQUESTED",
            IsolateState::Loading => "LOADING",
            IsolateState::Full => "FULL",
        };
        f.write_str(name)
    }
}

pub fn can_transition(from: IsolateState, to: IsolateState) -> bool {
    use IsolateState::*;

    matches!(
        (from, to),
        (Waiting, Requested)
            | (Requested, Waiting)
            | (Requested, Loading)
            | (Requested, Full)
            | (Loading, Waiting)
            | (Loading, Full)
            | (Full, Waiting)
            | (Full, Loading)
    )
}

impl StatusState for IsolateState {
    fn can_change_to(&self, next: Self) -> bool {
        can_transition(*self, next)
    }
}
