use log::{debug, info, warn};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::state_machine::IsolateState;
use crate::error::{Result, WardenError};
use crate::storage::StatusStorage;
use crate::types::{is_forker, is_monitor, IsolateDescription, IsolateId, NodeId};

/// One managed isolate and where it stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolateEntry {
    #[serde(flatten)]
    pub description: IsolateDescription,
    pub state: IsolateState,
}

/// Lifecycle records of the isolates this monitor manages.
pub struct IsolateStatus {
    local_uid: IsolateId,
    records: Mutex<StatusStorage<IsolateState, IsolateDescription>>,
}

impl IsolateStatus {
    pub fn new(local_uid: impl Into<String>) -> Self {
        Self {
            local_uid: local_uid.into(),
            records: Mutex::new(StatusStorage::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatusStorage<IsolateState, IsolateDescription>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a description in the WAITING state. Returns `false` if the id
    /// is already managed.
    pub fn add(&self, mut description: IsolateDescription) -> Result<bool> {
        if description.name.is_empty() {
            description.name = description.id.clone();
        }
        let id = description.id.as_str();
        if id.is_empty() {
            return Err(WardenError::InvalidId("isolate without id".to_string()));
        }
        if description.node.is_empty() {
            return Err(WardenError::InvalidId(format!("{} has no node", id)));
        }
        if is_forker(id) || is_monitor(id) || id == self.local_uid {
            return Err(WardenError::InvalidId(format!(
                "{} can't be managed as an isolate",
                id
            )));
        }

        let added = self
            .lock()
            .store(id, description.clone(), IsolateState::Waiting);
        if added {
            debug!("Isolate {} managed on node {}", id, description.node);
        }
        Ok(added)
    }

    /// Adds every valid description and returns how many were accepted.
    pub fn load<I>(&self, descriptions: I) -> usize
    where
        I: IntoIterator<Item = IsolateDescription>,
    {
        let mut loaded = 0;
        for description in descriptions {
            let id = description.id.clone();
            match self.add(description) {
                Ok(true) => loaded += 1,
                Ok(false) => warn!("Isolate {} is described twice", id),
                Err(e) => warn!("Ignoring isolate description: {}", e),
            }
        }
        info!("{} isolates to manage", loaded);
        loaded
    }

    fn change(&self, id: &str, next: IsolateState) -> bool {
        match self.lock().change_state(id, next) {
            Ok(previous) => {
                info!("Isolate {}: {} -> {}", id, previous, next);
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    pub fn isolate_requested(&self, id: &str) -> bool {
        self.change(id, IsolateState::Requested)
    }

    pub fn isolate_loading(&self, id: &str) -> bool {
        self.change(id, IsolateState::Loading)
    }

    pub fn isolate_complete(&self, id: &str) -> bool {
        self.change(id, IsolateState::Full)
    }

    pub fn isolate_stopped(&self, id: &str) -> bool {
        self.change(id, IsolateState::Waiting)
    }

    pub fn state(&self, id: &str) -> Option<IsolateState> {
        self.lock().get_state(id)
    }

    pub fn description(&self, id: &str) -> Option<IsolateDescription> {
        self.lock().get(id).cloned()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state(id).map(|state| state.is_running()).unwrap_or(false)
    }

    pub fn is_waiting(&self, id: &str) -> bool {
        self.state(id) == Some(IsolateState::Waiting)
    }

    pub fn waiting_for_node(&self, node: &str) -> Vec<IsolateDescription> {
        self.lock()
            .values_in_states(&[IsolateState::Waiting])
            .into_iter()
            .filter(|description| description.node == node)
            .collect()
    }

    pub fn running_ids(&self) -> Vec<IsolateId> {
        self.lock().ids_in_states(&IsolateState::RUNNING)
    }

    pub fn waiting_ids(&self) -> Vec<IsolateId> {
        self.lock().ids_in_states(&[IsolateState::Waiting])
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .lock()
            .iter()
            .map(|(_, description, _)| description.node.clone())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn entries(&self) -> Vec<IsolateEntry> {
        self.lock()
            .iter()
            .map(|(_, description, state)| IsolateEntry {
                description: description.clone(),
                state,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_status() -> IsolateStatus {
        let status = IsolateStatus::new("monitor-local");
        status.load([
            IsolateDescription::new("iso-a", "node-A", "java"),
            IsolateDescription::new("iso-b", "node-B", "python"),
        ]);
        status
    }

    #[test]
    fn test_load_rejects_invalid_descriptions() {
        let status = IsolateStatus::new("monitor-local");
        let loaded = status.load([
            IsolateDescription::new("", "node-A", "java"),
            IsolateDescription::new("iso-a", "", "java"),
            IsolateDescription::new("forker-a", "node-A", "java"),
            IsolateDescription::new("monitor-2", "node-A", "java"),
            IsolateDescription::new("monitor-local", "node-A", "java"),
            IsolateDescription::new("iso-ok", "node-A", "java"),
            IsolateDescription::new("iso-ok", "node-B", "java"),
        ]);

        assert_eq!(loaded, 1);
        assert_eq!(status.len(), 1);
        assert_eq!(status.description("iso-ok").unwrap().node, "node-A");
    }

    #[test]
    fn test_lifecycle_follows_transitions() {
        let status = create_test_status();
        assert!(status.is_waiting("iso-a"));

        assert!(!status.isolate_loading("iso-a"));
        assert!(status.isolate_requested("iso-a"));
        assert!(status.isolate_loading("iso-a"));
        assert!(status.isolate_complete("iso-a"));
        assert!(status.is_running("iso-a"));
        assert!(status.isolate_stopped("iso-a"));
        assert!(!status.isolate_stopped("iso-a"));
        assert_eq!(status.state("iso-a"), Some(IsolateState::Waiting));
    }

    #[test]
    fn test_unknown_isolate() {
        let status = create_test_status();
        assert!(!status.isolate_requested("ghost"));
        assert!(!status.is_running("ghost"));
        assert!(!status.is_waiting("ghost"));
        assert!(status.state("ghost").is_none());
    }

    #[test]
    fn test_queries() {
        let status = create_test_status();
        status.isolate_requested("iso-b");

        assert_eq!(status.running_ids(), vec!["iso-b"]);
        assert_eq!(status.waiting_ids(), vec!["iso-a"]);
        assert_eq!(status.waiting_for_node("node-A").len(), 1);
        assert!(status.waiting_for_node("node-B").is_empty());
        assert_eq!(status.nodes(), vec!["node-A", "node-B"]);

        let entries = status.entries();
        assert_eq!(entries.len(), 2);
        let json = serde_json::to_value(&entries[1]).unwrap();
        assert_eq!(json["id"], "iso-b");
        assert_eq!(json["state"], "REQUESTED");
    }
}
