pub mod presence;
pub mod updater;

pub use presence::{PresenceEvent, PresenceState};
pub use updater::RegistrationEngine;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::storage::StatusStorage;
use crate::types::{groups_for, Group, IsolateId, LocalIsolate, NodeId, PeerAddress};

/// Host used to reach the local isolate.
pub const LOCALHOST: &str = "localhost";

const EVENT_CAPACITY: usize = 256;

/// A remote isolate known by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub uid: IsolateId,
    pub name: String,
    pub node: NodeId,
    /// Observed host, applied to the node address book on registration.
    pub host: Option<String>,
    pub port: u16,
    pub groups: BTreeSet<String>,
}

impl PeerRecord {
    pub fn new(uid: impl Into<String>, node: impl Into<String>, port: u16) -> Self {
        let uid = uid.into();
        Self {
            name: uid.clone(),
            uid,
            node: node.into(),
            host: None,
            port,
            groups: BTreeSet::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.name = name;
        }
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.groups
            .extend(groups.into_iter().map(|g| g.as_ref().to_uppercase()));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpedAccess {
    #[serde(default)]
    pub name: String,
    pub node: NodeId,
    pub port: u16,
}

/// Full snapshot of a directory, as exchanged by the DUMP signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryDump {
    #[serde(default)]
    pub accesses: BTreeMap<IsolateId, DumpedAccess>,
    #[serde(default)]
    pub nodes_host: BTreeMap<NodeId, String>,
}

#[derive(Default)]
struct DirectoryState {
    peers: HashMap<IsolateId, PeerRecord>,
    nodes_host: HashMap<NodeId, String>,
    nodes_isolates: HashMap<NodeId, BTreeSet<IsolateId>>,
    groups: HashMap<String, BTreeSet<IsolateId>>,
    presence: StatusStorage<PresenceState, ()>,
}

impl DirectoryState {
    fn set_node_address(&mut self, node: &str, host: &str) -> Option<String> {
        if host.is_empty() {
            return self.nodes_host.get(node).cloned();
        }
        match self.nodes_host.get(node) {
            Some(current) if current == host => Some(current.clone()),
            _ => self.nodes_host.insert(node.to_string(), host.to_string()),
        }
    }

    fn remove(&mut self, uid: &str) -> Option<(PeerRecord, Option<PresenceState>)> {
        let record = self.peers.remove(uid)?;

        if let Some(isolates) = self.nodes_isolates.get_mut(&record.node) {
            isolates.remove(uid);
            if isolates.is_empty() {
                self.nodes_isolates.remove(&record.node);
            }
        }

        for members in self.groups.values_mut() {
            members.remove(uid);
        }
        self.groups.retain(|_, members| !members.is_empty());

        let presence = self.presence.get_state(uid);
        self.presence.remove(uid);
        Some((record, presence))
    }

    fn is_validated(&self, uid: &str) -> bool {
        self.presence
            .get_state(uid)
            .map(|state| state.is_validated())
            .unwrap_or(false)
    }
}

/// Isolate id to address mapping, node address book and group membership.
pub struct PeerDirectory {
    local: LocalIsolate,
    state: Mutex<DirectoryState>,
    events: broadcast::Sender<PresenceEvent>,
}

impl PeerDirectory {
    pub fn new(local: LocalIsolate) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut state = DirectoryState::default();
        state
            .nodes_host
            .insert(local.node.clone(), LOCALHOST.to_string());
        Self {
            local,
            state: Mutex::new(state),
            events,
        }
    }

    pub fn local(&self) -> &LocalIsolate {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: PresenceEvent) {
        debug!("Presence event: {:?}", event);
        // No subscriber is not an error
        let _ = self.events.send(event);
    }

    /// Registers or updates a remote isolate. Returns `true` when the
    /// directory learned something new about it.
    pub fn register_isolate(&self, record: PeerRecord) -> bool {
        if record.uid == self.local.uid {
            debug!("Ignoring registration of the local isolate");
            return false;
        }

        let mut dropped = None;
        let registered = {
            let mut state = self.lock();
            if let Some(host) = &record.host {
                state.set_node_address(&record.node, host);
            }

            let mut stored = PeerRecord {
                host: None,
                ..record
            };

            let known = state
                .peers
                .get(&stored.uid)
                .map(|existing| (existing.node == stored.node, existing.port == stored.port));

            let registered = match known {
                Some((true, same_port)) => {
                    if let Some(existing) = state.peers.get(&stored.uid) {
                        stored.groups.extend(existing.groups.iter().cloned());
                    }
                    !same_port
                }
                Some((false, _)) => {
                    dropped = state.remove(&stored.uid);
                    true
                }
                None => true,
            };

            for group in &stored.groups {
                if let Group::Named(name) = Group::named(group) {
                    state
                        .groups
                        .entry(name)
                        .or_default()
                        .insert(stored.uid.clone());
                }
            }
            state
                .nodes_isolates
                .entry(stored.node.clone())
                .or_default()
                .insert(stored.uid.clone());
            state
                .presence
                .store(&stored.uid, (), PresenceState::Registered);

            if registered {
                debug!(
                    "Registered isolate {} on node {} (port {})",
                    stored.uid, stored.node, stored.port
                );
            }
            state.peers.insert(stored.uid.clone(), stored);
            registered
        };

        if let Some((old, Some(PresenceState::Notified))) = dropped {
            self.publish(PresenceEvent::Unregistered {
                id: old.uid,
                node: old.node,
            });
        }

        registered
    }

    pub fn unregister_isolate(&self, uid: &str) -> bool {
        let removed = self.lock().remove(uid);
        match removed {
            Some((record, presence)) => {
                debug!("Unregistered isolate {}", uid);
                if presence == Some(PresenceState::Notified) {
                    self.publish(PresenceEvent::Unregistered {
                        id: record.uid,
                        node: record.node,
                    });
                }
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, uid: &str) -> bool {
        uid == self.local.uid || self.lock().peers.contains_key(uid)
    }

    /// Sets the host of a node, returning the previous one. Empty or
    /// unchanged hosts are ignored.
    pub fn set_node_address(&self, node: &str, host: &str) -> Option<String> {
        self.lock().set_node_address(node, host)
    }

    pub fn get_host_for_node(&self, node: &str) -> Option<String> {
        self.lock().nodes_host.get(node).cloned()
    }

    pub fn get_all_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.lock().nodes_host.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn get_isolate_node(&self, uid: &str) -> Option<NodeId> {
        if uid == self.local.uid {
            return Some(self.local.node.clone());
        }
        self.lock().peers.get(uid).map(|record| record.node.clone())
    }

    pub fn get_isolate_access(&self, uid: &str) -> Option<PeerAddress> {
        let state = self.lock();
        self.access_locked(&state, uid)
    }

    fn access_locked(&self, state: &DirectoryState, uid: &str) -> Option<PeerAddress> {
        if uid == self.local.uid {
            return Some(PeerAddress::new(LOCALHOST, self.local.port));
        }
        let record = state.peers.get(uid)?;
        match state.nodes_host.get(&record.node) {
            Some(host) => Some(PeerAddress::new(host.clone(), record.port)),
            None => {
                warn!("No known host for node {} of isolate {}", record.node, uid);
                None
            }
        }
    }

    pub fn get_isolates_on_node(&self, node: &str) -> BTreeSet<IsolateId> {
        self.lock()
            .nodes_isolates
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids of the isolates named `name`.
    pub fn get_name_uids(&self, name: &str) -> Vec<IsolateId> {
        let state = self.lock();
        let mut uids: Vec<IsolateId> = state
            .peers
            .values()
            .filter(|record| record.name == name)
            .map(|record| record.uid.clone())
            .collect();
        if self.local.name == name {
            uids.push(self.local.uid.clone());
        }
        uids.sort();
        uids
    }

    pub fn get_all_isolates(
        &self,
        prefix: Option<&str>,
        include_current: bool,
        only_validated: bool,
    ) -> Vec<IsolateId> {
        let state = self.lock();
        self.all_isolates_locked(&state, prefix, include_current, only_validated)
    }

    fn all_isolates_locked(
        &self,
        state: &DirectoryState,
        prefix: Option<&str>,
        include_current: bool,
        only_validated: bool,
    ) -> Vec<IsolateId> {
        let matches = |uid: &str| prefix.map(|p| uid.starts_with(p)).unwrap_or(true);

        let mut uids: Vec<IsolateId> = state
            .peers
            .keys()
            .filter(|uid| matches(uid))
            .filter(|uid| !only_validated || state.is_validated(uid))
            .cloned()
            .collect();
        if include_current && matches(&self.local.uid) {
            uids.push(self.local.uid.clone());
        }
        uids.sort();
        uids
    }

    /// Resolves a group to the accesses of its members. Members whose node
    /// host is unknown are skipped.
    pub fn get_group_accesses(&self, group: &Group) -> BTreeMap<IsolateId, PeerAddress> {
        let state = self.lock();
        let uids: Vec<IsolateId> = match group {
            Group::All => self.all_isolates_locked(&state, None, true, true),
            Group::Others => self.all_isolates_locked(&state, None, false, true),
            Group::Stored => self.all_isolates_locked(&state, None, false, false),
            Group::Current => vec![self.local.uid.clone()],
            Group::Neighbours => state
                .nodes_isolates
                .get(&self.local.node)
                .map(|uids| {
                    uids.iter()
                        .filter(|uid| state.is_validated(uid))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            Group::Named(name) => state
                .groups
                .get(&name.to_uppercase())
                .map(|uids| uids.iter().cloned().collect())
                .unwrap_or_default(),
        };

        uids.into_iter()
            .filter_map(|uid| self.access_locked(&state, &uid).map(|access| (uid, access)))
            .collect()
    }

    pub fn dump(&self) -> DirectoryDump {
        let state = self.lock();
        let mut accesses: BTreeMap<IsolateId, DumpedAccess> = state
            .peers
            .values()
            .map(|record| {
                (
                    record.uid.clone(),
                    DumpedAccess {
                        name: record.name.clone(),
                        node: record.node.clone(),
                        port: record.port,
                    },
                )
            })
            .collect();
        accesses.insert(
            self.local.uid.clone(),
            DumpedAccess {
                name: self.local.name.clone(),
                node: self.local.node.clone(),
                port: self.local.port,
            },
        );

        DirectoryDump {
            accesses,
            // Loopback hosts mean nothing to the receiver
            nodes_host: state
                .nodes_host
                .iter()
                .filter(|(_, host)| host.as_str() != LOCALHOST)
                .map(|(node, host)| (node.clone(), host.clone()))
                .collect(),
        }
    }

    /// Merges a snapshot from another isolate and returns the ids it made
    /// newly known. The local node and isolate are always ignored; peers on
    /// ignored nodes are registered but their node host is left untouched.
    pub fn store_dump(
        &self,
        dump: &DirectoryDump,
        ignored_nodes: &[&str],
        ignored_ids: &[&str],
    ) -> Vec<IsolateId> {
        let mut nodes: HashSet<&str> = ignored_nodes.iter().copied().collect();
        nodes.insert(self.local.node.as_str());

        {
            let mut state = self.lock();
            for (node, host) in &dump.nodes_host {
                if !nodes.contains(node.as_str()) {
                    state.set_node_address(node, host);
                }
            }
        }

        let mut registered = Vec::new();
        for (uid, access) in &dump.accesses {
            if uid == &self.local.uid || ignored_ids.contains(&uid.as_str()) {
                continue;
            }
            let record = PeerRecord::new(uid.as_str(), access.node.as_str(), access.port)
                .with_name(access.name.as_str())
                .with_groups(groups_for(uid));
            if self.register_isolate(record) {
                registered.push(uid.clone());
            }
        }
        registered
    }

    pub fn presence_state(&self, uid: &str) -> Option<PresenceState> {
        self.lock().presence.get_state(uid)
    }

    pub fn is_validated(&self, uid: &str) -> bool {
        uid == self.local.uid || self.lock().is_validated(uid)
    }

    /// Moves a peer to SYNCHRONIZING. Fails once the peer is validated.
    pub fn synchronizing_isolate_presence(&self, uid: &str) -> bool {
        let mut state = self.lock();
        match state.presence.get_state(uid) {
            None => false,
            Some(current) if current.is_validated() => false,
            Some(PresenceState::Synchronizing) => true,
            Some(_) => state
                .presence
                .change_state(uid, PresenceState::Synchronizing)
                .is_ok(),
        }
    }

    /// Moves a peer to VALIDATED. Fails once the peer is notified.
    pub fn validate_isolate_presence(&self, uid: &str) -> bool {
        let mut state = self.lock();
        match state.presence.get_state(uid) {
            None | Some(PresenceState::Notified) => {
                warn!("Can't validate the presence of isolate {}", uid);
                false
            }
            Some(PresenceState::Validated) => true,
            Some(_) => state
                .presence
                .change_state(uid, PresenceState::Validated)
                .is_ok(),
        }
    }

    /// Moves a peer to NOTIFIED and tells presence subscribers about it.
    pub fn notify_isolate_presence(&self, uid: &str) -> bool {
        let node = {
            let mut state = self.lock();
            if let Err(e) = state.presence.change_state(uid, PresenceState::Notified) {
                warn!("Can't notify the presence of isolate {}: {}", uid, e);
                return false;
            }
            state
                .peers
                .get(uid)
                .map(|record| record.node.clone())
                .unwrap_or_default()
        };

        self.publish(PresenceEvent::Registered {
            id: uid.to_string(),
            node,
        });
        true
    }
}
