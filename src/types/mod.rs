pub mod isolate;
pub mod signal;

pub use isolate::{IsolateDescription, IsolateReport};
pub use signal::{SignalData, SignalResponse};

use serde::{Deserialize, Serialize};
use std::fmt;

pub type IsolateId = String;
pub type NodeId = String;
pub type CommandId = i64;

/// Ids starting with this prefix belong to coordinating isolates.
pub const MONITOR_PREFIX: &str = "monitor";
/// Ids starting with this prefix belong to forkers.
pub const FORKER_PREFIX: &str = "forker";

pub fn is_monitor(id: &str) -> bool {
    id.starts_with(MONITOR_PREFIX)
}

pub fn is_forker(id: &str) -> bool {
    id.starts_with(FORKER_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity of the isolate running this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIsolate {
    pub uid: IsolateId,
    pub name: String,
    pub node: NodeId,
    pub port: u16,
}

impl LocalIsolate {
    pub fn new(uid: impl Into<String>, node: impl Into<String>, port: u16) -> Self {
        let uid = uid.into();
        Self {
            name: uid.clone(),
            uid,
            node: node.into(),
            port,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Groups announced in this isolate's registrations.
    pub fn groups(&self) -> Vec<String> {
        groups_for(&self.uid)
    }
}

/// Default groups of an isolate, derived from its id.
pub fn groups_for(uid: &str) -> Vec<String> {
    let mut groups = vec![Group::All.as_str().to_string()];
    if is_forker(uid) {
        groups.push(Group::FORKERS.to_string());
    } else {
        groups.push(Group::ISOLATES.to_string());
    }
    if is_monitor(uid) {
        groups.push(Group::MONITORS.to_string());
    }
    groups
}

/// Broadcast target resolved by the peer directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Group {
    All,        // Every known peer, self included
    Others,     // Every known peer but self
    Stored,     // Every stored peer, whatever its presence state
    Current,    // Self only
    Neighbours, // Peers sharing the local node
    Named(String),
}

impl Group {
    pub const FORKERS: &'static str = "FORKERS";
    pub const MONITORS: &'static str = "MONITORS";
    pub const ISOLATES: &'static str = "ISOLATES";

    pub fn named(name: &str) -> Self {
        match name.to_uppercase().as_str() {
            "ALL" => Group::All,
            "OTHERS" => Group::Others,
            "STORED" => Group::Stored,
            "CURRENT" => Group::Current,
            "NEIGHBOURS" => Group::Neighbours,
            other => Group::Named(other.to_string()),
        }
    }

    pub fn forkers() -> Self {
        Group::Named(Self::FORKERS.to_string())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Group::All => "ALL",
            Group::Others => "OTHERS",
            Group::Stored => "STORED",
            Group::Current => "CURRENT",
            Group::Neighbours => "NEIGHBOURS",
            Group::Named(name) => name,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result code of a forker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForkerStatus {
    Success,
    AlreadyRunning,
    NoProcessRef,
    NoWatcher,
    RunnerException,
    UnknownKind,
    NoMatchingForker,
    RequestTimeout,
    RequestNoResult,
    RequestError,
    Unknown(i32),
}

impl ForkerStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ForkerStatus::Success,
            1 => ForkerStatus::AlreadyRunning,
            2 => ForkerStatus::NoProcessRef,
            3 => ForkerStatus::NoWatcher,
            4 => ForkerStatus::RunnerException,
            5 => ForkerStatus::UnknownKind,
            -20 => ForkerStatus::NoMatchingForker,
            -21 => ForkerStatus::RequestTimeout,
            -22 => ForkerStatus::RequestNoResult,
            -23 => ForkerStatus::RequestError,
            other => ForkerStatus::Unknown(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ForkerStatus::Success => 0,
            ForkerStatus::AlreadyRunning => 1,
            ForkerStatus::NoProcessRef => 2,
            ForkerStatus::NoWatcher => 3,
            ForkerStatus::RunnerException => 4,
            ForkerStatus::UnknownKind => 5,
            ForkerStatus::NoMatchingForker => -20,
            ForkerStatus::RequestTimeout => -21,
            ForkerStatus::RequestNoResult => -22,
            ForkerStatus::RequestError => -23,
            ForkerStatus::Unknown(code) => *code,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ForkerStatus::Success => "isolate started".to_string(),
            ForkerStatus::AlreadyRunning => "isolate already running".to_string(),
            ForkerStatus::NoProcessRef => "forker kept no reference to the process".to_string(),
            ForkerStatus::NoWatcher => "forker could not watch the process".to_string(),
            ForkerStatus::RunnerException => "isolate runner raised an error".to_string(),
            ForkerStatus::UnknownKind => "isolate kind not handled by the forker".to_string(),
            ForkerStatus::NoMatchingForker => "no forker on the isolate's node".to_string(),
            ForkerStatus::RequestTimeout => "forker did not answer in time".to_string(),
            ForkerStatus::RequestNoResult => "forker answered without a result".to_string(),
            ForkerStatus::RequestError => "order could not be sent".to_string(),
            ForkerStatus::Unknown(code) => format!("unknown forker result {}", code),
        }
    }
}
