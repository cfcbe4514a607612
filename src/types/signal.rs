use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CommandId, IsolateDescription, IsolateId, NodeId};
use crate::error::WardenError;

pub const SIGNAL_REGISTER: &str = "/directory/register";
pub const SIGNAL_REGISTER_SYNACK: &str = "/directory/register-synack";
pub const SIGNAL_REGISTER_ACK: &str = "/directory/register-ack";
pub const SIGNAL_DUMP: &str = "/directory/dump";
pub const SIGNAL_CONTACT: &str = "/directory/contact";

pub const SIGNAL_FORKER_HEARTBEAT: &str = "/forker/heartbeat";
pub const SIGNAL_FORKER_START: &str = "/forker/start-isolate";
pub const SIGNAL_FORKER_STOP: &str = "/forker/stop-isolate";
pub const SIGNAL_FORKER_PING: &str = "/forker/ping-isolate";
pub const SIGNAL_FORKER_STOPPING: &str = "/forker/platform-stopping";
pub const SIGNAL_FORKER_RESPONSE: &str = "/forker/response";

pub const SIGNAL_ISOLATE_STATUS: &str = "/isolate/status";
pub const SIGNAL_ISOLATE_LOST: &str = "/isolate/lost";
pub const SIGNAL_ISOLATE_STOP: &str = "/isolate/stop";

/// Envelope of every signal exchanged between isolates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalData {
    pub sender_uid: IsolateId,
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub sender_node: NodeId,
    /// Observed by the receiving side, never trusted from the wire.
    #[serde(skip)]
    pub sender_address: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub content: Value,
}

impl SignalData {
    pub fn new(
        sender_uid: impl Into<String>,
        sender_name: impl Into<String>,
        sender_node: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            sender_uid: sender_uid.into(),
            sender_name: sender_name.into(),
            sender_node: sender_node.into(),
            sender_address: None,
            timestamp: Utc::now(),
            content,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.sender_address = Some(address.into());
        self
    }

    pub fn content_as<T: DeserializeOwned>(&self, signal: &str) -> Result<T, WardenError> {
        serde_json::from_value(self.content.clone())
            .map_err(|e| WardenError::malformed(signal, e.to_string()))
    }
}

/// Body returned by a signal receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalResponse {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub results: Vec<Value>,
}

/// Directory entry announced by an isolate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(alias = "id")]
    pub uid: IsolateId,
    #[serde(default)]
    pub name: String,
    pub node: NodeId,
    #[serde(default)]
    pub address: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub propagate: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortPayload {
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOrder {
    pub cmd_id: CommandId,
    pub isolate_descr: IsolateDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolateOrder {
    pub cmd_id: CommandId,
    pub isolate_id: IsolateId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub cmd_id: CommandId,
    #[serde(default)]
    pub result_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default)]
    pub isolate_id: Option<IsolateId>,
    pub state: String,
}
