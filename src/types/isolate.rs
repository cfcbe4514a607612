use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{IsolateId, NodeId};

/// Static description of a managed isolate, sent as-is to the forker that
/// launches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolateDescription {
    pub id: IsolateId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node: NodeId,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl IsolateDescription {
    pub fn new(id: impl Into<String>, node: impl Into<String>, kind: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            node: node.into(),
            kind: kind.into(),
            parameters: Map::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// State an isolate reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolateReport {
    AgentDone,         // Every component is up
    FrameworkStopped,  // Runtime is gone
    FrameworkStopping, // Runtime is going down
    Failure,           // Runtime failed
}
