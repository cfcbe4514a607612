pub mod http;
pub mod router;

pub use http::HttpSignalSender;
pub use router::SignalRouter;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::WardenError;
use crate::types::{Group, IsolateId, PeerAddress, SignalData};

/// HTTP header carrying the delivery mode of a signal.
pub const MODE_HEADER: &str = "warden-mode";
/// Path prefix of the signal receiver.
pub const RECEIVER_PATH: &str = "/signal-receiver";

/// Whether the receiver should answer before or after handling a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Send,
    Forget,
}

impl SendMode {
    pub fn as_str(&self) -> &str {
        match self {
            SendMode::Send => "send",
            SendMode::Forget => "forget",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("forget") {
            SendMode::Forget
        } else {
            SendMode::Send
        }
    }
}

/// Per-target outcome of a blocking send.
#[derive(Debug, Clone, Default)]
pub struct SendResult {
    pub results: BTreeMap<IsolateId, Vec<Value>>,
    pub failed: Vec<IsolateId>,
}

impl SendResult {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty() && self.failed.is_empty()
    }
}

/// Handles signals delivered to the local isolate. A returned value is
/// part of the reply sent back to the emitter.
#[async_trait]
pub trait SignalListener: Send + Sync {
    async fn handle_received_signal(&self, name: &str, data: &SignalData)
        -> Result<Option<Value>>;
}

/// Told about the outcome of a deferred send.
#[async_trait]
pub trait StackListener: Send + Sync {
    /// `None` when the signal could not be sent before its time to live.
    async fn handle_stacked_result(&self, name: &str, results: Option<Vec<Value>>);
}

/// Outbound side of the signal transport.
#[async_trait]
pub trait SignalSender: Send + Sync {
    /// Sends without waiting for replies. Returns the targets the signal
    /// was dispatched to.
    async fn fire(&self, name: &str, content: Value, targets: &[IsolateId]) -> Vec<IsolateId>;

    async fn send(&self, name: &str, content: Value, targets: &[IsolateId]) -> SendResult;

    /// Direct call to an address, bypassing the directory.
    async fn send_to(
        &self,
        name: &str,
        content: Value,
        access: &PeerAddress,
    ) -> std::result::Result<Vec<Value>, WardenError>;

    async fn fire_group(
        &self,
        name: &str,
        content: Value,
        group: &Group,
        excluded: &[IsolateId],
    ) -> Vec<IsolateId>;

    async fn send_group(
        &self,
        name: &str,
        content: Value,
        group: &Group,
        excluded: &[IsolateId],
    ) -> SendResult;

    /// Queues a send until the transport is ready or `ttl` expires.
    fn stack_to(
        &self,
        name: &str,
        content: Value,
        listener: Arc<dyn StackListener>,
        mode: SendMode,
        ttl: Duration,
        access: PeerAddress,
    );
}
