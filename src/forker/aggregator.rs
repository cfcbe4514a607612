use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::pending::next_command_id;
use super::{ForkerEvent, ForkerService, LivenessTable, PendingCommands, WaitOutcome};
use crate::directory::{PeerDirectory, PeerRecord};
use crate::transport::{SignalListener, SignalRouter, SignalSender};
use crate::types::signal::{
    IsolateOrder, OrderResponse, PortPayload, StartOrder, SIGNAL_CONTACT, SIGNAL_FORKER_HEARTBEAT,
    SIGNAL_FORKER_PING, SIGNAL_FORKER_RESPONSE, SIGNAL_FORKER_START, SIGNAL_FORKER_STOP,
    SIGNAL_FORKER_STOPPING,
};
use crate::types::{CommandId, ForkerStatus, Group, IsolateDescription, IsolateId, SignalData};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct ForkerTimings {
    /// Silence after which a forker is evicted.
    pub ttl: Duration,
    pub scan_period: Duration,
    /// Bounded wait on start and ping replies.
    pub request_timeout: Duration,
}

impl Default for ForkerTimings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(5000),
            scan_period: Duration::from_secs(1),
            request_timeout: Duration::from_millis(1000),
        }
    }
}

/// Tracks forker heartbeats and sends them correlated orders.
pub struct ForkerAggregator {
    directory: Arc<PeerDirectory>,
    sender: Arc<dyn SignalSender>,
    timings: ForkerTimings,
    liveness: Mutex<LivenessTable>,
    ownership: Mutex<HashMap<IsolateId, IsolateId>>,
    pending: PendingCommands,
    events: broadcast::Sender<ForkerEvent>,
}

impl ForkerAggregator {
    pub fn new(
        directory: Arc<PeerDirectory>,
        sender: Arc<dyn SignalSender>,
        timings: ForkerTimings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            directory,
            sender,
            liveness: Mutex::new(LivenessTable::new(timings.ttl)),
            timings,
            ownership: Mutex::new(HashMap::new()),
            pending: PendingCommands::new(),
            events,
        }
    }

    pub fn register_listeners(self: &Arc<Self>, router: &SignalRouter) {
        router.register(SIGNAL_FORKER_HEARTBEAT, self.clone());
        router.register(SIGNAL_FORKER_RESPONSE, self.clone());
    }

    fn liveness(&self) -> MutexGuard<'_, LivenessTable> {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ownership(&self) -> MutexGuard<'_, HashMap<IsolateId, IsolateId>> {
        self.ownership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: ForkerEvent) {
        debug!("Forker event: {:?}", event);
        let _ = self.events.send(event);
    }

    pub fn is_alive(&self, forker: &str) -> bool {
        self.liveness().contains(forker)
    }

    pub fn owner_of(&self, isolate_id: &str) -> Option<IsolateId> {
        self.ownership().get(isolate_id).cloned()
    }

    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }

    /// Handles a heartbeat, from a signal or a multicast beat. Returns
    /// `true` when the forker was registered by this beat.
    pub async fn handle_heartbeat(
        &self,
        forker: &str,
        node: &str,
        host: Option<&str>,
        port: Option<u16>,
    ) -> bool {
        let is_new = self.liveness().touch(forker, Instant::now());
        if !is_new {
            return false;
        }

        let Some(port) = port else {
            warn!("Heartbeat from new forker {} without a port", forker);
            // Next beat retries the registration
            self.liveness().forget(forker);
            return false;
        };

        self.register_forker(forker, node, host, port).await;
        true
    }

    async fn register_forker(&self, forker: &str, node: &str, host: Option<&str>, port: u16) {
        let local = self.directory.local();
        if node != local.node {
            if let Some(host) = host {
                self.directory.set_node_address(node, host);
            }
        }

        let record = PeerRecord::new(forker, node, port).with_groups([Group::FORKERS]);
        if self.directory.register_isolate(record) {
            let content = json!({ "port": local.port });
            let contacted = self
                .sender
                .fire(SIGNAL_CONTACT, content, &[forker.to_string()])
                .await;
            if contacted.is_empty() {
                warn!("Could not contact forker {}", forker);
            }
        }

        info!("Forker {} registered on node {}", forker, node);
        self.publish(ForkerEvent::Registered {
            forker: forker.to_string(),
            node: node.to_string(),
        });
    }

    /// Evicts the forkers silent for at least the TTL.
    pub fn evict_expired(&self, now: Instant) -> Vec<IsolateId> {
        let expired = self.liveness().expired(now);
        for forker in &expired {
            warn!("Forker {} missed its heartbeats", forker);
            self.unregister_forker(forker);
        }
        expired
    }

    /// Removes a forker and every isolate of its node from the directory.
    pub fn unregister_forker(&self, forker: &str) {
        let node = self.directory.get_isolate_node(forker);

        if self.directory.unregister_isolate(forker) {
            self.publish(ForkerEvent::Unregistered {
                forker: forker.to_string(),
                node: node.clone(),
            });
        }

        if let Some(node) = node {
            for isolate in self.directory.get_isolates_on_node(&node) {
                self.ownership().remove(&isolate);
                self.directory.unregister_isolate(&isolate);
            }
        }
        self.ownership().retain(|_, owner| owner != forker);
    }

    /// Spawns the periodic TTL scan.
    pub fn spawn_ttl_scanner(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.timings.scan_period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        aggregator.evict_expired(Instant::now());
                    }
                }
            }
            debug!("Forker TTL scanner stopped");
        })
    }

    /// First forker registered on a node.
    fn forker_on_node(&self, node: &str) -> Option<IsolateId> {
        let forkers = self.directory.get_group_accesses(&Group::forkers());
        self.directory
            .get_isolates_on_node(node)
            .into_iter()
            .find(|uid| forkers.contains_key(uid))
    }

    async fn order(&self, name: &str, cmd_id: CommandId, content: Value, forker: &str) -> WaitOutcome {
        let fired = self.sender.fire(name, content, &[forker.to_string()]).await;
        if fired.is_empty() {
            self.pending.discard(cmd_id);
            return WaitOutcome::Failed(format!("forker {} is unreachable", forker));
        }
        self.pending.wait(cmd_id, self.timings.request_timeout).await
    }

    fn encode<T: Serialize>(signal: &str, order: &T) -> Option<Value> {
        serde_json::to_value(order)
            .map_err(|e| warn!("Can't serialize {} order: {}", signal, e))
            .ok()
    }

    fn outcome_status(outcome: WaitOutcome) -> ForkerStatus {
        match outcome {
            WaitOutcome::Completed(Some(code)) => ForkerStatus::from_code(code),
            WaitOutcome::Completed(None) => ForkerStatus::RequestNoResult,
            WaitOutcome::TimedOut => ForkerStatus::RequestTimeout,
            WaitOutcome::Failed(reason) => {
                warn!("Forker order failed: {}", reason);
                ForkerStatus::RequestError
            }
        }
    }

    fn handle_response(&self, data: &SignalData) -> Result<()> {
        let response: OrderResponse = data.content_as(SIGNAL_FORKER_RESPONSE)?;
        if !self.pending.complete(response.cmd_id, response.result_code) {
            debug!(
                "Late or unknown reply {} from {}",
                response.cmd_id, data.sender_uid
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ForkerService for ForkerAggregator {
    async fn start_isolate(&self, description: &IsolateDescription) -> ForkerStatus {
        let node = if description.node.is_empty() {
            self.directory.local().node.clone()
        } else {
            description.node.clone()
        };

        let Some(forker) = self.forker_on_node(&node) else {
            warn!("No forker on node {} for isolate {}", node, description.id);
            return ForkerStatus::NoMatchingForker;
        };

        self.ownership()
            .insert(description.id.clone(), forker.clone());

        let cmd_id = self.pending.create();
        let order = StartOrder {
            cmd_id,
            isolate_descr: description.clone(),
        };
        let Some(content) = Self::encode(SIGNAL_FORKER_START, &order) else {
            self.pending.discard(cmd_id);
            return ForkerStatus::RequestError;
        };

        debug!("Start order {} for {} sent to {}", cmd_id, description.id, forker);
        let outcome = self.order(SIGNAL_FORKER_START, cmd_id, content, &forker).await;
        Self::outcome_status(outcome)
    }

    async fn stop_isolate(&self, isolate_id: &str) {
        let Some(forker) = self.owner_of(isolate_id) else {
            warn!("No forker owns isolate {}", isolate_id);
            return;
        };

        let order = IsolateOrder {
            cmd_id: next_command_id(),
            isolate_id: isolate_id.to_string(),
        };
        if let Some(content) = Self::encode(SIGNAL_FORKER_STOP, &order) {
            self.sender.fire(SIGNAL_FORKER_STOP, content, &[forker]).await;
        }
    }

    async fn ping(&self, isolate_id: &str) -> ForkerStatus {
        let Some(forker) = self.owner_of(isolate_id) else {
            return ForkerStatus::NoMatchingForker;
        };

        let cmd_id = self.pending.create();
        let order = IsolateOrder {
            cmd_id,
            isolate_id: isolate_id.to_string(),
        };
        let Some(content) = Self::encode(SIGNAL_FORKER_PING, &order) else {
            self.pending.discard(cmd_id);
            return ForkerStatus::RequestError;
        };
        let outcome = self.order(SIGNAL_FORKER_PING, cmd_id, content, &forker).await;
        Self::outcome_status(outcome)
    }

    async fn set_platform_stopping(&self) {
        let notified = self
            .sender
            .fire_group(SIGNAL_FORKER_STOPPING, Value::Null, &Group::forkers(), &[])
            .await;
        info!("Platform stopping notice sent to {} forkers", notified.len());
    }

    fn subscribe(&self) -> broadcast::Receiver<ForkerEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl SignalListener for ForkerAggregator {
    async fn handle_received_signal(&self, name: &str, data: &SignalData) -> Result<Option<Value>> {
        match name {
            SIGNAL_FORKER_HEARTBEAT => {
                let payload: PortPayload = data.content_as(SIGNAL_FORKER_HEARTBEAT)?;
                self.handle_heartbeat(
                    &data.sender_uid,
                    &data.sender_node,
                    data.sender_address.as_deref(),
                    payload.port,
                )
                .await;
            }
            SIGNAL_FORKER_RESPONSE => self.handle_response(data)?,
            other => debug!("Ignoring forker signal {}", other),
        }
        Ok(None)
    }
}
