//! In-memory signal network shared by the integration tests.
//!
//! Every peer is reached by its port. Fired signals are delivered on a
//! spawned task, like the HTTP transport does, while blocking sends are
//! dispatched inline.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden::directory::{PeerDirectory, PeerRecord};
use warden::transport::{
    SendMode, SendResult, SignalListener, SignalRouter, SignalSender, StackListener,
};
use warden::types::signal::{
    SIGNAL_FORKER_HEARTBEAT, SIGNAL_FORKER_PING, SIGNAL_FORKER_RESPONSE, SIGNAL_FORKER_START,
};
use warden::types::{Group, IsolateId, LocalIsolate, PeerAddress, SignalData};
use warden::WardenError;

#[derive(Default)]
pub struct Network {
    routers: Mutex<HashMap<u16, Arc<SignalRouter>>>,
    unplugged: Mutex<HashSet<u16>>,
}

/// One isolate attached to the network.
pub struct Peer {
    pub directory: Arc<PeerDirectory>,
    pub router: Arc<SignalRouter>,
    pub sender: Arc<MemorySender>,
}

impl Peer {
    pub fn uid(&self) -> &str {
        &self.directory.local().uid
    }

    pub fn port(&self) -> u16 {
        self.directory.local().port
    }

    pub fn address(&self) -> &str {
        &self.sender.address
    }

    /// Record other peers can use to reach this one.
    pub fn record(&self) -> PeerRecord {
        let local = self.directory.local();
        PeerRecord::new(local.uid.as_str(), local.node.as_str(), local.port)
            .with_name(local.name.as_str())
            .with_groups(local.groups())
            .with_host(self.address())
    }
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches an isolate. `address` is what receivers observe as its host.
    pub fn join(self: &Arc<Self>, uid: &str, node: &str, port: u16, address: &str) -> Peer {
        let directory = Arc::new(PeerDirectory::new(LocalIsolate::new(uid, node, port)));
        let router = Arc::new(SignalRouter::new());
        self.routers
            .lock()
            .unwrap()
            .insert(port, router.clone());
        let sender = Arc::new(MemorySender {
            local: directory.local().clone(),
            address: address.to_string(),
            directory: directory.clone(),
            network: self.clone(),
        });
        Peer {
            directory,
            router,
            sender,
        }
    }

    /// Makes a peer unreachable.
    pub fn unplug(&self, port: u16) {
        self.unplugged.lock().unwrap().insert(port);
    }

    fn router(&self, port: u16) -> Option<Arc<SignalRouter>> {
        if self.unplugged.lock().unwrap().contains(&port) {
            return None;
        }
        self.routers.lock().unwrap().get(&port).cloned()
    }
}

#[derive(Clone)]
pub struct MemorySender {
    local: LocalIsolate,
    address: String,
    directory: Arc<PeerDirectory>,
    network: Arc<Network>,
}

impl MemorySender {
    async fn deliver(
        &self,
        name: &str,
        content: Value,
        port: u16,
    ) -> Result<Vec<Value>, WardenError> {
        let router = self
            .network
            .router(port)
            .ok_or_else(|| WardenError::Transport(format!("nothing listens on port {}", port)))?;
        let data = SignalData::new(
            self.local.uid.as_str(),
            self.local.name.as_str(),
            self.local.node.as_str(),
            content,
        )
        .with_address(self.address.as_str());
        Ok(router.dispatch(name, &data).await.unwrap_or_default())
    }

    fn spawn_delivery(&self, name: &str, content: Value, port: u16) {
        let sender = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let _ = sender.deliver(&name, content, port).await;
        });
    }

    fn resolve(&self, targets: &[IsolateId]) -> Vec<(IsolateId, u16)> {
        targets
            .iter()
            .filter_map(|uid| {
                self.directory
                    .get_isolate_access(uid)
                    .map(|access| (uid.clone(), access.port))
            })
            .collect()
    }

    fn resolve_group(&self, group: &Group, excluded: &[IsolateId]) -> Vec<(IsolateId, u16)> {
        self.directory
            .get_group_accesses(group)
            .into_iter()
            .filter(|(uid, _)| !excluded.contains(uid))
            .map(|(uid, access)| (uid, access.port))
            .collect()
    }

    fn fire_resolved(&self, name: &str, content: Value, targets: Vec<(IsolateId, u16)>) -> Vec<IsolateId> {
        targets
            .into_iter()
            .filter(|(_, port)| self.network.router(*port).is_some())
            .map(|(uid, port)| {
                self.spawn_delivery(name, content.clone(), port);
                uid
            })
            .collect()
    }

    async fn send_resolved(
        &self,
        name: &str,
        content: Value,
        targets: Vec<(IsolateId, u16)>,
    ) -> SendResult {
        let mut result = SendResult::default();
        for (uid, port) in targets {
            match self.deliver(name, content.clone(), port).await {
                Ok(values) => {
                    result.results.insert(uid, values);
                }
                Err(_) => result.failed.push(uid),
            }
        }
        result
    }
}

#[async_trait]
impl SignalSender for MemorySender {
    async fn fire(&self, name: &str, content: Value, targets: &[IsolateId]) -> Vec<IsolateId> {
        let resolved = self.resolve(targets);
        self.fire_resolved(name, content, resolved)
    }

    async fn send(&self, name: &str, content: Value, targets: &[IsolateId]) -> SendResult {
        let mut result = SendResult::default();
        let resolved = self.resolve(targets);
        for uid in targets {
            if !resolved.iter().any(|(known, _)| known == uid) {
                result.failed.push(uid.clone());
            }
        }
        let sent = self.send_resolved(name, content, resolved).await;
        result.results.extend(sent.results);
        result.failed.extend(sent.failed);
        result
    }

    async fn send_to(
        &self,
        name: &str,
        content: Value,
        access: &PeerAddress,
    ) -> Result<Vec<Value>, WardenError> {
        self.deliver(name, content, access.port).await
    }

    async fn fire_group(
        &self,
        name: &str,
        content: Value,
        group: &Group,
        excluded: &[IsolateId],
    ) -> Vec<IsolateId> {
        let resolved = self.resolve_group(group, excluded);
        self.fire_resolved(name, content, resolved)
    }

    async fn send_group(
        &self,
        name: &str,
        content: Value,
        group: &Group,
        excluded: &[IsolateId],
    ) -> SendResult {
        let resolved = self.resolve_group(group, excluded);
        self.send_resolved(name, content, resolved).await
    }

    fn stack_to(
        &self,
        name: &str,
        content: Value,
        listener: Arc<dyn StackListener>,
        _mode: SendMode,
        _ttl: Duration,
        access: PeerAddress,
    ) {
        let this = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let results = this.deliver(&name, content, access.port).await.ok();
            listener.handle_stacked_result(&name, results).await;
        });
    }
}

/// Forker answering start and ping orders with a fixed code, or not at all.
pub struct FakeForker {
    pub peer: Peer,
    monitor: PeerAddress,
    reply: Mutex<Option<i32>>,
    received: Mutex<Vec<(String, Value)>>,
}

impl FakeForker {
    pub fn attach(peer: Peer, monitor: PeerAddress, reply: Option<i32>) -> Arc<Self> {
        let forker = Arc::new(Self {
            peer,
            monitor,
            reply: Mutex::new(reply),
            received: Mutex::new(Vec::new()),
        });
        forker.peer.router.register("/forker/*", forker.clone());
        forker.peer.router.register("/directory/*", forker.clone());
        forker.peer.router.register("/isolate/*", forker.clone());
        forker
    }

    pub fn set_reply(&self, reply: Option<i32>) {
        *self.reply.lock().unwrap() = reply;
    }

    /// Contents of the signals received under `name`.
    pub fn received(&self, name: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(received, _)| received == name)
            .map(|(_, content)| content.clone())
            .collect()
    }

    pub async fn heartbeat(&self) {
        self.peer
            .sender
            .send_to(
                SIGNAL_FORKER_HEARTBEAT,
                json!({ "port": self.peer.port() }),
                &self.monitor,
            )
            .await
            .unwrap();
    }

    pub async fn respond(&self, cmd_id: &Value, code: i32) {
        self.peer
            .sender
            .send_to(
                SIGNAL_FORKER_RESPONSE,
                json!({ "cmdId": cmd_id, "resultCode": code }),
                &self.monitor,
            )
            .await
            .unwrap();
    }
}

#[async_trait]
impl SignalListener for FakeForker {
    async fn handle_received_signal(
        &self,
        name: &str,
        data: &SignalData,
    ) -> anyhow::Result<Option<Value>> {
        self.received
            .lock()
            .unwrap()
            .push((name.to_string(), data.content.clone()));

        let reply = *self.reply.lock().unwrap();
        if name == SIGNAL_FORKER_START || name == SIGNAL_FORKER_PING {
            if let Some(code) = reply {
                self.respond(&data.content["cmdId"], code).await;
            }
        }
        Ok(None)
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// Runs `future` with a five second deadline.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("deadline exceeded")
}
