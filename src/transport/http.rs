use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{SendMode, SendResult, SignalRouter, SignalSender, StackListener, MODE_HEADER, RECEIVER_PATH};
use crate::directory::{PeerDirectory, LOCALHOST};
use crate::error::WardenError;
use crate::types::{Group, IsolateId, LocalIsolate, PeerAddress, SignalData, SignalResponse};

#[derive(Clone)]
struct Emitter {
    local: LocalIsolate,
    client: reqwest::Client,
    timeout: Duration,
}

impl Emitter {
    fn envelope(&self, content: Value) -> SignalData {
        SignalData::new(
            self.local.uid.as_str(),
            self.local.name.as_str(),
            self.local.node.as_str(),
            content,
        )
    }

    async fn post(
        &self,
        name: &str,
        content: Value,
        access: &PeerAddress,
        mode: SendMode,
    ) -> Result<Vec<Value>, WardenError> {
        let url = format!(
            "http://{}:{}{}{}",
            access.host, access.port, RECEIVER_PATH, name
        );

        let response = self
            .client
            .post(&url)
            .header(MODE_HEADER, mode.as_str())
            .timeout(self.timeout)
            .json(&self.envelope(content))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WardenError::TransportTimeout {
                        target: access.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    WardenError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(WardenError::Transport(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }

        let body: SignalResponse = response
            .json()
            .await
            .map_err(|e| WardenError::Transport(e.to_string()))?;
        Ok(body.results)
    }
}

/// Signal sender posting JSON envelopes to the receivers of other isolates.
/// Signals addressed to the local isolate go straight to its router.
pub struct HttpSignalSender {
    emitter: Emitter,
    directory: Arc<PeerDirectory>,
    router: Arc<SignalRouter>,
    ready: watch::Sender<bool>,
}

impl HttpSignalSender {
    pub fn new(directory: Arc<PeerDirectory>, router: Arc<SignalRouter>, timeout: Duration) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            emitter: Emitter {
                local: directory.local().clone(),
                client: reqwest::Client::new(),
                timeout,
            },
            directory,
            router,
            ready,
        }
    }

    /// Releases the signals stacked so far.
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    fn is_local(&self, uid: &str) -> bool {
        uid == self.emitter.local.uid
    }

    fn resolve(&self, targets: &[IsolateId]) -> Vec<(IsolateId, Option<PeerAddress>)> {
        targets
            .iter()
            .map(|uid| (uid.clone(), self.directory.get_isolate_access(uid)))
            .collect()
    }

    fn resolve_group(&self, group: &Group, excluded: &[IsolateId]) -> Vec<(IsolateId, Option<PeerAddress>)> {
        self.directory
            .get_group_accesses(group)
            .into_iter()
            .filter(|(uid, _)| !excluded.contains(uid))
            .map(|(uid, access)| (uid, Some(access)))
            .collect()
    }

    async fn deliver_local(&self, name: &str, content: Value, mode: SendMode) -> Vec<Value> {
        let data = self.emitter.envelope(content).with_address(LOCALHOST);
        match mode {
            SendMode::Forget => {
                let router = self.router.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    router.dispatch(&name, &data).await;
                });
                Vec::new()
            }
            SendMode::Send => self.router.dispatch(name, &data).await.unwrap_or_default(),
        }
    }

    async fn fire_resolved(
        &self,
        name: &str,
        content: Value,
        targets: Vec<(IsolateId, Option<PeerAddress>)>,
    ) -> Vec<IsolateId> {
        let mut fired = Vec::new();
        for (uid, access) in targets {
            if self.is_local(&uid) {
                self.deliver_local(name, content.clone(), SendMode::Forget).await;
                fired.push(uid);
                continue;
            }

            let Some(access) = access else {
                warn!("Can't fire {} to {}: unknown access", name, uid);
                continue;
            };

            let emitter = self.emitter.clone();
            let name = name.to_string();
            let content = content.clone();
            let target = uid.clone();
            tokio::spawn(async move {
                if let Err(e) = emitter.post(&name, content, &access, SendMode::Forget).await {
                    debug!("Fired signal {} to {} failed: {}", name, target, e);
                }
            });
            fired.push(uid);
        }
        fired
    }

    async fn send_resolved(
        &self,
        name: &str,
        content: Value,
        targets: Vec<(IsolateId, Option<PeerAddress>)>,
    ) -> SendResult {
        let calls = targets.into_iter().map(|(uid, access)| {
            let content = content.clone();
            async move {
                let outcome = if self.is_local(&uid) {
                    Ok(self.deliver_local(name, content, SendMode::Send).await)
                } else {
                    match access {
                        Some(access) => self.emitter.post(name, content, &access, SendMode::Send).await,
                        None => Err(WardenError::InvalidId(uid.clone())),
                    }
                };
                (uid, outcome)
            }
        });

        let mut result = SendResult::default();
        for (uid, outcome) in join_all(calls).await {
            match outcome {
                Ok(values) => {
                    result.results.insert(uid, values);
                }
                Err(e) => {
                    warn!("Sending {} to {} failed: {}", name, uid, e);
                    result.failed.push(uid);
                }
            }
        }
        result
    }
}

#[async_trait]
impl SignalSender for HttpSignalSender {
    async fn fire(&self, name: &str, content: Value, targets: &[IsolateId]) -> Vec<IsolateId> {
        let resolved = self.resolve(targets);
        self.fire_resolved(name, content, resolved).await
    }

    async fn send(&self, name: &str, content: Value, targets: &[IsolateId]) -> SendResult {
        let resolved = self.resolve(targets);
        self.send_resolved(name, content, resolved).await
    }

    async fn send_to(
        &self,
        name: &str,
        content: Value,
        access: &PeerAddress,
    ) -> Result<Vec<Value>, WardenError> {
        self.emitter.post(name, content, access, SendMode::Send).await
    }

    async fn fire_group(
        &self,
        name: &str,
        content: Value,
        group: &Group,
        excluded: &[IsolateId],
    ) -> Vec<IsolateId> {
        let resolved = self.resolve_group(group, excluded);
        self.fire_resolved(name, content, resolved).await
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
        mode: SendMode,
        ttl: Duration,
        access: PeerAddress,
    ) {
        let emitter = self.emitter.clone();
        let mut ready = self.ready.subscribe();
        let name = name.to_string();

        tokio::spawn(async move {
            let became_ready = tokio::time::timeout(ttl, ready.wait_for(|ready| *ready))
                .await
                .map(|waited| waited.is_ok())
                .unwrap_or(false);

            let results = if became_ready {
                match emitter.post(&name, content, &access, mode).await {
                    Ok(results) => Some(results),
                    Err(e) => {
                        warn!("Stacked signal {} to {} failed: {}", name, access, e);
                        None
                    }
                }
            } else {
                warn!("Stacked signal {} to {} expired", name, access);
                None
            };

            listener.handle_stacked_result(&name, results).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::transport::SignalListener;

    struct EchoListener;

    #[async_trait]
    impl SignalListener for EchoListener {
        async fn handle_received_signal(
            &self,
            _name: &str,
            data: &SignalData,
        ) -> Result<Option<Value>> {
            Ok(Some(data.content.clone()))
        }
    }

    struct RecordingStack {
        outcome: Mutex<Option<Option<Vec<Value>>>>,
    }

    #[async_trait]
    impl StackListener for RecordingStack {
        async fn handle_stacked_result(&self, _name: &str, results: Option<Vec<Value>>) {
            *self.outcome.lock().unwrap() = Some(results);
        }
    }

    fn create_test_sender() -> HttpSignalSender {
        let directory = Arc::new(PeerDirectory::new(LocalIsolate::new(
            "monitor-local",
            "node-local",
            8000,
        )));
        let router = Arc::new(SignalRouter::new());
        router.register("/test/*", Arc::new(EchoListener));
        HttpSignalSender::new(directory, router, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_send_to_self_uses_router() {
        let sender = create_test_sender();

        let result = sender
            .send("/test/echo", json!({"x": 1}), &["monitor-local".to_string()])
            .await;

        assert!(result.failed.is_empty());
        assert_eq!(result.results["monitor-local"], vec![json!({"x": 1})]);
    }

    #[tokio::test]
    async fn test_unknown_targets_fail() {
        let sender = create_test_sender();

        let result = sender
            .send("/test/echo", Value::Null, &["ghost".to_string()])
            .await;
        assert_eq!(result.failed, vec!["ghost".to_string()]);

        let fired = sender
            .fire("/test/echo", Value::Null, &["ghost".to_string()])
            .await;
        assert!(fired.is_empty());
    }

    #[tokio::test]
    async fn test_current_group_is_local() {
        let sender = create_test_sender();

        let result = sender
            .send_group("/test/echo", json!("hi"), &Group::Current, &[])
            .await;
        assert_eq!(result.results["monitor-local"], vec![json!("hi")]);

        let fired = sender
            .fire_group("/test/echo", json!("hi"), &Group::Current, &["monitor-local".to_string()])
            .await;
        assert!(fired.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stacked_signal_expires_when_never_ready() {
        let sender = create_test_sender();
        let listener = Arc::new(RecordingStack {
            outcome: Mutex::new(None),
        });

        sender.stack_to(
            "/directory/dump",
            Value::Null,
            listener.clone(),
            SendMode::Send,
            Duration::from_secs(1),
            PeerAddress::new(LOCALHOST, 1),
        );

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*listener.outcome.lock().unwrap(), Some(None));
    }
}
