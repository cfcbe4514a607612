use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::failure::{FailureHandler, FailurePolicy, RestartOutcome, Restarter};
use super::status::IsolateStatus;
use crate::error::WardenError;
use crate::forker::{ForkerEvent, ForkerService};
use crate::transport::{SignalListener, SignalRouter, SignalSender};
use crate::types::signal::{
    StatusReport, SIGNAL_ISOLATE_LOST, SIGNAL_ISOLATE_STATUS, SIGNAL_ISOLATE_STOP,
};
use crate::types::{ForkerStatus, Group, IsolateDescription, IsolateReport, SignalData};

/// Wait between the stop orders and the final stop notices.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// Drives managed isolates through their lifecycle using the forkers.
pub struct Orchestrator {
    forkers: Arc<dyn ForkerService>,
    sender: Arc<dyn SignalSender>,
    status: IsolateStatus,
    failures: Arc<FailureHandler>,
    running: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        forkers: Arc<dyn ForkerService>,
        sender: Arc<dyn SignalSender>,
        status: IsolateStatus,
        policy: FailurePolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|orchestrator: &Weak<Orchestrator>| {
            let restarter: Weak<dyn Restarter> = orchestrator.clone();
            Self {
                forkers,
                sender,
                status,
                failures: Arc::new(FailureHandler::new(policy, restarter)),
                running: AtomicBool::new(true),
            }
        })
    }

    pub fn register_listeners(self: &Arc<Self>, router: &SignalRouter) {
        router.register(SIGNAL_ISOLATE_STATUS, self.clone());
        router.register(SIGNAL_ISOLATE_LOST, self.clone());
    }

    pub fn status(&self) -> &IsolateStatus {
        &self.status
    }

    pub fn failures(&self) -> &Arc<FailureHandler> {
        &self.failures
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Asks the forker of the isolate's node to start it. Returns `true`
    /// when the isolate is loading.
    pub async fn start_isolate(&self, description: &IsolateDescription) -> bool {
        let id = description.id.as_str();
        if !self.is_running() {
            debug!("Platform stopping, not starting {}", id);
            return false;
        }
        if !self.status.isolate_requested(id) {
            return false;
        }

        let result = self.forkers.start_isolate(description).await;
        match result {
            ForkerStatus::Success | ForkerStatus::AlreadyRunning => {
                info!("Isolate {} requested: {}", id, result.describe());
                self.status.isolate_loading(id)
            }
            ForkerStatus::NoProcessRef
            | ForkerStatus::NoWatcher
            | ForkerStatus::RequestTimeout
            | ForkerStatus::RequestNoResult
            | ForkerStatus::RequestError => {
                warn!("Can't start isolate {}: {}", id, result.describe());
                self.forkers.stop_isolate(id).await;
                self.status.isolate_stopped(id);
                false
            }
            ForkerStatus::NoMatchingForker => {
                warn!("Can't start isolate {}: {}", id, result.describe());
                self.status.isolate_stopped(id);
                false
            }
            other => {
                error!(
                    "Isolate {} failed to start ({}): {}",
                    id,
                    other.code(),
                    other.describe()
                );
                false
            }
        }
    }

    pub async fn start_isolate_by_id(&self, id: &str) -> bool {
        if self.status.is_running(id) {
            return true;
        }
        if !self.status.is_waiting(id) {
            warn!("Isolate {} is not managed here", id);
            return false;
        }
        match self.status.description(id) {
            Some(description) => self.start_isolate(&description).await,
            None => false,
        }
    }

    pub async fn stop_isolate(&self, id: &str) {
        info!("Stopping isolate {}", id);
        self.forkers.stop_isolate(id).await;
    }

    /// Starts every waiting isolate of a node. Returns how many are loading.
    pub async fn start_waiting_on_node(&self, node: &str) -> usize {
        let mut started = 0;
        for description in self.status.waiting_for_node(node) {
            if self.start_isolate(&description).await {
                started += 1;
            }
        }
        started
    }

    async fn handle_forker_event(&self, event: ForkerEvent) {
        match event {
            ForkerEvent::Registered { forker, node } => {
                debug!("Forker {} up on {}, starting its isolates", forker, node);
                let started = self.start_waiting_on_node(&node).await;
                if started > 0 {
                    info!("{} isolates started on node {}", started, node);
                }
            }
            ForkerEvent::Unregistered { forker, node } => {
                info!(
                    "Forker {} gone from node {}",
                    forker,
                    node.as_deref().unwrap_or("?")
                );
            }
        }
    }

    /// Reacts to forker events until cancelled.
    pub fn spawn_forker_watcher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let orchestrator = self.clone();
        let mut events = self.forkers.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => orchestrator.handle_forker_event(event).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Missed {} forker events", missed);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("Forker watcher stopped");
        })
    }

    /// Applies a state reported by an isolate about itself.
    pub fn handle_status_report(&self, sender: &str, report: &StatusReport) {
        let id = report.isolate_id.as_deref().unwrap_or(sender);
        let parsed: std::result::Result<IsolateReport, _> =
            serde_json::from_value(Value::String(report.state.clone()));
        let Ok(state) = parsed else {
            warn!("Unknown state {} reported for {}", report.state, id);
            return;
        };

        match state {
            IsolateReport::AgentDone => {
                self.status.isolate_complete(id);
            }
            IsolateReport::FrameworkStopped | IsolateReport::FrameworkStopping => {
                self.status.isolate_stopped(id);
                if self.is_running() {
                    self.escalate(id);
                }
            }
            IsolateReport::Failure => {
                self.status.isolate_stopped(id);
                self.escalate(id);
            }
        }
    }

    pub fn handle_isolate_lost(&self, id: &str) {
        if self.status.isolate_stopped(id) {
            warn!("Managed isolate {} lost", id);
            self.escalate(id);
        }
    }

    /// Hands a managed isolate to the failure policy.
    fn escalate(&self, id: &str) {
        if self.status.state(id).is_none() {
            warn!("Failure of unmanaged isolate {} ignored", id);
            return;
        }
        self.failures.isolate_failed(id);
    }

    /// Stops every managed isolate, then tells forkers and the local
    /// isolate to stop.
    pub async fn stop_platform(&self) {
        self.stop_platform_with_grace(STOP_GRACE).await;
    }

    pub async fn stop_platform_with_grace(&self, grace: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Platform already stopping");
            return;
        }
        info!("Stopping the platform");

        self.failures.stop();
        self.forkers.set_platform_stopping().await;

        for id in self.status.running_ids() {
            self.stop_isolate(&id).await;
        }

        tokio::time::sleep(grace).await;

        self.sender
            .fire_group(SIGNAL_ISOLATE_STOP, Value::Null, &Group::forkers(), &[])
            .await;
        self.sender
            .fire_group(SIGNAL_ISOLATE_STOP, Value::Null, &Group::Current, &[])
            .await;
    }
}

#[async_trait]
impl Restarter for Orchestrator {
    async fn restart(&self, isolate_id: &str) -> RestartOutcome {
        if self.status.state(isolate_id).is_none() {
            return RestartOutcome::Unmanaged;
        }
        if self.start_isolate_by_id(isolate_id).await {
            RestartOutcome::Running
        } else {
            RestartOutcome::Failed
        }
    }
}

#[async_trait]
impl SignalListener for Orchestrator {
    async fn handle_received_signal(&self, name: &str, data: &SignalData) -> Result<Option<Value>> {
        match name {
            SIGNAL_ISOLATE_STATUS => {
                let report: StatusReport = data.content_as(SIGNAL_ISOLATE_STATUS)?;
                self.handle_status_report(&data.sender_uid, &report);
            }
            SIGNAL_ISOLATE_LOST => {
                let lost = data.content.as_str().ok_or_else(|| {
                    WardenError::malformed(SIGNAL_ISOLATE_LOST, "expected an isolate id")
                })?;
                self.handle_isolate_lost(lost);
            }
            other => debug!("Ignoring lifecycle signal {}", other),
        }
        Ok(None)
    }
}
