use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::directory::{PeerDirectory, RegistrationEngine};
use crate::discovery::{spawn_beat_emitter, Beat, BeatReceiver};
use crate::forker::ForkerAggregator;
use crate::lifecycle::{IsolateStatus, Orchestrator};
use crate::transport::{HttpSignalSender, SignalListener, SignalRouter};
use crate::types::signal::SIGNAL_ISOLATE_STOP;
use crate::types::SignalData;

/// Bounded wait on each background worker at shutdown.
pub const WORKER_GRACE: Duration = Duration::from_secs(1);

/// Cancels the platform when the local isolate is told to stop.
struct StopListener {
    cancel: CancellationToken,
}

#[async_trait]
impl SignalListener for StopListener {
    async fn handle_received_signal(&self, _name: &str, data: &SignalData) -> Result<Option<Value>> {
        info!("Stop requested by {}", data.sender_uid);
        self.cancel.cancel();
        Ok(None)
    }
}

/// Every component of a monitor, built in dependency order.
pub struct Platform {
    config: Config,
    directory: Arc<PeerDirectory>,
    router: Arc<SignalRouter>,
    sender: Arc<HttpSignalSender>,
    registration: Arc<RegistrationEngine>,
    aggregator: Arc<ForkerAggregator>,
    orchestrator: Arc<Orchestrator>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Platform {
    pub fn new(config: Config) -> Arc<Self> {
        let directory = Arc::new(PeerDirectory::new(config.local_isolate()));
        let router = Arc::new(SignalRouter::new());
        let sender = Arc::new(HttpSignalSender::new(
            directory.clone(),
            router.clone(),
            config.transport_timeout(),
        ));

        let registration = Arc::new(RegistrationEngine::new(directory.clone(), sender.clone()));
        let aggregator = Arc::new(ForkerAggregator::new(
            directory.clone(),
            sender.clone(),
            config.forker_timings(),
        ));

        let status = IsolateStatus::new(directory.local().uid.as_str());
        status.load(config.isolates.iter().cloned());
        let orchestrator = Orchestrator::new(
            aggregator.clone(),
            sender.clone(),
            status,
            config.failure_policy(),
        );

        let cancel = CancellationToken::new();
        registration.register_listeners(&router);
        aggregator.register_listeners(&router);
        orchestrator.register_listeners(&router);
        router.register(
            SIGNAL_ISOLATE_STOP,
            Arc::new(StopListener {
                cancel: cancel.clone(),
            }),
        );

        Arc::new(Self {
            config,
            directory,
            router,
            sender,
            registration,
            aggregator,
            orchestrator,
            cancel,
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }

    pub fn aggregator(&self) -> &Arc<ForkerAggregator> {
        &self.aggregator
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Cancelled once the platform is asked to stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            router: self.router.clone(),
            directory: self.directory.clone(),
            orchestrator: Some(self.orchestrator.clone()),
        }
    }

    fn add_worker(&self, handle: JoinHandle<()>) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Binds the signal receiver, starts the background workers and pulls
    /// the initial directory.
    pub async fn start(&self) -> Result<()> {
        let port = self.config.signal_port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to bind signal port {}", port))?;

        let state = self.app_state();
        let cancel = self.cancel.clone();
        self.add_worker(tokio::spawn(async move {
            if let Err(e) = api::server::serve_listener(state, listener, cancel).await {
                error!("Signal receiver failed: {:#}", e);
            }
        }));

        self.add_worker(self.aggregator.spawn_ttl_scanner(self.cancel.clone()));
        self.add_worker(self.orchestrator.spawn_forker_watcher(self.cancel.clone()));

        if self.config.discovery.enabled {
            let receiver = BeatReceiver::new(self.config.discovery.clone(), self.aggregator.clone());
            for handle in receiver.start(self.cancel.clone()).await? {
                self.add_worker(handle);
            }
        }
        if self.config.discovery.emit {
            let local = self.directory.local();
            let beat = Beat::new(
                self.config.discovery.app_id.as_str(),
                local.uid.as_str(),
                local.node.as_str(),
                local.port,
            );
            self.add_worker(spawn_beat_emitter(
                self.config.discovery.clone(),
                beat,
                self.cancel.clone(),
            ));
        }

        self.sender.mark_ready();

        if let Some(dumper_port) = self.config.dumper_port {
            self.registration
                .request_initial_dump(dumper_port, self.config.ready_ttl())?;
        }

        let local = self.directory.local();
        info!(
            "Isolate {} started on node {} (port {})",
            local.uid, local.node, local.port
        );
        let status = self.orchestrator.status();
        if status.is_empty() {
            info!("No isolate to manage");
        } else {
            info!(
                "Managing {} isolates on nodes {}",
                status.len(),
                status.nodes().join(", ")
            );
        }
        Ok(())
    }

    /// Stops the managed isolates, then the background workers.
    pub async fn stop(&self) {
        self.orchestrator.stop_platform().await;
        self.cancel.cancel();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        join_workers(workers, WORKER_GRACE).await;

        // Listeners hold the sender, which holds the router
        self.router.clear();
        info!("Platform stopped");
    }
}

/// Waits for each worker for at most `grace`, aborting the late ones.
pub async fn join_workers(workers: Vec<JoinHandle<()>>, grace: Duration) {
    for mut worker in workers {
        if tokio::time::timeout(grace, &mut worker).await.is_err() {
            warn!("Worker did not stop in time, aborting it");
            worker.abort();
        }
    }
}
