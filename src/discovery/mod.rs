pub mod beat;

pub use beat::Beat;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::forker::ForkerAggregator;

const MAX_PACKET: usize = 1500;

fn default_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 0, 0, 1)
}

fn default_port() -> u16 {
    42000
}

fn default_app_id() -> String {
    "warden".to_string()
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_beat_period_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscoverySettings {
    /// Listen to the group.
    #[serde(default)]
    pub enabled: bool,
    /// Send the local beat to the group.
    #[serde(default)]
    pub emit: bool,
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Beats from other applications sharing the group are ignored.
    #[serde(default = "default_app_id")]
    pub app_id: String,
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_beat_period_ms")]
    pub beat_period_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            emit: false,
            group: default_group(),
            port: default_port(),
            app_id: default_app_id(),
            interface: default_interface(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            beat_period_ms: default_beat_period_ms(),
        }
    }
}

impl DiscoverySettings {
    pub fn beat_period(&self) -> Duration {
        Duration::from_millis(self.beat_period_ms)
    }

    pub fn target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

/// Consumes the heartbeats read from the multicast group.
#[async_trait]
pub trait BeatHandler: Send + Sync {
    async fn handle_beat(&self, beat: Beat, source: IpAddr);
}

#[async_trait]
impl BeatHandler for ForkerAggregator {
    async fn handle_beat(&self, beat: Beat, source: IpAddr) {
        let host = source.to_string();
        self.handle_heartbeat(&beat.isolate_id, &beat.node_id, Some(&host), Some(beat.port))
            .await;
    }
}

type Packet = (Vec<u8>, SocketAddr);

/// Reads beats from the multicast group and hands them to a pool of
/// workers through a bounded queue.
pub struct BeatReceiver {
    settings: DiscoverySettings,
    handler: Arc<dyn BeatHandler>,
}

impl BeatReceiver {
    pub fn new(settings: DiscoverySettings, handler: Arc<dyn BeatHandler>) -> Self {
        Self { settings, handler }
    }

    /// Binds the group port and joins the group.
    pub async fn bind(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.settings.port))
            .await
            .with_context(|| format!("Failed to bind multicast port {}", self.settings.port))?;
        socket
            .join_multicast_v4(self.settings.group, self.settings.interface)
            .with_context(|| format!("Failed to join multicast group {}", self.settings.group))?;
        info!(
            "Listening to beats on {}:{}",
            self.settings.group, self.settings.port
        );
        Ok(socket)
    }

    /// Starts the reader and its workers on an already bound socket.
    pub fn spawn(self, socket: UdpSocket, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let (queue, packets) = mpsc::channel::<Packet>(self.settings.queue_capacity.max(1));
        let packets = Arc::new(Mutex::new(packets));
        let app_id: Arc<str> = Arc::from(self.settings.app_id.as_str());

        let mut handles = Vec::with_capacity(self.settings.workers + 1);
        handles.push(tokio::spawn(read_packets(socket, queue, cancel.clone())));

        for worker in 0..self.settings.workers.max(1) {
            handles.push(tokio::spawn(handle_packets(
                worker,
                packets.clone(),
                self.handler.clone(),
                app_id.clone(),
                cancel.clone(),
            )));
        }
        handles
    }

    pub async fn start(self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let socket = self.bind().await?;
        Ok(self.spawn(socket, cancel))
    }
}

async fn read_packets(socket: UdpSocket, queue: mpsc::Sender<Packet>, cancel: CancellationToken) {
    let mut buffer = vec![0u8; MAX_PACKET];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        match received {
            Ok((size, source)) => {
                match queue.try_send((buffer[..size].to_vec(), source)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Beat queue full, dropping packet from {}", source);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => warn!("Error reading multicast socket: {}", e),
        }
    }
    debug!("Beat reader stopped");
}

async fn handle_packets(
    worker: usize,
    packets: Arc<Mutex<mpsc::Receiver<Packet>>>,
    handler: Arc<dyn BeatHandler>,
    app_id: Arc<str>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut packets = packets.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                packet = packets.recv() => packet,
            }
        };
        let Some((data, source)) = next else {
            break;
        };

        match Beat::decode(&data) {
            Ok(beat) if beat.app_id.as_str() == &*app_id => {
                handler.handle_beat(beat, source.ip()).await;
            }
            Ok(beat) => debug!("Ignoring beat of application {}", beat.app_id),
            Err(e) => warn!("Dropping packet from {}: {}", source, e),
        }
    }
    debug!("Beat worker {} stopped", worker);
}

/// Sends the local beat to the group until cancelled.
pub fn spawn_beat_emitter(
    settings: DiscoverySettings,
    beat: Beat,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = emit_beats(&settings, &beat, &cancel).await {
            warn!("Beat emitter stopped: {:#}", e);
        }
    })
}

async fn emit_beats(
    settings: &DiscoverySettings,
    beat: &Beat,
    cancel: &CancellationToken,
) -> Result<()> {
    let packet = beat.encode()?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .context("Failed to bind the beat socket")?;
    let target = settings.target();

    let mut ticker = tokio::time::interval(settings.beat_period());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&packet, target).await {
                    warn!("Failed to send beat to {}: {}", target, e);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingHandler {
        beats: StdMutex<Vec<(Beat, IpAddr)>>,
    }

    #[async_trait]
    impl BeatHandler for RecordingHandler {
        async fn handle_beat(&self, beat: Beat, source: IpAddr) {
            self.beats.lock().unwrap().push((beat, source));
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = DiscoverySettings::default();
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.queue_capacity, 64);
        assert_eq!(settings.beat_period(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_workers_filter_and_forward_beats() {
        let handler = Arc::new(RecordingHandler::default());
        let settings = DiscoverySettings {
            app_id: "app".to_string(),
            ..DiscoverySettings::default()
        };

        // Plain unicast socket stands in for the group
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let address = socket.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let handles = BeatReceiver::new(settings, handler.clone()).spawn(socket, cancel.clone());

        let emitter = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let other = Beat::new("other-app", "forker-x", "n9", 1).encode().unwrap();
        let ours = Beat::new("app", "forker-a", "n1", 9000).encode().unwrap();
        emitter.send_to(&other, address).await.unwrap();
        emitter.send_to(b"junk", address).await.unwrap();
        emitter.send_to(&ours, address).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.beats.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Give stragglers a chance before checking the filter
        tokio::time::sleep(Duration::from_millis(50)).await;
        let beats = handler.beats.lock().unwrap().clone();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].0.isolate_id, "forker-a");
        assert_eq!(beats[0].1, IpAddr::V4(Ipv4Addr::LOCALHOST));

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_emitter_repeats_the_beat() {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let settings = DiscoverySettings {
            group: Ipv4Addr::LOCALHOST,
            port: socket.local_addr().unwrap().port(),
            beat_period_ms: 20,
            ..DiscoverySettings::default()
        };
        let beat = Beat::new("warden", "forker-a", "n1", 9000);

        let cancel = CancellationToken::new();
        let emitter = spawn_beat_emitter(settings, beat.clone(), cancel.clone());

        let mut buffer = vec![0u8; MAX_PACKET];
        for _ in 0..2 {
            let (size, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buffer))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(Beat::decode(&buffer[..size]).unwrap(), beat);
        }

        cancel.cancel();
        emitter.await.unwrap();
    }
}
