use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::{DirectoryDump, PeerDirectory, PeerRecord, LOCALHOST};
use crate::error::WardenError;
use crate::transport::{SendMode, SignalListener, SignalRouter, SignalSender, StackListener};
use crate::types::signal::{
    PortPayload, Registration, SIGNAL_CONTACT, SIGNAL_DUMP, SIGNAL_ISOLATE_LOST, SIGNAL_REGISTER,
    SIGNAL_REGISTER_ACK, SIGNAL_REGISTER_SYNACK,
};
use crate::types::{is_monitor, Group, PeerAddress, SignalData};

/// Keeps the local directory in sync with the other isolates through the
/// REGISTER / SYN-ACK / ACK handshake and directory dumps.
pub struct RegistrationEngine {
    directory: Arc<PeerDirectory>,
    sender: Arc<dyn SignalSender>,
    /// Serializes directory updates with the replies they decide.
    registering: Mutex<()>,
}

impl RegistrationEngine {
    pub fn new(directory: Arc<PeerDirectory>, sender: Arc<dyn SignalSender>) -> Self {
        Self {
            directory,
            sender,
            registering: Mutex::new(()),
        }
    }

    /// Subscribes the engine to directory signals and isolate-lost notices.
    pub fn register_listeners(self: &Arc<Self>, router: &SignalRouter) {
        router.register("/directory/*", self.clone());
        router.register(SIGNAL_ISOLATE_LOST, self.clone());
    }

    /// Entry announced by the local isolate. The address is left to the
    /// receiver, which observes it.
    pub fn registration_content(&self, propagate: bool) -> Registration {
        let local = self.directory.local();
        Registration {
            uid: local.uid.clone(),
            name: local.name.clone(),
            node: local.node.clone(),
            address: None,
            port: local.port,
            groups: local.groups(),
            propagate,
        }
    }

    /// Announces the local isolate to every stored peer, asking them to
    /// propagate it.
    pub async fn send_registration_to_all(&self) -> Result<()> {
        let content = serde_json::to_value(self.registration_content(true))?;
        let result = self
            .sender
            .send_group(SIGNAL_REGISTER, content, &Group::Stored, &[])
            .await;

        if result.results.is_empty() {
            warn!("Registration reached no isolate");
        } else {
            debug!(
                "Registration sent to {:?}",
                result.results.keys().collect::<Vec<_>>()
            );
        }
        Ok(())
    }

    /// Pulls the directory of the local dumper once the transport is ready.
    pub fn request_initial_dump(self: &Arc<Self>, dumper_port: u16, ttl: Duration) -> Result<()> {
        let content = serde_json::to_value(self.registration_content(false))?;
        info!("Grabbing the directory from local port {}", dumper_port);
        self.sender.stack_to(
            SIGNAL_DUMP,
            content,
            self.clone(),
            SendMode::Send,
            ttl,
            PeerAddress::new(LOCALHOST, dumper_port),
        );
        Ok(())
    }

    async fn handle_register(&self, data: &SignalData) -> Result<()> {
        let mut registration: Registration = data.content_as(SIGNAL_REGISTER)?;
        let uid = registration.uid.clone();
        if uid == self.directory.local().uid {
            return Ok(());
        }

        // Same node: trust what the transport saw over the payload
        let address = if data.sender_node == registration.node {
            data.sender_address.clone()
        } else {
            registration
                .address
                .clone()
                .filter(|address| !address.is_empty())
                .or_else(|| data.sender_address.clone())
        };

        let groups = if registration.groups.is_empty() {
            vec![Group::All.as_str().to_string(), Group::ISOLATES.to_string()]
        } else {
            registration.groups.clone()
        };

        let mut record = PeerRecord::new(uid.as_str(), registration.node.as_str(), registration.port)
            .with_name(registration.name.as_str())
            .with_groups(groups);
        if let Some(address) = &address {
            record = record.with_host(address.as_str());
        }

        let (answer, register_back) = {
            let _registering = self.registering.lock().await;
            let newly_registered = self.directory.register_isolate(record);
            if !self.directory.is_registered(&uid) {
                (false, false)
            } else if uid == data.sender_uid {
                if newly_registered {
                    self.directory.synchronizing_isolate_presence(&uid);
                }
                (true, false)
            } else {
                (false, newly_registered)
            }
        };

        if answer {
            self.sender
                .fire(SIGNAL_REGISTER_SYNACK, Value::Null, &[uid.clone()])
                .await;
        } else if register_back {
            debug!("Registering to {} learned by propagation", uid);
            let content = serde_json::to_value(self.registration_content(false))?;
            self.sender.fire(SIGNAL_REGISTER, content, &[uid.clone()]).await;
        }

        if registration.propagate {
            registration.propagate = false;
            registration.address = address;
            let content = serde_json::to_value(&registration)?;
            self.sender
                .fire_group(SIGNAL_REGISTER, content, &Group::Stored, &[uid])
                .await;
        }

        Ok(())
    }

    async fn handle_synack(&self, sender: &str) {
        debug!("SYN-ACK from {}", sender);

        if !self.directory.is_registered(sender) {
            warn!("SYN-ACK from unknown isolate {}", sender);
            return;
        }

        if !self.directory.synchronizing_isolate_presence(sender) {
            warn!("SYN-ACK from {} ignored: presence already validated", sender);
            return;
        }

        self.directory.validate_isolate_presence(sender);

        let result = self
            .sender
            .send(SIGNAL_REGISTER_ACK, Value::Null, &[sender.to_string()])
            .await;
        if result.results.contains_key(sender) {
            self.directory.notify_isolate_presence(sender);
        } else {
            warn!("Isolate {} did not answer the ACK signal", sender);
        }
    }

    fn handle_ack(&self, sender: &str) {
        debug!("ACK from {}", sender);
        if self.directory.validate_isolate_presence(sender) {
            self.directory.notify_isolate_presence(sender);
        }
    }

    async fn handle_contact(&self, data: &SignalData) -> Result<()> {
        let remote = &data.sender_uid;
        if !is_monitor(remote) {
            warn!("Contacts must come from monitors, got one from {}", remote);
            return Ok(());
        }

        let payload: PortPayload = data.content_as(SIGNAL_CONTACT)?;
        let Some(port) = payload.port else {
            warn!("Contact from {} gives no dumper port", remote);
            return Ok(());
        };
        let Some(host) = data.sender_address.clone() else {
            warn!("Contact from {} has no observed address", remote);
            return Ok(());
        };

        self.directory.set_node_address(&data.sender_node, &host);

        let access = PeerAddress::new(host, port);
        let content = serde_json::to_value(self.registration_content(false))?;
        match self.sender.send_to(SIGNAL_DUMP, content, &access).await {
            Ok(results) => {
                if self
                    .store_dumped_directory(&results, Some(&data.sender_node))
                    .await
                {
                    self.send_registration_to_all().await?;
                }
            }
            Err(e) => error!(
                "Error grabbing the directory of {} at {}: {}",
                remote, access, e
            ),
        }
        Ok(())
    }

    async fn handle_dump(&self, data: &SignalData) -> Result<Value> {
        debug!("DUMP from {}", data.sender_uid);
        if data.content.is_object() {
            self.handle_register(data).await?;
        }
        Ok(serde_json::to_value(self.directory.dump())?)
    }

    fn handle_isolate_lost(&self, data: &SignalData) -> Result<()> {
        let lost = data
            .content
            .as_str()
            .ok_or_else(|| WardenError::malformed(SIGNAL_ISOLATE_LOST, "expected an isolate id"))?;
        info!("Isolate {} lost", lost);
        self.directory.unregister_isolate(lost);
        Ok(())
    }

    /// Stores the first dump found in a reply. Returns `false` when none was
    /// found.
    async fn store_dumped_directory(&self, results: &[Value], ignored_node: Option<&str>) -> bool {
        if results.is_empty() {
            warn!("Nothing returned by the directory dumper");
            return false;
        }
        if results.len() > 1 {
            warn!("More than one dump received, keeping the first one");
        }

        let dump = results
            .iter()
            .filter(|result| result.is_object())
            .find_map(|result| serde_json::from_value::<DirectoryDump>(result.clone()).ok());

        match dump {
            Some(dump) => {
                let ignored: Vec<&str> = ignored_node.into_iter().collect();
                let registered = {
                    let _registering = self.registering.lock().await;
                    self.directory.store_dump(&dump, &ignored, &[])
                };
                debug!("Dump registered {} new isolates", registered.len());
                true
            }
            None => {
                warn!("No readable dump in the reply");
                false
            }
        }
    }
}

#[async_trait]
impl SignalListener for RegistrationEngine {
    async fn handle_received_signal(&self, name: &str, data: &SignalData) -> Result<Option<Value>> {
        match name {
            SIGNAL_DUMP => return Ok(Some(self.handle_dump(data).await?)),
            SIGNAL_REGISTER => self.handle_register(data).await?,
            SIGNAL_REGISTER_SYNACK => self.handle_synack(&data.sender_uid).await,
            SIGNAL_REGISTER_ACK => self.handle_ack(&data.sender_uid),
            SIGNAL_CONTACT => self.handle_contact(data).await?,
            SIGNAL_ISOLATE_LOST => self.handle_isolate_lost(data)?,
            other => debug!("Ignoring directory signal {}", other),
        }
        Ok(None)
    }
}

#[async_trait]
impl StackListener for RegistrationEngine {
    async fn handle_stacked_result(&self, name: &str, results: Option<Vec<Value>>) {
        if name != SIGNAL_DUMP {
            return;
        }
        match results {
            Some(results) => {
                debug!("Directory dump received from the local dumper");
                if self.store_dumped_directory(&results, None).await {
                    if let Err(e) = self.send_registration_to_all().await {
                        warn!("Failed to announce the local isolate: {:#}", e);
                    }
                }
            }
            None => warn!("The local dumper never answered"),
        }
    }
}
