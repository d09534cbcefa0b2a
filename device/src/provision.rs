//! Bus-driven key provisioning state machine.
//!
//! Per device: `NoKeys -> KeysIssued -> (KeysRotated)* -> Deleted`.
//! `request` is idempotent and exempt from replay checking; `update` and
//! `delete` arrive sealed for the device's current key, must survive
//! ReplayGuard, and fail closed: a body that does not decrypt is logged and
//! ignored.

use chrono::Utc;
use common::bus::{
    self, parse_provision_topic, BackoffPolicy, BusMessage, MessageBus, ProvisionAction,
};
use common::envelope::{self, EncryptedEnvelope};
use common::replay::ReplayGuard;
use common::signing::urlsafe_token;
use common::{KeyAnnouncement, ProtocolError, ProvisionCommand, Result};
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::vault::KeyVault;

const WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    NoKeys,
    KeysIssued,
    KeysRotated,
    Deleted,
}

/// What a handled message actually did; used by callers and tests to
/// observe transitions without poking at the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Key material announced on the keys topic.
    Published { topic: String },
    /// State changed without an announcement (delete path).
    Applied(&'static str),
    /// Fail-closed: nothing happened, reason logged.
    NoOp(&'static str),
    /// Message refused (unknown topic/action, replay).
    Rejected(String),
}

pub struct ProvisionAgent {
    vault: KeyVault,
    bus: Arc<dyn MessageBus>,
    replay: Arc<ReplayGuard>,
    provision_base: String,
    keys_base: String,
    states: Mutex<HashMap<String, ProvisionState>>,
}

impl ProvisionAgent {
    pub fn new(
        vault: KeyVault,
        bus: Arc<dyn MessageBus>,
        replay: Arc<ReplayGuard>,
        provision_base: &str,
        keys_base: &str,
    ) -> Self {
        Self {
            vault,
            bus,
            replay,
            provision_base: provision_base.to_string(),
            keys_base: keys_base.to_string(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, device_id: &str) -> ProvisionState {
        let mut states = self.states.lock();
        *states.entry(device_id.to_string()).or_insert_with(|| {
            if self.vault.has_keys(device_id, None) {
                ProvisionState::KeysIssued
            } else {
                ProvisionState::NoKeys
            }
        })
    }

    fn set_state(&self, device_id: &str, state: ProvisionState) {
        self.states.lock().insert(device_id.to_string(), state);
    }

    pub async fn handle(&self, message: &BusMessage) -> ProvisionOutcome {
        let Some(topic) = parse_provision_topic(&self.provision_base, &message.topic) else {
            return ProvisionOutcome::Rejected(format!(
                "unrecognized provisioning topic '{}'",
                message.topic
            ));
        };
        match topic.action {
            ProvisionAction::Request => self.handle_request(&topic.device_id, &message.payload).await,
            ProvisionAction::Update => self.handle_update(&topic.device_id, &message.payload).await,
            ProvisionAction::Delete => self.handle_delete(&topic.device_id, &message.payload).await,
        }
    }

    /// Issue a keypair only if none exists; always announce the public key.
    async fn handle_request(&self, device_id: &str, payload: &[u8]) -> ProvisionOutcome {
        let command = self.parse_request_body(device_id, payload);
        let tenant = command.user_id.as_deref();

        let (_, created) = match self.vault.ensure(device_id, tenant) {
            Ok(result) => result,
            Err(e) => {
                warn!("Key generation failed for '{}': {}", device_id, e);
                return ProvisionOutcome::NoOp("key generation failed");
            }
        };
        if created {
            self.set_state(device_id, ProvisionState::KeysIssued);
            info!("Issued keypair for device '{}'", device_id);
        } else {
            info!(
                "Device '{}' already has keys; re-announcing public key",
                device_id
            );
        }

        match self.announce(device_id, tenant).await {
            Ok(topic) => ProvisionOutcome::Published { topic },
            Err(e) => {
                warn!("Key announcement failed for '{}': {}", device_id, e);
                ProvisionOutcome::NoOp("announcement failed")
            }
        }
    }

    /// Destructive rotation. Sealed body only, replay-guarded.
    async fn handle_update(&self, device_id: &str, payload: &[u8]) -> ProvisionOutcome {
        let command = match self.open_sealed(device_id, payload) {
            Ok(command) => command,
            Err(reason) => {
                warn!("Update for '{}' ignored: {}", device_id, reason);
                return ProvisionOutcome::NoOp(reason);
            }
        };
        if let Err(rejection) = self.replay.check_and_record(
            device_id,
            command.nonce.as_deref(),
            command.timestamp,
            payload,
        ) {
            warn!("Replay blocked update for '{}': {}", device_id, rejection);
            return ProvisionOutcome::Rejected(rejection.reason().to_string());
        }

        let tenant = command.user_id.as_deref();
        if let Err(e) = self.vault.rotate(device_id, tenant) {
            warn!("Rotation failed for '{}': {}", device_id, e);
            return ProvisionOutcome::NoOp("rotation failed");
        }
        self.set_state(device_id, ProvisionState::KeysRotated);
        info!("Rotated keypair for device '{}'", device_id);

        match self.announce(device_id, tenant).await {
            Ok(topic) => ProvisionOutcome::Published { topic },
            Err(e) => {
                warn!("Key announcement failed for '{}': {}", device_id, e);
                ProvisionOutcome::NoOp("announcement failed")
            }
        }
    }

    /// Destroy key material; idempotent when already absent.
    async fn handle_delete(&self, device_id: &str, payload: &[u8]) -> ProvisionOutcome {
        let command = match self.open_sealed(device_id, payload) {
            Ok(command) => command,
            Err(reason) => {
                warn!("Delete for '{}' ignored: {}", device_id, reason);
                return ProvisionOutcome::NoOp(reason);
            }
        };
        if let Err(rejection) = self.replay.check_and_record(
            device_id,
            command.nonce.as_deref(),
            command.timestamp,
            payload,
        ) {
            warn!("Replay blocked delete for '{}': {}", device_id, rejection);
            return ProvisionOutcome::Rejected(rejection.reason().to_string());
        }

        match self.vault.remove(device_id, command.user_id.as_deref()) {
            Ok(true) => {
                self.set_state(device_id, ProvisionState::Deleted);
                info!("Deleted key material for device '{}'", device_id);
                ProvisionOutcome::Applied("keys deleted")
            }
            Ok(false) => {
                self.set_state(device_id, ProvisionState::Deleted);
                ProvisionOutcome::Applied("already absent")
            }
            Err(e) => {
                warn!("Delete failed for '{}': {}", device_id, e);
                ProvisionOutcome::NoOp("delete failed")
            }
        }
    }

    /// Request bodies may be sealed (when keys already exist), plaintext
    /// JSON, or empty; decryption failure legitimately falls back to
    /// plaintext because the device may not have keys yet.
    fn parse_request_body(&self, device_id: &str, payload: &[u8]) -> ProvisionCommand {
        let fallback = ProvisionCommand {
            device_id: device_id.to_string(),
            user_id: None,
            nonce: None,
            timestamp: None,
        };
        if payload.iter().all(|b| b.is_ascii_whitespace()) {
            return fallback;
        }
        if let Ok(sealed) = serde_json::from_slice::<EncryptedEnvelope>(payload) {
            if let Ok(Some(key)) = self.vault.find_private_key(device_id) {
                if let Ok(command) = envelope::open::<ProvisionCommand>(&sealed, &key) {
                    return command;
                }
            }
        }
        serde_json::from_slice::<ProvisionCommand>(payload).unwrap_or(fallback)
    }

    /// Update/delete bodies must decrypt under the device's current key;
    /// anything else is dropped (no plaintext fallback).
    fn open_sealed(
        &self,
        device_id: &str,
        payload: &[u8],
    ) -> std::result::Result<ProvisionCommand, &'static str> {
        let sealed = serde_json::from_slice::<EncryptedEnvelope>(payload)
            .map_err(|_| "body is not a sealed envelope")?;
        let key = self
            .vault
            .find_private_key(device_id)
            .map_err(|_| "key material unreadable")?
            .ok_or("no key material for device")?;
        envelope::open::<ProvisionCommand>(&sealed, &key).map_err(|_| "decryption failed")
    }

    async fn announce(&self, device_id: &str, tenant_id: Option<&str>) -> Result<String> {
        let pem = self
            .vault
            .public_key_pem(device_id, tenant_id)?
            .ok_or_else(|| {
                ProtocolError::InternalError(format!("no public key on disk for '{}'", device_id))
            })?;
        let announcement = KeyAnnouncement {
            device_id: device_id.to_string(),
            public_key: pem,
            user_id: tenant_id.map(|t| t.to_string()),
            nonce: Some(urlsafe_token(16)),
            timestamp: Some(Utc::now()),
        };
        let topic = bus::keys_topic(&self.keys_base, device_id);
        self.bus
            .publish(&topic, serde_json::to_vec(&announcement)?)
            .await?;
        info!("Announced public key for '{}' on {}", device_id, topic);
        Ok(topic)
    }

    /// Supervised subscription loop over `provision/+/+`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let policy = BackoffPolicy::default();
        let agent = self.clone();
        bus::run_supervised("provision-agent", &policy, shutdown.clone(), move || {
            let agent = agent.clone();
            let shutdown = shutdown.clone();
            async move { agent.serve(shutdown).await }
        })
        .await;
    }

    async fn serve(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let filter = format!("{}/+/+", self.provision_base);
        let rx = self.bus.subscribe(&filter).await?;
        info!("Provision agent listening on '{}'", filter);
        let agent = self.clone();
        bus::pump(rx, WORKERS, shutdown, move |message| {
            let agent = agent.clone();
            async move {
                let outcome = agent.handle(&message).await;
                if let ProvisionOutcome::Rejected(reason) = outcome {
                    warn!("Dropped message on '{}': {}", message.topic, reason);
                }
            }
        })
        .await;
        Ok(())
    }
}
