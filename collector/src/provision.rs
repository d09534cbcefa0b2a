//! Publisher side of key provisioning.
//!
//! `request` asks the device agent to mint a keypair if it has none;
//! `update` forces a destructive rotation; `delete` destroys key material.
//! Update/delete bodies are sealed for the device's current public key and
//! stamped with a nonce + timestamp so the agent's ReplayGuard has material
//! to check. Requests are exempt from replay protection (idempotent) but
//! deduplicated here at the edge.

use chrono::{Duration, Utc};
use common::bus::{provision_topic, MessageBus, ProvisionAction};
use common::cache::GuardedMap;
use common::envelope;
use common::signing::{public_key_from_pem, urlsafe_token};
use common::{ProtocolError, ProvisionCommand, Result};
use log::info;
use std::sync::Arc;

use crate::identity::SensorDirectory;

const DEDUP_WINDOW_SECONDS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionDispatch {
    Sent { topic: String },
    /// A request for the same device went out within the dedup window.
    Skipped,
}

pub struct ProvisioningPublisher {
    bus: Arc<dyn MessageBus>,
    directory: Arc<dyn SensorDirectory>,
    topic_base: String,
    last_sent: GuardedMap<()>,
}

impl ProvisioningPublisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        directory: Arc<dyn SensorDirectory>,
        topic_base: &str,
    ) -> Self {
        Self {
            bus,
            directory,
            topic_base: topic_base.to_string(),
            last_sent: GuardedMap::new(),
        }
    }

    /// Ask the agent to generate-and-announce a keypair for the device.
    pub async fn request_provisioning(
        &self,
        device_id: &str,
        tenant_id: &str,
    ) -> Result<ProvisionDispatch> {
        if self.last_sent.get(device_id).is_some() {
            info!(
                "Skipping duplicate provision request for '{}' (within {}s window)",
                device_id, DEDUP_WINDOW_SECONDS
            );
            return Ok(ProvisionDispatch::Skipped);
        }

        let topic = provision_topic(&self.topic_base, device_id, ProvisionAction::Request);
        let command = ProvisionCommand {
            device_id: device_id.to_string(),
            user_id: Some(tenant_id.to_string()),
            nonce: None,
            timestamp: None,
        };
        self.bus
            .publish(&topic, serde_json::to_vec(&command)?)
            .await?;
        self.last_sent
            .put(device_id, (), Some(Duration::seconds(DEDUP_WINDOW_SECONDS)));
        info!("Sent provision request for '{}' on {}", device_id, topic);
        Ok(ProvisionDispatch::Sent { topic })
    }

    pub async fn push_update(&self, device_id: &str, tenant_id: &str) -> Result<ProvisionDispatch> {
        self.push_sealed(device_id, tenant_id, ProvisionAction::Update)
            .await
    }

    pub async fn push_delete(&self, device_id: &str, tenant_id: &str) -> Result<ProvisionDispatch> {
        self.push_sealed(device_id, tenant_id, ProvisionAction::Delete)
            .await
    }

    async fn push_sealed(
        &self,
        device_id: &str,
        tenant_id: &str,
        action: ProvisionAction,
    ) -> Result<ProvisionDispatch> {
        let identity = self
            .directory
            .find(tenant_id, device_id)
            .await?
            .ok_or_else(|| {
                ProtocolError::ProtocolViolation(format!(
                    "device '{}' is not registered for tenant {}",
                    device_id, tenant_id
                ))
            })?;
        let pem = identity.public_key.as_deref().ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!(
                "no public key known for device '{}'; cannot seal {} command",
                device_id,
                action.as_str()
            ))
        })?;
        let recipient = public_key_from_pem(pem)?;

        let command = ProvisionCommand {
            device_id: device_id.to_string(),
            user_id: Some(tenant_id.to_string()),
            nonce: Some(urlsafe_token(16)),
            timestamp: Some(Utc::now()),
        };
        let sealed = envelope::seal(&command, &recipient)
            .map_err(|e| ProtocolError::InternalError(e.to_string()))?;

        let topic = provision_topic(&self.topic_base, device_id, action);
        self.bus
            .publish(&topic, serde_json::to_vec(&sealed)?)
            .await?;
        info!("Sent sealed {} for '{}' on {}", action.as_str(), device_id, topic);
        Ok(ProvisionDispatch::Sent { topic })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryDirectory;
    use common::bus::LocalBus;
    use common::signing::{generate_keypair, public_key_to_pem};
    use common::{IdentityStatus, SensorIdentity};
    use rsa::RsaPublicKey;

    async fn setup(with_key: bool) -> (ProvisioningPublisher, Arc<LocalBus>) {
        let bus = Arc::new(LocalBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let pem = if with_key {
            let key = generate_keypair().unwrap();
            Some(public_key_to_pem(&RsaPublicKey::from(&key)).unwrap())
        } else {
            None
        };
        directory
            .upsert(SensorIdentity {
                device_id: "pH01".to_string(),
                tenant_id: "t1".to_string(),
                public_key: pem,
                status: IdentityStatus::Active,
                device_type: "ph".to_string(),
            })
            .await
            .unwrap();
        (
            ProvisioningPublisher::new(bus.clone(), directory, "provision"),
            bus,
        )
    }

    #[tokio::test]
    async fn request_publishes_then_dedups() {
        let (publisher, bus) = setup(false).await;
        let mut rx = bus.subscribe("provision/+/request").await.unwrap();

        let first = publisher.request_provisioning("pH01", "t1").await.unwrap();
        assert!(matches!(first, ProvisionDispatch::Sent { .. }));
        let second = publisher.request_provisioning("pH01", "t1").await.unwrap();
        assert_eq!(second, ProvisionDispatch::Skipped);

        let message = rx.recv().await.unwrap();
        let command: ProvisionCommand = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(command.device_id, "pH01");
        assert_eq!(command.user_id.as_deref(), Some("t1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_requires_a_known_public_key() {
        let (publisher, _) = setup(false).await;
        assert!(publisher.push_update("pH01", "t1").await.is_err());
    }

    #[tokio::test]
    async fn update_is_sealed_and_stamped() {
        let (publisher, bus) = setup(true).await;
        let mut rx = bus.subscribe("provision/+/update").await.unwrap();
        publisher.push_update("pH01", "t1").await.unwrap();

        let message = rx.recv().await.unwrap();
        let sealed: common::envelope::EncryptedEnvelope =
            serde_json::from_slice(&message.payload).unwrap();
        assert!(!sealed.session_key.is_empty());
        assert!(!sealed.tag.is_empty());
    }
}
