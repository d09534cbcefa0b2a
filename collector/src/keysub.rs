//! Subscriber for device public-key announcements on `keys/{device_id}/public`.
//!
//! Announcements pass ReplayGuard before any state changes. Keys for devices
//! nobody has registered yet are parked in the pending cache so registration
//! can pick them up later; keys for registered devices land directly on the
//! identity row (trust-on-first-use, and the landing point for rotations).

use common::bus::{
    self, parse_keys_topic, replay_status_payload, BackoffPolicy, BusMessage, MessageBus,
};
use common::cache::GuardedMap;
use common::replay::ReplayGuard;
use common::signing::fingerprint;
use common::{KeyAnnouncement, Result};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;

const WORKERS: usize = 4;

pub struct KeyAnnouncementSubscriber {
    directory: Arc<dyn crate::identity::SensorDirectory>,
    replay: Arc<ReplayGuard>,
    bus: Arc<dyn MessageBus>,
    pending_keys: Arc<GuardedMap<String>>,
    keys_topic_base: String,
    status_topic_base: String,
}

impl KeyAnnouncementSubscriber {
    pub fn new(
        directory: Arc<dyn crate::identity::SensorDirectory>,
        replay: Arc<ReplayGuard>,
        bus: Arc<dyn MessageBus>,
        pending_keys: Arc<GuardedMap<String>>,
        keys_topic_base: &str,
        status_topic_base: &str,
    ) -> Self {
        Self {
            directory,
            replay,
            bus,
            pending_keys,
            keys_topic_base: keys_topic_base.to_string(),
            status_topic_base: status_topic_base.to_string(),
        }
    }

    /// Supervised subscription loop; returns only on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let policy = BackoffPolicy::default();
        let subscriber = self.clone();
        bus::run_supervised("key-subscriber", &policy, shutdown.clone(), move || {
            let subscriber = subscriber.clone();
            let shutdown = shutdown.clone();
            async move { subscriber.serve(shutdown).await }
        })
        .await;
    }

    async fn serve(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let filter = format!("{}/+/public", self.keys_topic_base);
        let rx = self.bus.subscribe(&filter).await?;
        info!("Key subscriber listening on '{}'", filter);
        let subscriber = self.clone();
        bus::pump(rx, WORKERS, shutdown, move |message| {
            let subscriber = subscriber.clone();
            async move { subscriber.handle_message(message).await }
        })
        .await;
        Ok(())
    }

    pub async fn handle_message(&self, message: BusMessage) {
        let topic_device = parse_keys_topic(&self.keys_topic_base, &message.topic);
        let Some(announcement) = Self::parse_announcement(&message.payload, topic_device) else {
            warn!("Key announcement on '{}' missing device_id or public_key; ignoring", message.topic);
            return;
        };

        let device_id = announcement.device_id.clone();
        if let Err(rejection) = self.replay.check_and_record(
            &device_id,
            announcement.nonce.as_deref(),
            announcement.timestamp,
            &message.payload,
        ) {
            // Replays are dropped silently at the bus layer; the status
            // topic announcement is purely for observability.
            warn!("Replay blocked for device {}: {}", device_id, rejection);
            let topic = bus::status_topic(&self.status_topic_base, &device_id);
            if let Err(e) = self
                .bus
                .publish(&topic, replay_status_payload(&device_id, rejection.reason()))
                .await
            {
                warn!("Failed to publish replay status for {}: {}", device_id, e);
            }
            return;
        }

        self.pending_keys
            .put(&device_id, announcement.public_key.clone(), None);

        match self
            .directory
            .set_public_key(
                &device_id,
                announcement.user_id.as_deref(),
                &announcement.public_key,
            )
            .await
        {
            Ok(true) => info!(
                "Updated public key for sensor '{}' (key {})",
                device_id,
                fingerprint(&announcement.public_key)
            ),
            Ok(false) => info!(
                "Received key for unregistered device '{}' (stored pending)",
                device_id
            ),
            Err(e) => warn!("Directory update failed for '{}': {}", device_id, e),
        }
    }

    /// Accept either the JSON announcement shape or a bare PEM body with the
    /// device id taken from the topic, which older firmware still sends.
    fn parse_announcement(payload: &[u8], topic_device: Option<String>) -> Option<KeyAnnouncement> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim();
        if text.starts_with('{') {
            let mut announcement: KeyAnnouncement = serde_json::from_str(text).ok()?;
            if announcement.device_id.is_empty() {
                announcement.device_id = topic_device?;
            }
            if announcement.public_key.trim().is_empty() {
                return None;
            }
            Some(announcement)
        } else if !text.is_empty() {
            Some(KeyAnnouncement {
                device_id: topic_device?,
                public_key: text.to_string(),
                user_id: None,
                nonce: None,
                timestamp: None,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{InMemoryDirectory, SensorDirectory};
    use common::bus::LocalBus;
    use common::{IdentityStatus, ReplayConfig, SensorIdentity};

    fn subscriber(directory: Arc<InMemoryDirectory>) -> KeyAnnouncementSubscriber {
        KeyAnnouncementSubscriber::new(
            directory,
            Arc::new(ReplayGuard::new(ReplayConfig::default())),
            Arc::new(LocalBus::new()),
            Arc::new(GuardedMap::new()),
            "keys",
            "status",
        )
    }

    fn announcement_message(device: &str, nonce: &str) -> BusMessage {
        BusMessage {
            topic: format!("keys/{}/public", device),
            payload: serde_json::json!({
                "device_id": device,
                "public_key": "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----",
                "user_id": "t1",
                "nonce": nonce,
            })
            .to_string()
            .into_bytes(),
        }
    }

    #[tokio::test]
    async fn updates_registered_identity() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory
            .upsert(SensorIdentity {
                device_id: "pH01".to_string(),
                tenant_id: "t1".to_string(),
                public_key: None,
                status: IdentityStatus::Active,
                device_type: "ph".to_string(),
            })
            .await
            .unwrap();
        let subscriber = subscriber(directory.clone());

        subscriber
            .handle_message(announcement_message("pH01", "n1"))
            .await;

        let row = directory.find("t1", "pH01").await.unwrap().unwrap();
        assert!(row.public_key.unwrap().contains("BEGIN PUBLIC KEY"));
    }

    #[tokio::test]
    async fn unknown_device_lands_in_pending_cache() {
        let subscriber = subscriber(Arc::new(InMemoryDirectory::new()));
        subscriber
            .handle_message(announcement_message("ghost", "n1"))
            .await;
        assert!(subscriber.pending_keys.get("ghost").is_some());
    }

    #[tokio::test]
    async fn replayed_announcement_is_dropped() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory
            .upsert(SensorIdentity {
                device_id: "pH01".to_string(),
                tenant_id: "t1".to_string(),
                public_key: None,
                status: IdentityStatus::Active,
                device_type: "ph".to_string(),
            })
            .await
            .unwrap();
        let subscriber = subscriber(directory.clone());

        subscriber
            .handle_message(announcement_message("pH01", "n1"))
            .await;
        // Second copy with the same nonce: key must not be re-applied.
        directory.set_public_key("pH01", Some("t1"), "sentinel").await.unwrap();
        subscriber
            .handle_message(announcement_message("pH01", "n1"))
            .await;

        let row = directory.find("t1", "pH01").await.unwrap().unwrap();
        assert_eq!(row.public_key.as_deref(), Some("sentinel"));
    }

    #[tokio::test]
    async fn bare_pem_body_uses_topic_device_id() {
        let subscriber = subscriber(Arc::new(InMemoryDirectory::new()));
        subscriber
            .handle_message(BusMessage {
                topic: "keys/tds02/public".to_string(),
                payload: b"-----BEGIN PUBLIC KEY-----\nxyz\n-----END PUBLIC KEY-----".to_vec(),
            })
            .await;
        assert!(subscriber.pending_keys.get("tds02").is_some());
    }
}
