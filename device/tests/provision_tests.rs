use chrono::Utc;
use common::bus::{BusMessage, LocalBus, MessageBus};
use common::envelope;
use common::replay::ReplayGuard;
use common::signing::{public_key_from_pem, urlsafe_token};
use common::{KeyAnnouncement, ProvisionCommand, ReplayConfig};
use device::{KeyVault, ProvisionAgent, ProvisionOutcome, ProvisionState};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Harness {
    agent: ProvisionAgent,
    announcements: mpsc::Receiver<BusMessage>,
    root: std::path::PathBuf,
}

async fn harness() -> Harness {
    let root = std::env::temp_dir().join(format!("provision-test-{}", uuid::Uuid::new_v4()));
    let bus = Arc::new(LocalBus::new());
    let announcements = bus.subscribe("keys/+/public").await.unwrap();
    let agent = ProvisionAgent::new(
        KeyVault::new(root.clone()),
        bus,
        Arc::new(ReplayGuard::new(ReplayConfig::default())),
        "provision",
        "keys",
    );
    Harness {
        agent,
        announcements,
        root,
    }
}

impl Harness {
    async fn announced_key(&mut self) -> KeyAnnouncement {
        let message = self.announcements.recv().await.unwrap();
        serde_json::from_slice(&message.payload).unwrap()
    }

    fn cleanup(&self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn request_message(device_id: &str, tenant: &str) -> BusMessage {
    BusMessage {
        topic: format!("provision/{}/request", device_id),
        payload: serde_json::json!({"device_id": device_id, "user_id": tenant})
            .to_string()
            .into_bytes(),
    }
}

fn sealed_message(device_id: &str, tenant: &str, action: &str, device_pem: &str) -> BusMessage {
    let command = ProvisionCommand {
        device_id: device_id.to_string(),
        user_id: Some(tenant.to_string()),
        nonce: Some(urlsafe_token(16)),
        timestamp: Some(Utc::now()),
    };
    let recipient = public_key_from_pem(device_pem).unwrap();
    let sealed = envelope::seal(&command, &recipient).unwrap();
    BusMessage {
        topic: format!("provision/{}/{}", device_id, action),
        payload: serde_json::to_vec(&sealed).unwrap(),
    }
}

#[tokio::test]
async fn request_issues_keys_and_announces() {
    let mut harness = harness().await;
    assert_eq!(harness.agent.state("pH01"), ProvisionState::NoKeys);

    let outcome = harness.agent.handle(&request_message("pH01", "t1")).await;
    assert_eq!(
        outcome,
        ProvisionOutcome::Published {
            topic: "keys/pH01/public".to_string()
        }
    );
    assert_eq!(harness.agent.state("pH01"), ProvisionState::KeysIssued);

    let announcement = harness.announced_key().await;
    assert_eq!(announcement.device_id, "pH01");
    assert_eq!(announcement.user_id.as_deref(), Some("t1"));
    assert!(announcement.public_key.contains("BEGIN PUBLIC KEY"));
    assert!(announcement.nonce.is_some());
    harness.cleanup();
}

#[tokio::test]
async fn repeated_request_is_idempotent() {
    let mut harness = harness().await;
    harness.agent.handle(&request_message("pH01", "t1")).await;
    let first = harness.announced_key().await;

    // A second request must not regenerate, only re-announce.
    harness.agent.handle(&request_message("pH01", "t1")).await;
    let second = harness.announced_key().await;
    assert_eq!(first.public_key, second.public_key);
    harness.cleanup();
}

#[tokio::test]
async fn update_rotates_destructively() {
    let mut harness = harness().await;
    harness.agent.handle(&request_message("pH01", "t1")).await;
    let original = harness.announced_key().await;

    let update = sealed_message("pH01", "t1", "update", &original.public_key);
    let outcome = harness.agent.handle(&update).await;
    assert!(matches!(outcome, ProvisionOutcome::Published { .. }));
    assert_eq!(harness.agent.state("pH01"), ProvisionState::KeysRotated);

    let rotated = harness.announced_key().await;
    assert_ne!(original.public_key, rotated.public_key);
    harness.cleanup();
}

#[tokio::test]
async fn replayed_update_is_rejected() {
    let mut harness = harness().await;
    harness.agent.handle(&request_message("pH01", "t1")).await;
    let announced = harness.announced_key().await;

    let update = sealed_message("pH01", "t1", "update", &announced.public_key);
    assert!(matches!(
        harness.agent.handle(&update).await,
        ProvisionOutcome::Published { .. }
    ));
    let _ = harness.announced_key().await;

    // The exact same sealed message again: the nonce has been seen. The
    // replay check runs against the rotated key's decryption... the body no
    // longer decrypts, which is itself the fail-closed path.
    let outcome = harness.agent.handle(&update).await;
    assert!(matches!(outcome, ProvisionOutcome::NoOp(_)));

    // A fresh seal against the *old* key also fails closed after rotation.
    let stale = sealed_message("pH01", "t1", "update", &announced.public_key);
    assert!(matches!(
        harness.agent.handle(&stale).await,
        ProvisionOutcome::NoOp(_)
    ));
    harness.cleanup();
}

#[tokio::test]
async fn replayed_nonce_is_rejected_before_acting() {
    let mut harness = harness().await;
    harness.agent.handle(&request_message("pH01", "t1")).await;
    let first_key = harness.announced_key().await;

    let command = |nonce: &str| ProvisionCommand {
        device_id: "pH01".to_string(),
        user_id: Some("t1".to_string()),
        nonce: Some(nonce.to_string()),
        timestamp: None,
    };

    // First update, sealed against the current key, nonce N: applied.
    let recipient = public_key_from_pem(&first_key.public_key).unwrap();
    let first = BusMessage {
        topic: "provision/pH01/update".to_string(),
        payload: serde_json::to_vec(&envelope::seal(&command("nonce-n"), &recipient).unwrap())
            .unwrap(),
    };
    assert!(matches!(
        harness.agent.handle(&first).await,
        ProvisionOutcome::Published { .. }
    ));
    let rotated = harness.announced_key().await;

    // Second update, sealed against the *rotated* key so it decrypts fine,
    // but reusing nonce N: ReplayGuard must refuse it before any rotation.
    let recipient = public_key_from_pem(&rotated.public_key).unwrap();
    let second = BusMessage {
        topic: "provision/pH01/update".to_string(),
        payload: serde_json::to_vec(&envelope::seal(&command("nonce-n"), &recipient).unwrap())
            .unwrap(),
    };
    assert_eq!(
        harness.agent.handle(&second).await,
        ProvisionOutcome::Rejected("duplicate_nonce".to_string())
    );
    // No rotation happened: no further announcement is queued.
    assert!(harness.announcements.try_recv().is_err());
    harness.cleanup();
}

#[tokio::test]
async fn delete_is_fail_closed_and_idempotent() {
    let mut harness = harness().await;
    harness.agent.handle(&request_message("pH01", "t1")).await;
    let announced = harness.announced_key().await;

    let delete = sealed_message("pH01", "t1", "delete", &announced.public_key);
    assert_eq!(
        harness.agent.handle(&delete).await,
        ProvisionOutcome::Applied("keys deleted")
    );
    assert_eq!(harness.agent.state("pH01"), ProvisionState::Deleted);

    // After deletion nothing decrypts; a repeat is a logged no-op.
    assert!(matches!(
        harness.agent.handle(&delete).await,
        ProvisionOutcome::NoOp(_)
    ));
    harness.cleanup();
}

#[tokio::test]
async fn garbage_update_body_is_a_noop() {
    let mut harness = harness().await;
    harness.agent.handle(&request_message("pH01", "t1")).await;
    let _ = harness.announced_key().await;

    let outcome = harness
        .agent
        .handle(&BusMessage {
            topic: "provision/pH01/update".to_string(),
            payload: b"{\"not\": \"an envelope\"}".to_vec(),
        })
        .await;
    assert!(matches!(outcome, ProvisionOutcome::NoOp(_)));
    // State untouched.
    assert_eq!(harness.agent.state("pH01"), ProvisionState::KeysIssued);
    harness.cleanup();
}

#[tokio::test]
async fn unknown_actions_are_rejected() {
    let harness = harness().await;
    let outcome = harness
        .agent
        .handle(&BusMessage {
            topic: "provision/pH01/reboot".to_string(),
            payload: Vec::new(),
        })
        .await;
    assert!(matches!(outcome, ProvisionOutcome::Rejected(_)));
    harness.cleanup();
}

#[tokio::test]
async fn empty_request_body_uses_topic_device_id() {
    let mut harness = harness().await;
    let outcome = harness
        .agent
        .handle(&BusMessage {
            topic: "provision/tds02/request".to_string(),
            payload: Vec::new(),
        })
        .await;
    assert!(matches!(outcome, ProvisionOutcome::Published { .. }));
    let announcement = harness.announced_key().await;
    assert_eq!(announcement.device_id, "tds02");
    assert!(announcement.user_id.is_none());
    harness.cleanup();
}
