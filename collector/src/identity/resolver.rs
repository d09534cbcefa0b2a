use common::signing;
use common::{IdentityStatus, ProtocolError, SensorIdentity};
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

use super::SensorDirectory;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no active sensor registered for device")]
    NoActiveSensor,
    #[error("signature did not match any registered sensor")]
    NoMatch,
    #[error(transparent)]
    Storage(#[from] ProtocolError),
}

/// The sole authority deciding which tenant a wire message belongs to.
///
/// Device identifiers are only unique per tenant, so every message is
/// resolved by trying signature verification against each active
/// registration for the identifier. The scan is linear on purpose: observed
/// tenant collisions are in the low single digits. Results are never cached;
/// every message re-verifies.
pub struct IdentityResolver {
    directory: Arc<dyn SensorDirectory>,
}

impl IdentityResolver {
    pub fn new(directory: Arc<dyn SensorDirectory>) -> Self {
        Self { directory }
    }

    pub async fn resolve_by_signature(
        &self,
        device_id: &str,
        message: &[u8],
        signature: &[u8],
    ) -> Result<SensorIdentity, ResolveError> {
        let rows = self.directory.list_by_device_id(device_id).await?;
        let candidates: Vec<SensorIdentity> = rows
            .into_iter()
            .filter(|row| row.status == IdentityStatus::Active)
            .collect();
        if candidates.is_empty() {
            return Err(ResolveError::NoActiveSensor);
        }

        for candidate in candidates {
            let Some(pem) = candidate.public_key.as_deref() else {
                debug!(
                    "Sensor '{}' (tenant {}) has no provisioned key; skipping",
                    candidate.device_id, candidate.tenant_id
                );
                continue;
            };
            let public_key = match signing::public_key_from_pem(pem) {
                Ok(key) => key,
                Err(e) => {
                    warn!(
                        "Unparseable public key for sensor '{}' (tenant {}): {}",
                        candidate.device_id, candidate.tenant_id, e
                    );
                    continue;
                }
            };
            if signing::verify(&public_key, message, signature) {
                debug!(
                    "Resolved device '{}' to tenant {} (key {})",
                    candidate.device_id,
                    candidate.tenant_id,
                    signing::fingerprint(pem)
                );
                return Ok(candidate);
            }
        }

        Err(ResolveError::NoMatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryDirectory;
    use common::signing::{generate_keypair, public_key_to_pem, sign};
    use rsa::RsaPublicKey;

    async fn directory_with(
        rows: Vec<(&str, &str, Option<String>, IdentityStatus)>,
    ) -> Arc<InMemoryDirectory> {
        let directory = Arc::new(InMemoryDirectory::new());
        for (tenant, device, pem, status) in rows {
            directory
                .upsert(SensorIdentity {
                    device_id: device.to_string(),
                    tenant_id: tenant.to_string(),
                    public_key: pem,
                    status,
                    device_type: "ph".to_string(),
                })
                .await
                .unwrap();
        }
        directory
    }

    #[tokio::test]
    async fn resolves_to_the_signing_tenant() {
        let key_a = generate_keypair().unwrap();
        let key_b = generate_keypair().unwrap();
        let pem_a = public_key_to_pem(&RsaPublicKey::from(&key_a)).unwrap();
        let pem_b = public_key_to_pem(&RsaPublicKey::from(&key_b)).unwrap();

        let directory = directory_with(vec![
            ("tenant-a", "pH01", Some(pem_a), IdentityStatus::Active),
            ("tenant-b", "pH01", Some(pem_b), IdentityStatus::Active),
        ])
        .await;
        let resolver = IdentityResolver::new(directory);

        let message = b"challenge-payload";
        let resolved = resolver
            .resolve_by_signature("pH01", message, &sign(&key_a, message))
            .await
            .unwrap();
        assert_eq!(resolved.tenant_id, "tenant-a");

        let resolved = resolver
            .resolve_by_signature("pH01", message, &sign(&key_b, message))
            .await
            .unwrap();
        assert_eq!(resolved.tenant_id, "tenant-b");
    }

    #[tokio::test]
    async fn never_cross_resolves_over_many_trials() {
        let key_a = generate_keypair().unwrap();
        let key_b = generate_keypair().unwrap();
        let pem_a = public_key_to_pem(&RsaPublicKey::from(&key_a)).unwrap();
        let pem_b = public_key_to_pem(&RsaPublicKey::from(&key_b)).unwrap();

        let directory = directory_with(vec![
            ("tenant-a", "shared", Some(pem_a), IdentityStatus::Active),
            ("tenant-b", "shared", Some(pem_b), IdentityStatus::Active),
        ])
        .await;
        let resolver = IdentityResolver::new(directory);

        for trial in 0..200 {
            let message = format!("randomized trial {}", trial);
            let (key, expected) = if trial % 2 == 0 {
                (&key_a, "tenant-a")
            } else {
                (&key_b, "tenant-b")
            };
            let resolved = resolver
                .resolve_by_signature("shared", message.as_bytes(), &sign(key, message.as_bytes()))
                .await
                .unwrap();
            assert_eq!(resolved.tenant_id, expected);
        }
    }

    #[tokio::test]
    async fn inactive_rows_do_not_count() {
        let key = generate_keypair().unwrap();
        let pem = public_key_to_pem(&RsaPublicKey::from(&key)).unwrap();

        let directory = directory_with(vec![(
            "tenant-a",
            "pH01",
            Some(pem),
            IdentityStatus::Revoked,
        )])
        .await;
        let resolver = IdentityResolver::new(directory);

        let message = b"payload";
        let result = resolver
            .resolve_by_signature("pH01", message, &sign(&key, message))
            .await;
        assert!(matches!(result, Err(ResolveError::NoActiveSensor)));
    }

    #[tokio::test]
    async fn wrong_signature_is_no_match() {
        let key = generate_keypair().unwrap();
        let other = generate_keypair().unwrap();
        let pem = public_key_to_pem(&RsaPublicKey::from(&key)).unwrap();

        let directory =
            directory_with(vec![("tenant-a", "pH01", Some(pem), IdentityStatus::Active)]).await;
        let resolver = IdentityResolver::new(directory);

        let message = b"payload";
        let result = resolver
            .resolve_by_signature("pH01", message, &sign(&other, message))
            .await;
        assert!(matches!(result, Err(ResolveError::NoMatch)));
    }
}
