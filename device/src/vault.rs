//! File-backed keypair storage for the device agent.
//!
//! Layout mirrors what field units already carry:
//! `sensor_keys/{tenant}/{device}/sensor_{private,public}.pem`, with a
//! legacy untenanted `sensor_keys/{device}/` location still honored on
//! lookup. Private keys are written 0600, directories 0700.

use common::signing;
use common::{ProtocolError, Result};
use log::info;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fs;
use std::path::{Path, PathBuf};

const PRIVATE_FILE: &str = "sensor_private.pem";
const PUBLIC_FILE: &str = "sensor_public.pem";

pub struct KeyVault {
    root: PathBuf,
}

impl KeyVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn device_dir(&self, device_id: &str, tenant_id: Option<&str>) -> PathBuf {
        match tenant_id {
            Some(tenant) => self.root.join(tenant).join(device_id),
            None => self.root.join(device_id),
        }
    }

    /// Generate a keypair if the device has none yet; idempotent otherwise.
    /// Returns the private key and whether it was newly created.
    pub fn ensure(&self, device_id: &str, tenant_id: Option<&str>) -> Result<(RsaPrivateKey, bool)> {
        if let Some(existing) = self.private_key(device_id, tenant_id)? {
            return Ok((existing, false));
        }
        let dir = self.device_dir(device_id, tenant_id);
        let key = signing::generate_keypair()?;
        write_keypair(&dir, &key)?;
        info!(
            "Generated keys for device '{}' at {}",
            device_id,
            dir.display()
        );
        Ok((key, true))
    }

    /// Destructive rotation: always generates and overwrites.
    pub fn rotate(&self, device_id: &str, tenant_id: Option<&str>) -> Result<RsaPrivateKey> {
        let dir = self
            .locate_with_tenant(device_id, tenant_id)
            .unwrap_or_else(|| self.device_dir(device_id, tenant_id));
        let key = signing::generate_keypair()?;
        write_keypair(&dir, &key)?;
        info!(
            "Rotated keys for device '{}' at {}",
            device_id,
            dir.display()
        );
        Ok(key)
    }

    /// Destroy all key material for the device+tenant pair, the legacy
    /// location included. Returns false when nothing was there (idempotent).
    pub fn remove(&self, device_id: &str, tenant_id: Option<&str>) -> Result<bool> {
        let mut removed = false;
        let mut targets = vec![self.root.join(device_id)];
        if let Some(tenant) = tenant_id {
            targets.push(self.root.join(tenant).join(device_id));
        }
        for dir in targets {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .map_err(|e| ProtocolError::InternalError(format!("delete failed: {}", e)))?;
                info!("Deleted key material at {}", dir.display());
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Read the private key for a device, tenant location first, then the
    /// legacy location, then any tenant folder when none was named.
    pub fn private_key(
        &self,
        device_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<RsaPrivateKey>> {
        match self.locate_with_tenant(device_id, tenant_id) {
            Some(dir) => read_private(&dir).map(Some),
            None => Ok(None),
        }
    }

    /// Locate a device's key directory with no tenant hint.
    pub fn find_private_key(&self, device_id: &str) -> Result<Option<RsaPrivateKey>> {
        self.private_key(device_id, None)
    }

    pub fn public_key_pem(&self, device_id: &str, tenant_id: Option<&str>) -> Result<Option<String>> {
        match self.locate_with_tenant(device_id, tenant_id) {
            Some(dir) => {
                let pem = fs::read_to_string(dir.join(PUBLIC_FILE))
                    .map_err(|e| ProtocolError::InternalError(e.to_string()))?;
                Ok(Some(pem))
            }
            None => Ok(None),
        }
    }

    pub fn has_keys(&self, device_id: &str, tenant_id: Option<&str>) -> bool {
        self.locate_with_tenant(device_id, tenant_id).is_some()
    }

    fn locate_with_tenant(&self, device_id: &str, tenant_id: Option<&str>) -> Option<PathBuf> {
        if let Some(tenant) = tenant_id {
            let dir = self.root.join(tenant).join(device_id);
            if dir.join(PRIVATE_FILE).exists() {
                return Some(dir);
            }
        }
        self.locate(device_id)
    }

    fn locate(&self, device_id: &str) -> Option<PathBuf> {
        let legacy = self.root.join(device_id);
        if legacy.join(PRIVATE_FILE).exists() {
            return Some(legacy);
        }
        // Scan tenant folders when the message did not say whose device it is.
        let entries = fs::read_dir(&self.root).ok()?;
        for entry in entries.flatten() {
            let candidate = entry.path().join(device_id);
            if candidate.join(PRIVATE_FILE).exists() {
                return Some(candidate);
            }
        }
        None
    }
}

fn read_private(dir: &Path) -> Result<RsaPrivateKey> {
    let pem = fs::read_to_string(dir.join(PRIVATE_FILE))
        .map_err(|e| ProtocolError::InternalError(e.to_string()))?;
    signing::private_key_from_pem(&pem)
}

fn write_keypair(dir: &Path, key: &RsaPrivateKey) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| ProtocolError::InternalError(e.to_string()))?;
    let private_path = dir.join(PRIVATE_FILE);
    let public_path = dir.join(PUBLIC_FILE);
    fs::write(&private_path, signing::private_key_to_pem(key)?)
        .map_err(|e| ProtocolError::InternalError(e.to_string()))?;
    fs::write(
        &public_path,
        signing::public_key_to_pem(&RsaPublicKey::from(key))?,
    )
    .map_err(|e| ProtocolError::InternalError(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&private_path, fs::Permissions::from_mode(0o600))?;
        fs::set_permissions(&public_path, fs::Permissions::from_mode(0o644))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault() -> KeyVault {
        let dir = std::env::temp_dir().join(format!("vault-test-{}", uuid::Uuid::new_v4()));
        KeyVault::new(dir)
    }

    #[test]
    fn ensure_is_idempotent() {
        let vault = temp_vault();
        let (first, created) = vault.ensure("pH01", Some("t1")).unwrap();
        assert!(created);
        let (second, created) = vault.ensure("pH01", Some("t1")).unwrap();
        assert!(!created);
        assert_eq!(first, second);
        let _ = fs::remove_dir_all(vault.root());
    }

    #[test]
    fn rotate_replaces_the_keypair() {
        let vault = temp_vault();
        let (original, _) = vault.ensure("pH01", Some("t1")).unwrap();
        let rotated = vault.rotate("pH01", Some("t1")).unwrap();
        assert_ne!(original, rotated);
        let (loaded, created) = vault.ensure("pH01", Some("t1")).unwrap();
        assert!(!created);
        assert_eq!(loaded, rotated);
        let _ = fs::remove_dir_all(vault.root());
    }

    #[test]
    fn remove_is_idempotent() {
        let vault = temp_vault();
        vault.ensure("pH01", Some("t1")).unwrap();
        assert!(vault.remove("pH01", Some("t1")).unwrap());
        assert!(!vault.remove("pH01", Some("t1")).unwrap());
        assert!(!vault.has_keys("pH01", Some("t1")));
        let _ = fs::remove_dir_all(vault.root());
    }

    #[test]
    fn lookup_scans_tenant_folders() {
        let vault = temp_vault();
        vault.ensure("tds02", Some("t9")).unwrap();
        assert!(vault.find_private_key("tds02").unwrap().is_some());
        assert!(vault.find_private_key("ghost").unwrap().is_none());
        let _ = fs::remove_dir_all(vault.root());
    }
}
