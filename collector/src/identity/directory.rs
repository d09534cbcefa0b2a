use async_trait::async_trait;
use common::{IdentityStatus, ProtocolError, Result, SensorIdentity};
use log::info;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::Client as RedisClient;
use std::sync::Arc;

/// Read/write surface over the tenant-scoped sensor registrations.
///
/// The registration UI owns row creation in production; inside the protocol
/// the resolver reads rows and the key-announcement subscriber lands
/// provisioned public keys.
#[async_trait]
pub trait SensorDirectory: Send + Sync {
    /// Every registration sharing this device identifier, across tenants.
    async fn list_by_device_id(&self, device_id: &str) -> Result<Vec<SensorIdentity>>;

    async fn find(&self, tenant_id: &str, device_id: &str) -> Result<Option<SensorIdentity>>;

    /// Insert or replace a registration. Rejects a public key that is
    /// already bound to the same device identifier under another tenant;
    /// duplicate keys across tenants would make signature resolution
    /// ambiguous, so they are stopped here rather than at verification.
    async fn upsert(&self, identity: SensorIdentity) -> Result<()>;

    /// Land a provisioned public key. With a tenant the matching row is
    /// updated; without one the first row for the device is used (the
    /// announcement did not say which tenant it belongs to). Returns false
    /// when no row matched.
    async fn set_public_key(
        &self,
        device_id: &str,
        tenant_id: Option<&str>,
        public_key: &str,
    ) -> Result<bool>;

    async fn set_status(
        &self,
        tenant_id: &str,
        device_id: &str,
        status: IdentityStatus,
    ) -> Result<bool>;
}

fn duplicate_key_guard(rows: &[SensorIdentity], candidate: &SensorIdentity) -> Result<()> {
    if let Some(pem) = &candidate.public_key {
        let clash = rows.iter().any(|row| {
            row.tenant_id != candidate.tenant_id
                && row.public_key.as_deref() == Some(pem.as_str())
        });
        if clash {
            return Err(ProtocolError::ProtocolViolation(format!(
                "public key already registered for device '{}' under another tenant",
                candidate.device_id
            )));
        }
    }
    Ok(())
}

/// Directory held entirely in process memory; the test double and the
/// single-node default.
pub struct InMemoryDirectory {
    rows: RwLock<Vec<SensorIdentity>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorDirectory for InMemoryDirectory {
    async fn list_by_device_id(&self, device_id: &str) -> Result<Vec<SensorIdentity>> {
        Ok(self
            .rows
            .read()
            .iter()
            .filter(|row| row.device_id.eq_ignore_ascii_case(device_id))
            .cloned()
            .collect())
    }

    async fn find(&self, tenant_id: &str, device_id: &str) -> Result<Option<SensorIdentity>> {
        Ok(self
            .rows
            .read()
            .iter()
            .find(|row| {
                row.tenant_id == tenant_id && row.device_id.eq_ignore_ascii_case(device_id)
            })
            .cloned())
    }

    async fn upsert(&self, identity: SensorIdentity) -> Result<()> {
        let mut rows = self.rows.write();
        let siblings: Vec<SensorIdentity> = rows
            .iter()
            .filter(|row| row.device_id.eq_ignore_ascii_case(&identity.device_id))
            .cloned()
            .collect();
        duplicate_key_guard(&siblings, &identity)?;

        match rows.iter_mut().find(|row| {
            row.tenant_id == identity.tenant_id
                && row.device_id.eq_ignore_ascii_case(&identity.device_id)
        }) {
            Some(existing) => *existing = identity,
            None => rows.push(identity),
        }
        Ok(())
    }

    async fn set_public_key(
        &self,
        device_id: &str,
        tenant_id: Option<&str>,
        public_key: &str,
    ) -> Result<bool> {
        let mut rows = self.rows.write();
        let row = rows.iter_mut().find(|row| {
            row.device_id.eq_ignore_ascii_case(device_id)
                && tenant_id.map_or(true, |t| row.tenant_id == t)
        });
        match row {
            Some(row) => {
                row.public_key = Some(public_key.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        device_id: &str,
        status: IdentityStatus,
    ) -> Result<bool> {
        let mut rows = self.rows.write();
        match rows.iter_mut().find(|row| {
            row.tenant_id == tenant_id && row.device_id.eq_ignore_ascii_case(device_id)
        }) {
            Some(row) => {
                row.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Redis-backed directory. Rows are JSON blobs keyed per tenant+device with
/// a per-device index set so cross-tenant lookups stay one round trip per
/// row.
pub struct RedisDirectory {
    redis_client: Arc<RedisClient>,
}

impl RedisDirectory {
    pub fn new(redis_client: RedisClient) -> Self {
        Self {
            redis_client: Arc::new(redis_client),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        self.redis_client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))
    }

    fn row_key(tenant_id: &str, device_id: &str) -> String {
        format!("sensor:{}:{}", tenant_id, device_id.to_lowercase())
    }

    fn index_key(device_id: &str) -> String {
        format!("sensors:device:{}", device_id.to_lowercase())
    }
}

#[async_trait]
impl SensorDirectory for RedisDirectory {
    async fn list_by_device_id(&self, device_id: &str) -> Result<Vec<SensorIdentity>> {
        let mut conn = self.connection().await?;
        let tenants: Vec<String> = redis::cmd("SMEMBERS")
            .arg(Self::index_key(device_id))
            .query_async::<MultiplexedConnection, Vec<String>>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;

        let mut rows = Vec::new();
        for tenant in tenants {
            let data: Option<String> = redis::cmd("GET")
                .arg(Self::row_key(&tenant, device_id))
                .query_async::<MultiplexedConnection, Option<String>>(&mut conn)
                .await
                .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
            if let Some(data) = data {
                rows.push(serde_json::from_str(&data)?);
            }
        }
        Ok(rows)
    }

    async fn find(&self, tenant_id: &str, device_id: &str) -> Result<Option<SensorIdentity>> {
        let mut conn = self.connection().await?;
        let data: Option<String> = redis::cmd("GET")
            .arg(Self::row_key(tenant_id, device_id))
            .query_async::<MultiplexedConnection, Option<String>>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, identity: SensorIdentity) -> Result<()> {
        let siblings = self.list_by_device_id(&identity.device_id).await?;
        duplicate_key_guard(&siblings, &identity)?;

        let mut conn = self.connection().await?;
        let data = serde_json::to_string(&identity)?;
        redis::cmd("SET")
            .arg(Self::row_key(&identity.tenant_id, &identity.device_id))
            .arg(data)
            .query_async::<MultiplexedConnection, ()>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        redis::cmd("SADD")
            .arg(Self::index_key(&identity.device_id))
            .arg(&identity.tenant_id)
            .query_async::<MultiplexedConnection, ()>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        info!(
            "Registered sensor '{}' for tenant {}",
            identity.device_id, identity.tenant_id
        );
        Ok(())
    }

    async fn set_public_key(
        &self,
        device_id: &str,
        tenant_id: Option<&str>,
        public_key: &str,
    ) -> Result<bool> {
        let rows = self.list_by_device_id(device_id).await?;
        let target = match tenant_id {
            Some(tenant) => rows.into_iter().find(|row| row.tenant_id == tenant),
            None => rows.into_iter().next(),
        };
        let Some(mut row) = target else {
            return Ok(false);
        };
        row.public_key = Some(public_key.to_string());

        let mut conn = self.connection().await?;
        let data = serde_json::to_string(&row)?;
        redis::cmd("SET")
            .arg(Self::row_key(&row.tenant_id, &row.device_id))
            .arg(data)
            .query_async::<MultiplexedConnection, ()>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        Ok(true)
    }

    async fn set_status(
        &self,
        tenant_id: &str,
        device_id: &str,
        status: IdentityStatus,
    ) -> Result<bool> {
        let Some(mut row) = self.find(tenant_id, device_id).await? else {
            return Ok(false);
        };
        row.status = status;

        let mut conn = self.connection().await?;
        let data = serde_json::to_string(&row)?;
        redis::cmd("SET")
            .arg(Self::row_key(tenant_id, device_id))
            .arg(data)
            .query_async::<MultiplexedConnection, ()>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        Ok(true)
    }
}
