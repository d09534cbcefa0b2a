//! Tenant-scoped landing point for accepted readings.
//!
//! Aggregation, history, and dashboards are external collaborators; the
//! protocol only needs somewhere to hand a verified reading together with
//! the identity it resolved to.

use async_trait::async_trait;
use common::{Result, SensorIdentity, SensorReading};
use log::info;
use parking_lot::Mutex;

#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn store(&self, identity: &SensorIdentity, reading: &SensorReading) -> Result<()>;
}

/// Keeps accepted readings in memory; used in tests and as the single-node
/// default until a database sink is wired in.
pub struct MemoryReadingSink {
    readings: Mutex<Vec<(SensorIdentity, SensorReading)>>,
}

impl MemoryReadingSink {
    pub fn new() -> Self {
        Self {
            readings: Mutex::new(Vec::new()),
        }
    }

    pub fn accepted(&self) -> Vec<(SensorIdentity, SensorReading)> {
        self.readings.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.readings.lock().len()
    }
}

impl Default for MemoryReadingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadingSink for MemoryReadingSink {
    async fn store(&self, identity: &SensorIdentity, reading: &SensorReading) -> Result<()> {
        info!(
            "Stored reading from device {} (tenant {})",
            identity.device_id, identity.tenant_id
        );
        self.readings
            .lock()
            .push((identity.clone(), reading.clone()));
        Ok(())
    }
}
