//! Per-device replay protection for bus-delivered messages.
//!
//! Three tiers, strongest first: a bounded nonce window, strict-monotonic
//! timestamps with a clock-skew bound, and a short-lived payload-hash cache
//! for messages carrying neither. The hash tier is a deliberately weaker
//! floor: it only blocks resubmission inside its window, so legitimate
//! client retries after the window still land.
//!
//! State is in-memory and resets on restart, which briefly reopens a narrow
//! replay window bounded by the TTLs above.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::config::ReplayConfig;
use crate::envelope::content_hash;
use crate::error::ProtocolError;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayRejection {
    #[error("duplicate nonce")]
    DuplicateNonce,
    #[error("timestamp outside allowed clock skew")]
    ClockSkew,
    #[error("timestamp not newer than last accepted")]
    NotMonotonic,
    #[error("duplicate payload within dedup window")]
    DuplicatePayload,
}

impl ReplayRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            ReplayRejection::DuplicateNonce => "duplicate_nonce",
            ReplayRejection::ClockSkew => "clock_skew",
            ReplayRejection::NotMonotonic => "not_monotonic",
            ReplayRejection::DuplicatePayload => "duplicate_payload",
        }
    }
}

impl From<ReplayRejection> for ProtocolError {
    fn from(rejection: ReplayRejection) -> Self {
        ProtocolError::ReplayRejected(rejection.to_string())
    }
}

#[derive(Default)]
struct DeviceRecord {
    nonce_order: VecDeque<String>,
    nonce_set: HashSet<String>,
    last_timestamp: Option<DateTime<Utc>>,
    payload_hashes: VecDeque<(String, DateTime<Utc>)>,
}

pub struct ReplayGuard {
    config: ReplayConfig,
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl ReplayGuard {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            config,
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Check a message against every applicable tier and, on acceptance,
    /// record it. Rejections leave no state behind.
    pub fn check_and_record(
        &self,
        device_id: &str,
        nonce: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
        payload: &[u8],
    ) -> Result<(), ReplayRejection> {
        self.check_at(Utc::now(), device_id, nonce, timestamp, payload)
    }

    fn check_at(
        &self,
        now: DateTime<Utc>,
        device_id: &str,
        nonce: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
        payload: &[u8],
    ) -> Result<(), ReplayRejection> {
        let mut devices = self.devices.lock();
        let record = devices.entry(device_id.to_string()).or_default();

        if let Some(nonce) = nonce {
            if record.nonce_set.contains(nonce) {
                return Err(ReplayRejection::DuplicateNonce);
            }
        }

        if let Some(timestamp) = timestamp {
            let skew = (now - timestamp).num_seconds().abs();
            if skew > self.config.max_skew_seconds {
                return Err(ReplayRejection::ClockSkew);
            }
            if let Some(last) = record.last_timestamp {
                if timestamp <= last {
                    return Err(ReplayRejection::NotMonotonic);
                }
            }
        }

        if nonce.is_none() && timestamp.is_none() {
            let window = Duration::seconds(self.config.payload_window_seconds);
            record.payload_hashes.retain(|(_, seen)| now - *seen <= window);
            let hash = content_hash(payload);
            if record.payload_hashes.iter().any(|(h, _)| *h == hash) {
                return Err(ReplayRejection::DuplicatePayload);
            }
            record.payload_hashes.push_back((hash, now));
            while record.payload_hashes.len() > self.config.payload_cache_size {
                record.payload_hashes.pop_front();
            }
        }

        // All checks passed: record what we saw.
        if let Some(timestamp) = timestamp {
            record.last_timestamp = Some(timestamp);
        }
        if let Some(nonce) = nonce {
            record.nonce_set.insert(nonce.to_string());
            record.nonce_order.push_back(nonce.to_string());
            while record.nonce_order.len() > self.config.nonce_cache_size {
                if let Some(evicted) = record.nonce_order.pop_front() {
                    record.nonce_set.remove(&evicted);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ReplayGuard {
        ReplayGuard::new(ReplayConfig::default())
    }

    #[test]
    fn duplicate_nonce_rejected() {
        let guard = guard();
        assert!(guard.check_and_record("d1", Some("n1"), None, b"").is_ok());
        assert_eq!(
            guard.check_and_record("d1", Some("n1"), None, b""),
            Err(ReplayRejection::DuplicateNonce)
        );
        // A different device has its own window.
        assert!(guard.check_and_record("d2", Some("n1"), None, b"").is_ok());
    }

    #[test]
    fn nonce_window_evicts_oldest() {
        let guard = ReplayGuard::new(ReplayConfig {
            nonce_cache_size: 2,
            ..ReplayConfig::default()
        });
        assert!(guard.check_and_record("d1", Some("a"), None, b"").is_ok());
        assert!(guard.check_and_record("d1", Some("b"), None, b"").is_ok());
        assert!(guard.check_and_record("d1", Some("c"), None, b"").is_ok());
        // "a" has been evicted and is accepted again.
        assert!(guard.check_and_record("d1", Some("a"), None, b"").is_ok());
        assert_eq!(
            guard.check_and_record("d1", Some("c"), None, b""),
            Err(ReplayRejection::DuplicateNonce)
        );
    }

    #[test]
    fn timestamp_must_be_monotonic_and_within_skew() {
        let guard = guard();
        let now = Utc::now();
        assert!(guard
            .check_at(now, "d1", None, Some(now - Duration::seconds(10)), b"")
            .is_ok());
        assert_eq!(
            guard.check_at(now, "d1", None, Some(now - Duration::seconds(10)), b""),
            Err(ReplayRejection::NotMonotonic)
        );
        assert_eq!(
            guard.check_at(now, "d1", None, Some(now - Duration::seconds(20)), b""),
            Err(ReplayRejection::NotMonotonic)
        );
        assert_eq!(
            guard.check_at(now, "d1", None, Some(now - Duration::seconds(500)), b""),
            Err(ReplayRejection::ClockSkew)
        );
        assert_eq!(
            guard.check_at(now, "d1", None, Some(now + Duration::seconds(500)), b""),
            Err(ReplayRejection::ClockSkew)
        );
        assert!(guard.check_at(now, "d1", None, Some(now), b"").is_ok());
    }

    #[test]
    fn payload_tier_dedups_within_window_only() {
        let guard = guard();
        let now = Utc::now();
        assert!(guard.check_at(now, "d1", None, None, b"reading-1").is_ok());
        assert_eq!(
            guard.check_at(now + Duration::seconds(5), "d1", None, None, b"reading-1"),
            Err(ReplayRejection::DuplicatePayload)
        );
        // Outside the 30s window the same bytes are a legitimate retry.
        assert!(guard
            .check_at(now + Duration::seconds(31), "d1", None, None, b"reading-1")
            .is_ok());
        // Different payloads never collide.
        assert!(guard.check_at(now, "d1", None, None, b"reading-2").is_ok());
    }

    #[test]
    fn payload_tier_skipped_when_nonce_present() {
        let guard = guard();
        assert!(guard.check_and_record("d1", Some("n1"), None, b"same").is_ok());
        // Same payload, fresh nonce: accepted, hash tier not consulted.
        assert!(guard.check_and_record("d1", Some("n2"), None, b"same").is_ok());
    }

    #[test]
    fn rejection_records_nothing() {
        let guard = guard();
        let now = Utc::now();
        // Skewed timestamp with a fresh nonce: rejected, and the nonce must
        // remain usable afterwards.
        assert_eq!(
            guard.check_at(
                now,
                "d1",
                Some("n1"),
                Some(now - Duration::seconds(999)),
                b""
            ),
            Err(ReplayRejection::ClockSkew)
        );
        assert!(guard.check_at(now, "d1", Some("n1"), Some(now), b"").is_ok());
    }
}
