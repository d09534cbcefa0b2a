use chrono::{Duration, Utc};
use common::cache::GuardedMap;
use common::signing::urlsafe_token;
use common::DeviceChallenge;
use log::{debug, info};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("challenge not found")]
    NotFound,
    #[error("challenge was issued for a different device")]
    DeviceMismatch,
    #[error("challenge expired")]
    Expired,
}

/// Issues short-lived random challenges that a device must sign to prove
/// possession of its private key. Challenges live only in process memory;
/// a restart drops them and devices simply request a new one.
pub struct ChallengeAuthority {
    challenges: GuardedMap<DeviceChallenge>,
    ttl: Duration,
}

impl ChallengeAuthority {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            challenges: GuardedMap::new(),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    /// Mint a challenge bound to `device_id`. Both the identifier and the
    /// secret carry at least 128 bits of entropy.
    pub fn issue(&self, device_id: &str) -> DeviceChallenge {
        let challenge = DeviceChallenge {
            challenge_id: urlsafe_token(16),
            device_id: device_id.to_string(),
            challenge_secret: urlsafe_token(32),
            expires_at: Utc::now() + self.ttl,
        };
        self.challenges
            .put(&challenge.challenge_id, challenge.clone(), Some(self.ttl));
        info!("Issued challenge {} for device {}", challenge.challenge_id, device_id);
        challenge
    }

    /// Consume a challenge exactly once, returning its secret. Expired
    /// entries are evicted on the way out.
    pub fn consume(&self, challenge_id: &str, device_id: &str) -> Result<String, ChallengeError> {
        let challenge = self
            .challenges
            .peek(challenge_id)
            .ok_or(ChallengeError::NotFound)?;

        if !challenge.device_id.eq_ignore_ascii_case(device_id) {
            return Err(ChallengeError::DeviceMismatch);
        }
        if Utc::now() > challenge.expires_at {
            self.challenges.delete(challenge_id);
            return Err(ChallengeError::Expired);
        }
        // The delete is the consumption point; a concurrent consumer that
        // lost the race sees NotFound.
        self.challenges
            .delete(challenge_id)
            .ok_or(ChallengeError::NotFound)?;
        Ok(challenge.challenge_secret)
    }

    /// Drop expired challenges to bound the table between lazy evictions.
    pub fn sweep(&self) -> usize {
        let removed = self.challenges.sweep();
        if removed > 0 {
            debug!("Swept {} expired challenges", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_is_single_use() {
        let authority = ChallengeAuthority::new(60);
        let challenge = authority.issue("pH01");
        let secret = authority
            .consume(&challenge.challenge_id, "pH01")
            .unwrap();
        assert_eq!(secret, challenge.challenge_secret);
        assert_eq!(
            authority.consume(&challenge.challenge_id, "pH01"),
            Err(ChallengeError::NotFound)
        );
    }

    #[test]
    fn device_mismatch_does_not_burn_the_challenge() {
        let authority = ChallengeAuthority::new(60);
        let challenge = authority.issue("pH01");
        assert_eq!(
            authority.consume(&challenge.challenge_id, "tds02"),
            Err(ChallengeError::DeviceMismatch)
        );
        // The rightful device can still consume it.
        assert!(authority.consume(&challenge.challenge_id, "pH01").is_ok());
    }

    #[test]
    fn expired_challenge_is_evicted() {
        let authority = ChallengeAuthority::new(-1);
        let challenge = authority.issue("pH01");
        assert_eq!(
            authority.consume(&challenge.challenge_id, "pH01"),
            Err(ChallengeError::Expired)
        );
        assert_eq!(
            authority.consume(&challenge.challenge_id, "pH01"),
            Err(ChallengeError::NotFound)
        );
    }

    #[test]
    fn device_id_comparison_is_case_insensitive() {
        let authority = ChallengeAuthority::new(60);
        let challenge = authority.issue("pH01");
        assert!(authority.consume(&challenge.challenge_id, "PH01").is_ok());
    }

    #[test]
    fn sweep_bounds_the_table() {
        let authority = ChallengeAuthority::new(-1);
        authority.issue("a");
        authority.issue("b");
        assert_eq!(authority.sweep(), 2);
    }
}
