use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::signing::urlsafe_token;
use common::{DeviceSession, ProtocolError, Result};
use log::info;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Client as RedisClient;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const TOKEN_BYTES: usize = 48;
const MINT_ATTEMPTS: usize = 10;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no session token supplied")]
    MissingSession,
    #[error("unknown session token")]
    InvalidSession,
    #[error("session bound to a different device")]
    DeviceMismatch,
    #[error("session expired")]
    SessionExpired,
    #[error("counter not strictly greater than last accepted")]
    CounterReused,
    #[error("counter is not a valid integer")]
    CounterInvalid,
    #[error("exhausted session token mint attempts")]
    ExhaustedRetries,
    #[error(transparent)]
    Storage(#[from] ProtocolError),
}

impl SessionError {
    /// Stable snake_case reason surfaced on the wire.
    pub fn reason(&self) -> &'static str {
        match self {
            SessionError::MissingSession => "missing_session",
            SessionError::InvalidSession => "invalid_session",
            SessionError::DeviceMismatch => "device_mismatch",
            SessionError::SessionExpired => "session_expired",
            SessionError::CounterReused => "counter_reused",
            SessionError::CounterInvalid => "counter_invalid",
            SessionError::ExhaustedRetries => "token_mint_failed",
            SessionError::Storage(_) => "storage_error",
        }
    }
}

/// Result of the atomic counter/expiry advance at the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceResult {
    Advanced,
    CounterTooLow,
    Missing,
}

/// Persistence seam for device sessions. The advance operation must be a
/// single atomic read-modify-write so two concurrent submissions for the
/// same session cannot lose an update.
#[async_trait]
pub trait SessionBacking: Send + Sync {
    async fn get(&self, token: &str) -> Result<Option<DeviceSession>>;

    /// Insert only if the token is unused. Returns false on collision.
    async fn create(&self, session: &DeviceSession) -> Result<bool>;

    async fn advance(
        &self,
        token: &str,
        counter: Option<u64>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResult>;

    async fn delete(&self, token: &str) -> Result<()>;

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct SessionStore {
    backing: Arc<dyn SessionBacking>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(backing: Arc<dyn SessionBacking>, ttl_seconds: i64) -> Self {
        Self {
            backing,
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    pub fn backing(&self) -> &Arc<dyn SessionBacking> {
        &self.backing
    }

    /// Mint a fresh session for a device that just proved key possession.
    pub async fn establish(&self, device_id: &str) -> std::result::Result<DeviceSession, SessionError> {
        let now = Utc::now();
        for _ in 0..MINT_ATTEMPTS {
            let session = DeviceSession {
                session_token: urlsafe_token(TOKEN_BYTES),
                device_id: device_id.to_string(),
                counter: 0,
                expires_at: now + self.ttl,
                created_at: now,
                last_used_at: now,
            };
            if self.backing.create(&session).await? {
                info!("Established session for device {}", device_id);
                return Ok(session);
            }
        }
        Err(SessionError::ExhaustedRetries)
    }

    /// Validate a session and, on success, advance it: the counter (when
    /// supplied) must be strictly greater than the stored one, and the
    /// expiry always slides forward. Successful validation mutates
    /// persisted state; callers must treat it as non-idempotent.
    pub async fn validate(
        &self,
        token: Option<&str>,
        device_id: &str,
        counter: Option<u64>,
    ) -> std::result::Result<(), SessionError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(SessionError::MissingSession)?;
        let session = self
            .backing
            .get(token)
            .await?
            .ok_or(SessionError::InvalidSession)?;

        if !session.device_id.eq_ignore_ascii_case(device_id) {
            return Err(SessionError::DeviceMismatch);
        }

        let now = Utc::now();
        if now > session.expires_at {
            let _ = self.backing.delete(token).await;
            return Err(SessionError::SessionExpired);
        }

        match self
            .backing
            .advance(token, counter, now + self.ttl, now)
            .await?
        {
            AdvanceResult::Advanced => Ok(()),
            AdvanceResult::CounterTooLow => Err(SessionError::CounterReused),
            AdvanceResult::Missing => Err(SessionError::InvalidSession),
        }
    }

    pub async fn sweep(&self) -> Result<usize> {
        self.backing.sweep(Utc::now()).await
    }
}

/// In-memory backing; one mutex makes the advance trivially atomic.
pub struct MemorySessionBacking {
    sessions: Mutex<HashMap<String, DeviceSession>>,
}

impl MemorySessionBacking {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionBacking {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionBacking for MemorySessionBacking {
    async fn get(&self, token: &str) -> Result<Option<DeviceSession>> {
        Ok(self.sessions.lock().get(token).cloned())
    }

    async fn create(&self, session: &DeviceSession) -> Result<bool> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&session.session_token) {
            return Ok(false);
        }
        sessions.insert(session.session_token.clone(), session.clone());
        Ok(true)
    }

    async fn advance(
        &self,
        token: &str,
        counter: Option<u64>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResult> {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(token) else {
            return Ok(AdvanceResult::Missing);
        };
        if let Some(counter) = counter {
            if counter <= session.counter {
                return Ok(AdvanceResult::CounterTooLow);
            }
            session.counter = counter;
        }
        session.expires_at = expires_at;
        session.last_used_at = now;
        Ok(AdvanceResult::Advanced)
    }

    async fn delete(&self, token: &str) -> Result<()> {
        self.sessions.lock().remove(token);
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now <= s.expires_at);
        Ok(before - sessions.len())
    }
}

/// Counter compare + advance + expiry slide in one server-side script, so
/// the read-modify-write cannot interleave with a concurrent submission.
const ADVANCE_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'counter')
if not cur then return -2 end
if ARGV[1] ~= '' then
  if tonumber(ARGV[1]) <= tonumber(cur) then return -1 end
  redis.call('HSET', KEYS[1], 'counter', ARGV[1])
end
redis.call('HSET', KEYS[1], 'expires_at', ARGV[2], 'last_used_at', ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return 1
"#;

pub struct RedisSessionBacking {
    redis_client: Arc<RedisClient>,
}

impl RedisSessionBacking {
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

    fn session_key(token: &str) -> String {
        format!("device_session:{}", token)
    }

    fn parse_timestamp(value: Option<&String>) -> DateTime<Utc> {
        value
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

#[async_trait]
impl SessionBacking for RedisSessionBacking {
    async fn get(&self, token: &str) -> Result<Option<DeviceSession>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(Self::session_key(token))
            .query_async::<MultiplexedConnection, HashMap<String, String>>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(DeviceSession {
            session_token: token.to_string(),
            device_id: fields.get("device_id").cloned().unwrap_or_default(),
            counter: fields
                .get("counter")
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
            expires_at: Self::parse_timestamp(fields.get("expires_at")),
            created_at: Self::parse_timestamp(fields.get("created_at")),
            last_used_at: Self::parse_timestamp(fields.get("last_used_at")),
        }))
    }

    async fn create(&self, session: &DeviceSession) -> Result<bool> {
        let mut conn = self.connection().await?;
        let key = Self::session_key(&session.session_token);
        // HSETNX on a sentinel field doubles as the existence check.
        let claimed: i64 = redis::cmd("HSETNX")
            .arg(&key)
            .arg("device_id")
            .arg(&session.device_id)
            .query_async::<MultiplexedConnection, i64>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        if claimed == 0 {
            return Ok(false);
        }
        redis::cmd("HSET")
            .arg(&key)
            .arg("counter")
            .arg(session.counter)
            .arg("expires_at")
            .arg(session.expires_at.timestamp())
            .arg("created_at")
            .arg(session.created_at.timestamp())
            .arg("last_used_at")
            .arg(session.last_used_at.timestamp())
            .query_async::<MultiplexedConnection, ()>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        let ttl = (session.expires_at - Utc::now()).num_seconds().max(1);
        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(ttl)
            .query_async::<MultiplexedConnection, ()>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        Ok(true)
    }

    async fn advance(
        &self,
        token: &str,
        counter: Option<u64>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<AdvanceResult> {
        let mut conn = self.connection().await?;
        let counter_arg = counter.map(|c| c.to_string()).unwrap_or_default();
        let ttl = (expires_at - now).num_seconds().max(1);
        let outcome: i64 = redis::cmd("EVAL")
            .arg(ADVANCE_SCRIPT)
            .arg(1)
            .arg(Self::session_key(token))
            .arg(counter_arg)
            .arg(expires_at.timestamp())
            .arg(now.timestamp())
            .arg(ttl)
            .query_async::<MultiplexedConnection, i64>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        Ok(match outcome {
            1 => AdvanceResult::Advanced,
            -1 => AdvanceResult::CounterTooLow,
            _ => AdvanceResult::Missing,
        })
    }

    async fn delete(&self, token: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("DEL")
            .arg(Self::session_key(token))
            .query_async::<MultiplexedConnection, ()>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        Ok(())
    }

    async fn sweep(&self, _now: DateTime<Utc>) -> Result<usize> {
        // Redis expires session hashes itself via the per-key TTL.
        Ok(0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let response: String = redis::cmd("PING")
            .query_async::<MultiplexedConnection, String>(&mut conn)
            .await
            .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(ProtocolError::StorageTransient(
                "unexpected PING response".to_string(),
            ))
        }
    }
}
