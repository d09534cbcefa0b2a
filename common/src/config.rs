use crate::error::Result;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Replay-protection limits. Defaults match the deployed brokers: a 50-entry
/// nonce window, two minutes of tolerated clock skew, and a 30 second
/// payload-hash window for messages carrying neither nonce nor timestamp.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub nonce_cache_size: usize,
    pub max_skew_seconds: i64,
    pub payload_cache_size: usize,
    pub payload_window_seconds: i64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            nonce_cache_size: 50,
            max_skew_seconds: 120,
            payload_cache_size: 20,
            payload_window_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub redis_url: String,
    /// PEM file holding the collector's RSA private key. When unset an
    /// ephemeral key is generated at startup.
    pub server_key_path: Option<String>,
    pub challenge_ttl_seconds: i64,
    pub session_ttl_seconds: i64,
    pub require_device_session: bool,
    pub provision_topic_base: String,
    pub keys_topic_base: String,
    pub status_topic_base: String,
    pub replay: ReplayConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        Ok(Self {
            bind_address: env_or("BIND_ADDRESS", "127.0.0.1:8080"),
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            server_key_path: std::env::var("SERVER_KEY_PATH").ok(),
            challenge_ttl_seconds: env_parse("DEVICE_CHALLENGE_TTL_SECONDS", 60),
            session_ttl_seconds: env_parse("DEVICE_SESSION_TTL_SECONDS", 900),
            require_device_session: env_or("REQUIRE_DEVICE_SESSION", "true")
                .eq_ignore_ascii_case("true"),
            provision_topic_base: env_or("PROVISION_TOPIC_BASE", "provision"),
            keys_topic_base: env_or("KEYS_TOPIC_BASE", "keys"),
            status_topic_base: env_or("STATUS_TOPIC_BASE", "status"),
            replay: ReplayConfig {
                nonce_cache_size: env_parse("REPLAY_NONCE_CACHE_SIZE", 50),
                max_skew_seconds: env_parse("REPLAY_MAX_SKEW_SECONDS", 120),
                payload_cache_size: env_parse("REPLAY_PAYLOAD_CACHE_SIZE", 20),
                payload_window_seconds: env_parse("REPLAY_PAYLOAD_WINDOW_SECONDS", 30),
            },
        })
    }
}
