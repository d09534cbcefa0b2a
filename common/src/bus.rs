//! Message-bus semantics: topic grammar, the closed provisioning action set,
//! the bus seam, and listener supervision.
//!
//! The transport itself (broker connection, TLS, keepalive) is an external
//! collaborator; everything here is expressed against the [`MessageBus`]
//! trait so the protocol logic never sees a socket. [`LocalBus`] is the
//! in-process implementation used by tests and single-node wiring.

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::error::{ProtocolError, Result};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The closed set of provisioning actions. Decoded once at the bus boundary;
/// anything else is rejected before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionAction {
    Request,
    Update,
    Delete,
}

impl ProvisionAction {
    pub fn parse(segment: &str) -> Option<Self> {
        match segment {
            "request" => Some(ProvisionAction::Request),
            "update" => Some(ProvisionAction::Update),
            "delete" => Some(ProvisionAction::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionAction::Request => "request",
            ProvisionAction::Update => "update",
            ProvisionAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionTopic {
    pub device_id: String,
    pub action: ProvisionAction,
}

pub fn provision_topic(base: &str, device_id: &str, action: ProvisionAction) -> String {
    format!("{}/{}/{}", base, device_id, action.as_str())
}

pub fn parse_provision_topic(base: &str, topic: &str) -> Option<ProvisionTopic> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    let (device_id, action) = rest.split_once('/')?;
    if device_id.is_empty() || action.contains('/') {
        return None;
    }
    Some(ProvisionTopic {
        device_id: device_id.to_string(),
        action: ProvisionAction::parse(action)?,
    })
}

pub fn keys_topic(base: &str, device_id: &str) -> String {
    format!("{}/{}/public", base, device_id)
}

pub fn parse_keys_topic(base: &str, topic: &str) -> Option<String> {
    let rest = topic.strip_prefix(base)?.strip_prefix('/')?;
    let (device_id, tail) = rest.split_once('/')?;
    if device_id.is_empty() || tail != "public" {
        return None;
    }
    Some(device_id.to_string())
}

pub fn status_topic(base: &str, device_id: &str) -> String {
    format!("{}/{}/replay", base, device_id)
}

/// Segment-wise topic match; `+` matches exactly one segment.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');
    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (None, None) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            _ => return false,
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>>;
}

/// In-process bus with single-level wildcard matching.
pub struct LocalBus {
    subscribers: Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|(_, tx)| !tx.is_closed());
            subscribers
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        for target in targets {
            if target.send(message.clone()).await.is_err() {
                warn!("Bus subscriber dropped while delivering to {}", topic);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers.lock().push((filter.to_string(), tx));
        Ok(rx)
    }
}

/// Bounded exponential backoff for supervised listeners.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Run a listener under supervision: restart on failure with bounded
/// backoff, stop cleanly when the shutdown signal flips.
pub async fn run_supervised<F, Fut>(
    name: &str,
    policy: &BackoffPolicy,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            info!("{}: shutdown requested", name);
            return;
        }

        let outcome = tokio::select! {
            result = task() => Some(result),
            _ = shutdown.changed() => None,
        };

        match outcome {
            None => continue,
            Some(Ok(())) => {
                info!("{}: listener finished", name);
                return;
            }
            Some(Err(e)) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    error!("{}: giving up after {} attempts: {}", name, attempt, e);
                    return;
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "{}: listener failed (attempt {}/{}): {}; retrying in {:?}",
                    name, attempt, policy.max_attempts, e, delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Drain a subscription, dispatching each message to a bounded worker so one
/// slow or malformed message cannot stall the subscription.
pub async fn pump<H, Fut>(
    mut rx: mpsc::Receiver<BusMessage>,
    workers: usize,
    mut shutdown: watch::Receiver<bool>,
    handler: H,
) where
    H: Fn(BusMessage) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(workers));
    loop {
        tokio::select! {
            message = rx.recv() => {
                let Some(message) = message else { return };
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    handler(message).await;
                    drop(permit);
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

impl From<tokio::sync::mpsc::error::SendError<BusMessage>> for ProtocolError {
    fn from(err: tokio::sync::mpsc::error::SendError<BusMessage>) -> Self {
        ProtocolError::BusError(err.to_string())
    }
}

/// Build the payload announced on the status topic when a replay rejection
/// is observed, for operators watching the bus.
pub fn replay_status_payload(device_id: &str, reason: &str) -> Vec<u8> {
    serde_json::json!({
        "device_id": device_id,
        "event": "replay_rejected",
        "reason": reason,
        "observed_at": Utc::now(),
    })
    .to_string()
    .into_bytes()
}
