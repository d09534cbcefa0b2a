//! Main entry point for the collector server.

use collector::identity::{RedisDirectory, SensorDirectory};
use collector::keysub::KeyAnnouncementSubscriber;
use collector::provision::ProvisioningPublisher;
use collector::readings::MemoryReadingSink;
use collector::server::CollectorServer;
use collector::session::{RedisSessionBacking, SessionStore};
use common::bus::LocalBus;
use common::cache::GuardedMap;
use common::replay::ReplayGuard;
use common::signing;
use common::{Config, ProtocolError, Result};
use env_logger::fmt::Color;
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;

const BANNER: &str = r#"
  Secure Sensor Collector
  device trust / E2EE envelopes / provisioning
"#;

fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder
        .format(|buf, record| {
            let mut level_style = buf.style();
            let level_color = match record.level() {
                log::Level::Error => Color::Red,
                log::Level::Warn => Color::Yellow,
                log::Level::Info => Color::Green,
                log::Level::Debug => Color::Cyan,
                log::Level::Trace => Color::White,
            };
            writeln!(
                buf,
                "{} {} [{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level_style.set_color(level_color).value(record.level()),
                record.target(),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .init();
}

fn load_server_key(config: &Config) -> Result<rsa::RsaPrivateKey> {
    match &config.server_key_path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .map_err(|e| ProtocolError::InternalError(format!("cannot read {}: {}", path, e)))?;
            info!("Loaded server key from {}", path);
            signing::private_key_from_pem(&pem)
        }
        None => {
            warn!("SERVER_KEY_PATH not set; generating an ephemeral server key");
            signing::generate_keypair()
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    setup_logger();
    println!("{}", BANNER);

    info!("Starting collector...");
    let config = Config::load()?;
    info!("Configuration loaded");

    info!("Connecting to session storage at {}", config.redis_url);
    let redis_client = redis::Client::open(config.redis_url.as_str())
        .map_err(|e| ProtocolError::StorageTransient(e.to_string()))?;

    let directory: Arc<dyn SensorDirectory> =
        Arc::new(RedisDirectory::new(redis_client.clone()));
    let sessions = SessionStore::new(
        Arc::new(RedisSessionBacking::new(redis_client)),
        config.session_ttl_seconds,
    );
    let replay = Arc::new(ReplayGuard::new(config.replay.clone()));
    let pending_keys = Arc::new(GuardedMap::new());
    let server_key = load_server_key(&config)?;

    // In-process bus; the broker-facing transport adapter is deployed
    // separately and bridges into this seam.
    let bus = Arc::new(LocalBus::new());
    let publisher = Arc::new(ProvisioningPublisher::new(
        bus.clone(),
        directory.clone(),
        &config.provision_topic_base,
    ));
    let readings = Arc::new(MemoryReadingSink::new());

    let subscriber = Arc::new(KeyAnnouncementSubscriber::new(
        directory.clone(),
        replay.clone(),
        bus.clone(),
        pending_keys.clone(),
        &config.keys_topic_base,
        &config.status_topic_base,
    ));

    let server = CollectorServer::new(
        config,
        directory,
        sessions,
        replay,
        publisher,
        readings,
        pending_keys,
        server_key,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let subscriber_handle = tokio::spawn(async move {
        subscriber.run(shutdown_rx).await;
    });

    info!("All services started");
    tokio::select! {
        result = server.start() => {
            info!("HTTP server stopped: {:?}", result);
        }
        _ = subscriber_handle => {
            info!("Key subscriber stopped");
        }
    }
    Ok(())
}
