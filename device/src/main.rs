//! Field-device CLI: key management and secure reading submission.

use clap::{Parser, Subcommand};
use common::signing;
use common::{ProtocolError, Result};
use device::{DeviceSessionManager, KeyVault};
use log::{error, info};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "device-agent", about = "Secure sensor device client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate (or print) this device's keypair.
    Keygen {
        device_id: String,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value = "sensor_keys")]
        keys_dir: String,
    },
    /// Establish a session and submit readings.
    Submit {
        device_id: String,
        server_url: String,
        /// Path to the collector's public key PEM.
        #[arg(long)]
        server_public_key: String,
        #[arg(long)]
        tenant: Option<String>,
        #[arg(long, default_value = "sensor_keys")]
        keys_dir: String,
        #[arg(long, default_value = "ph")]
        device_type: String,
        /// Reading interval in seconds.
        #[arg(long, default_value_t = 60)]
        interval: u64,
        /// Submit one reading and exit.
        #[arg(long)]
        once: bool,
    },
}

/// Placeholder sensor read; real deployments wire their probes in here.
fn read_sensor_data() -> HashMap<String, serde_json::Value> {
    let mut rng = rand::thread_rng();
    let mut metrics = HashMap::new();
    metrics.insert("ph".to_string(), serde_json::json!(rng.gen_range(6.5..8.5)));
    metrics.insert("tds".to_string(), serde_json::json!(rng.gen_range(50..500)));
    metrics.insert(
        "turbidity".to_string(),
        serde_json::json!(rng.gen_range(0.0..5.0)),
    );
    metrics.insert(
        "temperature".to_string(),
        serde_json::json!(rng.gen_range(20.0..30.0)),
    );
    metrics
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter(None, log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Keygen {
            device_id,
            tenant,
            keys_dir,
        } => {
            let vault = KeyVault::new(keys_dir);
            let (_, created) = vault.ensure(&device_id, tenant.as_deref())?;
            if created {
                info!("Generated keypair for '{}'", device_id);
            } else {
                info!("Keys already exist for '{}'", device_id);
            }
            let pem = vault
                .public_key_pem(&device_id, tenant.as_deref())?
                .ok_or_else(|| ProtocolError::InternalError("public key missing".to_string()))?;
            println!("{}", pem);
            Ok(())
        }
        Command::Submit {
            device_id,
            server_url,
            server_public_key,
            tenant,
            keys_dir,
            device_type,
            interval,
            once,
        } => {
            let vault = KeyVault::new(keys_dir);
            let device_key = vault
                .private_key(&device_id, tenant.as_deref())?
                .ok_or_else(|| {
                    ProtocolError::AuthenticationFailure(format!(
                        "no private key for '{}'; run keygen first",
                        device_id
                    ))
                })?;
            let server_pem = std::fs::read_to_string(&server_public_key).map_err(|e| {
                ProtocolError::InternalError(format!("cannot read {}: {}", server_public_key, e))
            })?;
            let server_key = signing::public_key_from_pem(&server_pem)?;

            let mut manager =
                DeviceSessionManager::new(&device_id, &server_url, device_key, server_key);

            info!(
                "Device '{}' submitting to {} every {}s",
                device_id, server_url, interval
            );
            loop {
                if let Err(e) = manager
                    .submit_reading(&device_type, read_sensor_data())
                    .await
                {
                    error!("Submission failed: {}", e);
                }
                if once {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
            Ok(())
        }
    }
}
