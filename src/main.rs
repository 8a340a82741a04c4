// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! OpenWay BLE command line client

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openway_ble::bluetooth::{BleClient, BluezPlatform, TransferOutcome, TransferRequest};
use openway_ble::config::Config;

#[derive(Parser)]
#[command(name = "openway-ble", version, about = "Deliver OpenWay access tokens to a gate over BLE")]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write one access token to the gate
    Send {
        /// Token to deliver
        #[arg(long, env = "OPENWAY_TOKEN", hide_env_values = true)]
        token: String,

        /// Gate identifier (overrides the configured one)
        #[arg(long)]
        gate: Option<String>,

        /// Connect to this address instead of scanning
        #[arg(long)]
        address: Option<String>,
    },
    /// Show adapter and permission readiness
    Status,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("openway_ble=info".parse()?))
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_from(&config_path)?;
    info!("Configuration loaded from {}", config_path.display());

    match cli.command {
        Command::Send { token, gate, address } => {
            let mut ble = config.ble.clone();
            if address.is_some() {
                ble.fixed_address = address;
            }
            let request = TransferRequest::new(token, gate.or(config.delivery.gate_id.clone()))?;

            let platform = Arc::new(BluezPlatform::new().await?);
            let client = BleClient::new(platform, ble);

            let delivery = client.deliver(request);
            tokio::pin!(delivery);
            let outcome = tokio::select! {
                outcome = &mut delivery => outcome,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; cancelling delivery");
                    client.cancel();
                    delivery.await
                }
            };

            print_outcome(&outcome, cli.json)?;
            Ok(if outcome.delivered {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Status => {
            let platform = Arc::new(BluezPlatform::new().await?);
            let client = BleClient::new(platform, config.ble.clone());
            let readiness = client.ensure_ready().await;
            let target = client.config().target();
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "ready": readiness.is_ready(),
                        "reason": readiness.failure().map(|r| r.code()),
                        "target": target.to_string(),
                    })
                );
            } else {
                println!("Target: {}", target);
                match readiness.failure() {
                    None => println!("Ready"),
                    Some(reason) => println!("Not ready: {} ({})", reason, reason.code()),
                }
            }
            Ok(if readiness.is_ready() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Config => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("# {}", config_path.display());
                print!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_outcome(outcome: &TransferOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }
    match outcome.reason {
        None => println!("{}", outcome.message()),
        Some(reason) => {
            println!("{} ({})", outcome.message(), reason.code());
            if reason.is_transient() {
                println!("Retrying may help.");
            }
        }
    }
    Ok(())
}
