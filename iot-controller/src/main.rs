use std::{sync::Arc, time::Duration};

use clap::{ArgAction, Parser};
use controller::{
    CommandDriver, DeviceRegistry, RegistryConfig, RelayLinkConfig, init_logging,
    simulated::SimulatedRadio, spawn_relay_link,
};
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "iot-controller", disable_version_flag = true)]
struct Cli {
    /// Relay channel endpoint.
    #[arg(
        long,
        env = "IOT_CONTROLLER_RELAY_URL",
        default_value = "ws://127.0.0.1:3000/iot/channel"
    )]
    relay_url: Url,

    /// Display name announced to the relay (defaults to the host name).
    #[arg(long, env = "IOT_CONTROLLER_NAME")]
    name: Option<String>,

    /// Device name filter, repeatable. `*` matches every device.
    #[arg(
        long = "filter",
        env = "IOT_CONTROLLER_FILTERS",
        value_delimiter = ',',
        default_value = "BB-"
    )]
    filters: Vec<String>,

    #[arg(long, env = "IOT_CONTROLLER_PATH_STEP_MS", default_value_t = 250)]
    path_step_ms: u64,

    #[arg(long, env = "IOT_CONTROLLER_DRIVER_TIMEOUT_MS", default_value_t = 10_000)]
    driver_timeout_ms: u64,

    #[arg(long, env = "IOT_CONTROLLER_RECONNECT_DELAY_MS", default_value_t = 1_000)]
    reconnect_delay_ms: u64,

    #[arg(long, env = "IOT_CONTROLLER_RECONNECT_MAX_DELAY_MS", default_value_t = 30_000)]
    reconnect_max_delay_ms: u64,

    /// Comma separated names of simulated devices to expose.
    #[arg(
        long,
        env = "IOT_CONTROLLER_SIMULATE",
        value_delimiter = ',',
        default_value = "BB-8A1F,BB-3C7E"
    )]
    simulate: Vec<String>,

    /// Print version information.
    #[arg(short = 'V', long, action = ArgAction::SetTrue)]
    version: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", binary_version_text());
        return Ok(());
    }

    init_logging()?;
    info!("{}", binary_version_text());

    let path_step = Duration::from_millis(cli.path_step_ms.max(1));
    let reconnect_delay = Duration::from_millis(cli.reconnect_delay_ms.max(1));
    let reconnect_max_delay =
        Duration::from_millis(cli.reconnect_max_delay_ms).max(reconnect_delay);

    let radio = Arc::new(SimulatedRadio::with_names(cli.simulate.iter().cloned()));
    info!(
        "using simulated radio with {} device(s): {}",
        cli.simulate.len(),
        cli.simulate.join(", ")
    );

    let registry = DeviceRegistry::new(
        radio,
        RegistryConfig {
            driver_timeout: Duration::from_millis(cli.driver_timeout_ms.max(1)),
        },
    );
    let commands = CommandDriver::new(registry.clone(), path_step);

    let name = cli.name.clone().unwrap_or_else(default_controller_name);
    let link = spawn_relay_link(
        commands,
        RelayLinkConfig {
            relay_url: cli.relay_url.to_string(),
            name,
            filters: cli.filters.clone(),
            reconnect_delay,
            reconnect_max_delay,
        },
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
    }
    info!("shutting down");
    link.abort();
    registry.shutdown().await;
    Ok(())
}

fn binary_version_text() -> String {
    let binary = env!("CARGO_PKG_NAME");
    let git_tag = option_env!("IOT_BUILD_GIT_TAG").unwrap_or("untagged");
    let git_commit = option_env!("IOT_BUILD_GIT_COMMIT").unwrap_or("unknown");
    let git_dirty = option_env!("IOT_BUILD_GIT_DIRTY").unwrap_or("false");
    let dirty = matches!(git_dirty, "true" | "1" | "yes" | "dirty");

    if dirty {
        format!("{binary} {git_tag} (dirty commit: {git_commit})")
    } else {
        format!("{binary} {git_tag}")
    }
}

fn default_controller_name() -> String {
    for key in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = std::env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    "iot-controller".to_string()
}
