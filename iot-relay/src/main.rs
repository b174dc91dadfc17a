use std::{net::SocketAddr, time::Duration};

use clap::{ArgAction, Parser};
use iot_relay::{Relay, RelayConfig, SessionEvent, build_relay_app};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "iot-relay", disable_version_flag = true)]
struct Cli {
    #[arg(long, env = "IOT_RELAY_ADDR", default_value = "0.0.0.0:3000")]
    addr: SocketAddr,

    /// Scan duration requested from every newly announced controller.
    #[arg(long, env = "IOT_RELAY_SCAN_TIMEOUT_MS", default_value_t = 30_000)]
    scan_timeout_ms: u64,

    /// How long a tagged command waits for its result.
    #[arg(long, env = "IOT_RELAY_RESULT_TIMEOUT_MS", default_value_t = 30_000)]
    result_timeout_ms: u64,

    #[arg(long, env = "IOT_RELAY_ANNOUNCE_TIMEOUT_MS", default_value_t = 10_000)]
    announce_timeout_ms: u64,

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

    init_logging();
    info!("{}", binary_version_text());

    let relay = Relay::new(RelayConfig {
        scan_timeout_ms: cli.scan_timeout_ms,
        result_timeout: Duration::from_millis(cli.result_timeout_ms.max(1)),
        announce_timeout: Duration::from_millis(cli.announce_timeout_ms.max(1)),
        ..RelayConfig::default()
    });
    tokio::spawn(log_session_events(relay.sessions().subscribe()));

    let app = build_relay_app(relay);
    let listener = tokio::net::TcpListener::bind(cli.addr).await?;
    info!("relay listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_logging() {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn log_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::ControllerConnected(info)) => {
                info!(controller_id = %info.controller_id, name = %info.name, "session opened");
            }
            Ok(SessionEvent::ControllerDisconnected(info)) => {
                info!(controller_id = %info.controller_id, name = %info.name, "session closed");
            }
            Ok(SessionEvent::DeviceUpdated {
                controller_id,
                device,
            }) => {
                info!(
                    controller_id = %controller_id,
                    device_id = %device.device_id,
                    name = %device.name,
                    connected = device.connected,
                    "device updated"
                );
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
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
