use std::time::Duration;

use futures_util::{Stream, StreamExt};
use protocol::{ClientType, ControllerMessage, DEFAULT_SCAN_TIMEOUT_MS};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    channel::ControllerChannel, router::CommandRouter, sessions::SessionRegistry,
};

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub scan_timeout_ms: u64,
    pub result_timeout: Duration,
    /// How long a new channel may stay silent before announcing itself.
    pub announce_timeout: Duration,
    pub channel_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: DEFAULT_SCAN_TIMEOUT_MS,
            result_timeout: Duration::from_secs(30),
            announce_timeout: Duration::from_secs(10),
            channel_buffer: 64,
        }
    }
}

/// Session registry and command router sharing one view of live controllers.
#[derive(Clone)]
pub struct Relay {
    sessions: SessionRegistry,
    router: CommandRouter,
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let sessions = SessionRegistry::new(config.scan_timeout_ms);
        let router = CommandRouter::new(sessions.clone(), config.result_timeout);
        Self {
            sessions,
            router,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Drives one inbound channel until it closes.
    ///
    /// The first frame must announce a controller; anything else ends the
    /// channel without creating a session. Once registered, device reports are
    /// merged into the session and results are handed to the router. When the
    /// inbound side ends the session is removed and its waiters are failed.
    pub async fn serve_channel<S>(&self, mut inbound: S, channel: ControllerChannel)
    where
        S: Stream<Item = ControllerMessage> + Unpin,
    {
        let ready = match timeout(self.config.announce_timeout, inbound.next()).await {
            Ok(Some(ControllerMessage::ClientReady(ready))) => ready,
            Ok(Some(other)) => {
                warn!(event = other.event(), "channel spoke before announcing itself");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!("channel never announced itself");
                return;
            }
        };
        if ready.client_type != ClientType::Controller {
            debug!(name = %ready.name, "ignoring non-controller client");
            return;
        }

        let info = match self.sessions.register(&ready.name, channel).await {
            Ok(info) => info,
            Err(err) => {
                warn!(name = %ready.name, "failed to register controller: {err}");
                return;
            }
        };
        let controller_id = info.controller_id;

        while let Some(message) = inbound.next().await {
            match message {
                ControllerMessage::Device(device) => {
                    if let Err(err) = self.sessions.record_device(&controller_id, device).await {
                        warn!(controller_id = %controller_id, "dropping device report: {err}");
                    }
                }
                ControllerMessage::CommandResult(result) => {
                    self.router.resolve(&controller_id, result).await;
                }
                ControllerMessage::ClientReady(_) => {
                    debug!(controller_id = %controller_id, "ignoring repeated announcement");
                }
            }
        }

        self.sessions.remove(&controller_id).await;
        let failed = self.router.fail_pending(&controller_id).await;
        if failed > 0 {
            info!(controller_id = %controller_id, failed, "failed pending results for closed channel");
        }
    }
}
