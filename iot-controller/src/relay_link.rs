use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::{
    ClientReady, Command, CommandResult, ControllerMessage, ProtocolError, RelayMessage,
    command_tag, decode_frame, encode_frame,
};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{
    commands::CommandDriver, error::DeviceError, logging::category_relay, registry::DeviceEvent,
};

const OUTBOUND_BUFFER: usize = 128;

type LinkError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Debug)]
pub struct RelayLinkConfig {
    pub relay_url: String,
    pub name: String,
    /// Name filters applied to every scan the relay requests.
    pub filters: Vec<String>,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
}

pub fn spawn_relay_link(
    commands: CommandDriver,
    config: RelayLinkConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_relay_link(commands, config).await;
    })
}

/// Keeps a channel to the relay open, reconnecting with exponential backoff.
/// Every new channel re-announces this controller.
pub async fn run_relay_link(commands: CommandDriver, config: RelayLinkConfig) {
    let mut delay = config.reconnect_delay;
    loop {
        info!(
            "{} connecting to {} as {}",
            category_relay(),
            config.relay_url,
            config.name
        );
        match connect_and_run(&commands, &config).await {
            Ok(()) => {
                info!("{} channel closed, reconnecting", category_relay());
                delay = config.reconnect_delay;
            }
            Err(err) => {
                warn!(
                    "{} channel error: {err}, reconnecting in {}ms",
                    category_relay(),
                    delay.as_millis()
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
}

async fn connect_and_run(commands: &CommandDriver, config: &RelayLinkConfig) -> Result<(), LinkError> {
    let (socket, _response) = tokio_tungstenite::connect_async(config.relay_url.as_str()).await?;
    let (mut sink, mut stream) = socket.split();

    sink.send(Message::Text(
        encode_frame(&ControllerMessage::ClientReady(ClientReady::controller(
            config.name.clone(),
        )))?
        .into(),
    ))
    .await?;
    info!("{} announced as {}", category_relay(), config.name);

    let (outbound, mut outbound_rx) = mpsc::channel::<ControllerMessage>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("{} dropping {}: {err}", category_relay(), message.event());
                    continue;
                }
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut events = commands.registry().subscribe();
    let outcome: Result<(), LinkError> = loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(frame) = frame else { break Ok(()) };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break Ok(()),
                    Ok(_) => continue,
                    Err(err) => break Err(err.into()),
                };
                match decode_frame::<RelayMessage>(text.as_str()) {
                    Ok(message) => handle_relay_message(commands, config, &outbound, message).await,
                    Err(err) => reject_frame(&outbound, text.as_str(), err).await,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let summary = match event {
                            DeviceEvent::Detected(summary) | DeviceEvent::Disconnected(summary) => summary,
                        };
                        if outbound.send(ControllerMessage::Device(summary)).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} skipped {skipped} device events", category_relay());
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                }
            }
        }
    };

    drop(outbound);
    writer.abort();
    outcome
}

async fn handle_relay_message(
    commands: &CommandDriver,
    config: &RelayLinkConfig,
    outbound: &mpsc::Sender<ControllerMessage>,
    message: RelayMessage,
) {
    match message {
        RelayMessage::ScanRequest(request) => {
            info!(
                "{} scan requested for {}ms",
                category_relay(),
                request.scan_timeout
            );
            commands
                .registry()
                .scan(
                    Duration::from_millis(request.scan_timeout),
                    config.filters.clone(),
                )
                .await;
        }
        RelayMessage::Command(command) => {
            // Commands run independently so a slow device never stalls the channel.
            tokio::spawn(execute_command(commands.clone(), outbound.clone(), command));
        }
    }
}

/// Answers a tagged command that could not be decoded so the relay is not
/// left waiting for a result that will never come.
async fn reject_frame(
    outbound: &mpsc::Sender<ControllerMessage>,
    frame: &str,
    err: ProtocolError,
) {
    let Some(tag) = command_tag(frame) else {
        warn!("{} ignoring frame: {err}", category_relay());
        return;
    };
    warn!("{} rejecting command {tag}: {err}", category_relay());
    let failure = DeviceError::from(err).to_failure();
    let _ = outbound
        .send(ControllerMessage::CommandResult(CommandResult::failed(
            tag, failure,
        )))
        .await;
}

async fn execute_command(
    commands: CommandDriver,
    outbound: mpsc::Sender<ControllerMessage>,
    command: Command,
) {
    let cmd_id = command.action.cmd_id();
    let outcome = commands.execute(&command.device_id, &command.action).await;
    let result = match outcome {
        Ok(executed) => {
            if let Some(device) = executed.device {
                let _ = outbound.send(ControllerMessage::Device(device)).await;
            }
            debug!(
                "{} {cmd_id} on {} -> {}",
                category_relay(),
                command.device_id,
                executed.status
            );
            command
                .tag
                .map(|tag| CommandResult::ok(tag, executed.status))
        }
        Err(err) => {
            warn!(
                "{} {cmd_id} on {} failed: {err}",
                category_relay(),
                command.device_id
            );
            command
                .tag
                .map(|tag| CommandResult::failed(tag, err.to_failure()))
        }
    };

    if let Some(result) = result {
        let _ = outbound.send(ControllerMessage::CommandResult(result)).await;
    }
}
