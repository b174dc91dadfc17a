use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use protocol::{ControllerMessage, decode_frame, encode_frame};
use tracing::{debug, warn};

use crate::{channel::ControllerChannel, relay::Relay};

pub(super) async fn channel_handler(ws: WebSocketUpgrade, State(relay): State<Relay>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(relay, socket))
}

async fn serve_socket(relay: Relay, socket: WebSocket) {
    let (mut sink, stream) = socket.split();
    let (channel, mut outbound) = ControllerChannel::new(relay.config().channel_buffer);

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = match encode_frame(&message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(event = message.event(), "dropping outbound frame: {err}");
                    continue;
                }
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let inbound = stream
        .take_while(|frame| {
            let open = matches!(frame, Ok(message) if !matches!(message, Message::Close(_)));
            async move { open }
        })
        .filter_map(|frame| async move {
            let Ok(Message::Text(text)) = frame else {
                return None;
            };
            match decode_frame::<ControllerMessage>(text.as_str()) {
                Ok(message) => Some(message),
                Err(err) => {
                    debug!("ignoring undecodable frame: {err}");
                    None
                }
            }
        });

    relay.serve_channel(Box::pin(inbound), channel).await;
    writer.abort();
}
