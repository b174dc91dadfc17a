use protocol::RelayMessage;
use tokio::sync::mpsc;

use crate::error::RelayError;

/// Relay side of one controller link. Frames sent here are written to the
/// controller in order by whoever owns the paired receiver.
#[derive(Clone, Debug)]
pub struct ControllerChannel {
    tx: mpsc::Sender<RelayMessage>,
}

impl ControllerChannel {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| RelayError::ChannelClosed)
    }
}
