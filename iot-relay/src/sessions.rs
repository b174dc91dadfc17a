use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use protocol::{DeviceSummary, RelayMessage, ScanRequest};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::info;
use uuid::Uuid;

use crate::{channel::ControllerChannel, error::RelayError};

const SESSION_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    pub controller_id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    ControllerConnected(ControllerInfo),
    ControllerDisconnected(ControllerInfo),
    DeviceUpdated {
        controller_id: String,
        device: DeviceSummary,
    },
}

struct ControllerSession {
    name: String,
    sequence: u64,
    channel: ControllerChannel,
    // First-seen order, unique by device id.
    devices: Vec<DeviceSummary>,
}

impl ControllerSession {
    fn info(&self, controller_id: &str) -> ControllerInfo {
        ControllerInfo {
            controller_id: controller_id.to_string(),
            name: self.name.clone(),
        }
    }
}

/// Live controller sessions keyed by relay-assigned controller id.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, ControllerSession>>>,
    sequence: Arc<AtomicU64>,
    events: broadcast::Sender<SessionEvent>,
    scan_timeout_ms: u64,
}

impl SessionRegistry {
    pub fn new(scan_timeout_ms: u64) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
            events,
            scan_timeout_ms,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Creates a session for an announced controller and asks it to scan.
    pub async fn register(
        &self,
        name: &str,
        channel: ControllerChannel,
    ) -> Result<ControllerInfo, RelayError> {
        let controller_id = Uuid::new_v4().to_string();
        let session = ControllerSession {
            name: name.to_string(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            channel: channel.clone(),
            devices: Vec::new(),
        };
        let info = session.info(&controller_id);
        self.sessions
            .write()
            .await
            .insert(controller_id.clone(), session);
        info!(controller_id = %controller_id, name = %name, "controller connected");
        let _ = self.events.send(SessionEvent::ControllerConnected(info.clone()));

        let scan = RelayMessage::ScanRequest(ScanRequest {
            scan_timeout: self.scan_timeout_ms,
        });
        if let Err(err) = channel.send(scan).await {
            self.remove(&controller_id).await;
            return Err(err);
        }
        Ok(info)
    }

    /// Merges one device report into the session, keyed by device id.
    pub async fn record_device(
        &self,
        controller_id: &str,
        device: DeviceSummary,
    ) -> Result<(), RelayError> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(controller_id)
                .ok_or_else(|| RelayError::UnknownController(controller_id.to_string()))?;
            match session
                .devices
                .iter_mut()
                .find(|known| known.device_id == device.device_id)
            {
                Some(known) => *known = device.clone(),
                None => session.devices.push(device.clone()),
            }
        }
        let _ = self.events.send(SessionEvent::DeviceUpdated {
            controller_id: controller_id.to_string(),
            device,
        });
        Ok(())
    }

    pub async fn remove(&self, controller_id: &str) -> Option<ControllerInfo> {
        let session = self.sessions.write().await.remove(controller_id)?;
        let info = session.info(controller_id);
        info!(controller_id = %controller_id, name = %info.name, "controller disconnected");
        let _ = self
            .events
            .send(SessionEvent::ControllerDisconnected(info.clone()));
        Some(info)
    }

    /// Snapshot of every live session in connection order.
    pub async fn connected_controllers(&self) -> Vec<ControllerInfo> {
        let sessions = self.sessions.read().await;
        let mut live = sessions
            .iter()
            .map(|(controller_id, session)| (session.sequence, session.info(controller_id)))
            .collect::<Vec<_>>();
        live.sort_by_key(|(sequence, _)| *sequence);
        live.into_iter().map(|(_, info)| info).collect()
    }

    pub async fn available_devices(
        &self,
        controller_id: &str,
    ) -> Result<Vec<DeviceSummary>, RelayError> {
        self.sessions
            .read()
            .await
            .get(controller_id)
            .map(|session| session.devices.clone())
            .ok_or_else(|| RelayError::UnknownController(controller_id.to_string()))
    }

    pub async fn channel(&self, controller_id: &str) -> Result<ControllerChannel, RelayError> {
        self.sessions
            .read()
            .await
            .get(controller_id)
            .map(|session| session.channel.clone())
            .ok_or_else(|| RelayError::UnknownController(controller_id.to_string()))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
