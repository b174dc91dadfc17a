//! In-process radio used when no hardware backend is linked, and by tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};

use crate::driver::{
    AdapterState, CollisionEvent, DeviceDriver, Discovery, DriverError, Radio, RollMode,
};

const SCAN_BUFFER: usize = 64;
const COLLISION_BUFFER: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Roll {
        speed: u8,
        heading: u16,
        mode: RollMode,
    },
    SetHeading(u16),
    Color(u32),
    Stop,
    DetectCollisions,
    StopOnDisconnect,
    Disconnect,
}

pub struct SimulatedRadio {
    state: watch::Sender<AdapterState>,
    peripherals: Mutex<Vec<Discovery>>,
    scan_tx: Mutex<Option<mpsc::Sender<Discovery>>>,
    handshakes: AtomicUsize,
    refused: Mutex<HashSet<String>>,
    drivers: Mutex<HashMap<String, Arc<SimulatedDriver>>>,
    journal: Arc<Mutex<Vec<(String, DriverCall)>>>,
    stalled: Arc<AtomicBool>,
}

impl SimulatedRadio {
    pub fn new(peripherals: Vec<Discovery>) -> Self {
        let (state, _) = watch::channel(AdapterState::PoweredOn);
        Self {
            state,
            peripherals: Mutex::new(peripherals),
            scan_tx: Mutex::new(None),
            handshakes: AtomicUsize::new(0),
            refused: Mutex::new(HashSet::new()),
            drivers: Mutex::new(HashMap::new()),
            journal: Arc::new(Mutex::new(Vec::new())),
            stalled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds one peripheral per name with random radio ids and addresses.
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rng = rand::thread_rng();
        let peripherals = names
            .into_iter()
            .map(|name| {
                let bytes: [u8; 6] = rng.r#gen();
                let device_id = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
                let address = bytes
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect::<Vec<_>>()
                    .join(":");
                Discovery {
                    device_id,
                    address,
                    local_name: Some(name.into()),
                }
            })
            .collect();
        Self::new(peripherals)
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.state.send_replace(state);
    }

    /// Adds a peripheral and, when a scan is running, advertises it immediately.
    pub fn advertise(&self, discovery: Discovery) {
        if let Some(tx) = lock(&self.scan_tx).as_ref() {
            let _ = tx.try_send(discovery.clone());
        }
        lock(&self.peripherals).push(discovery);
    }

    pub fn peripherals(&self) -> Vec<Discovery> {
        lock(&self.peripherals).clone()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.scan_tx).is_some()
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, device_id: &str) {
        lock(&self.refused).insert(device_id.to_string());
    }

    /// Makes every driver call hang without ever resolving.
    pub fn stall_driver_calls(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn collide(&self, device_id: &str) -> bool {
        let driver = lock(&self.drivers).get(device_id).cloned();
        let Some(driver) = driver else {
            return false;
        };
        driver
            .collisions
            .send(CollisionEvent {
                x_magnitude: 120,
                y_magnitude: -40,
                speed: 80,
            })
            .is_ok()
    }

    pub fn calls_for(&self, device_id: &str) -> Vec<DriverCall> {
        lock(&self.journal)
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.journal).clear();
    }
}

#[async_trait]
impl Radio for SimulatedRadio {
    fn state(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<Discovery>, DriverError> {
        if *self.state.borrow() != AdapterState::PoweredOn {
            return Err(DriverError::new("radio adaptor is not powered on"));
        }
        let (tx, rx) = mpsc::channel(SCAN_BUFFER);
        for discovery in lock(&self.peripherals).iter() {
            let _ = tx.try_send(discovery.clone());
        }
        *lock(&self.scan_tx) = Some(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) {
        lock(&self.scan_tx).take();
    }

    async fn open(&self, device_id: &str) -> Result<Arc<dyn DeviceDriver>, DriverError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if lock(&self.refused).contains(device_id) {
            return Err(DriverError::new(format!(
                "connection refused by {device_id}"
            )));
        }
        let known = lock(&self.peripherals)
            .iter()
            .any(|peripheral| peripheral.device_id == device_id);
        if !known {
            return Err(DriverError::new(format!("peripheral {device_id} not in range")));
        }

        let (collisions, _) = broadcast::channel(COLLISION_BUFFER);
        let driver = Arc::new(SimulatedDriver {
            device_id: device_id.to_string(),
            journal: self.journal.clone(),
            stalled: self.stalled.clone(),
            collisions,
        });
        lock(&self.drivers).insert(device_id.to_string(), driver.clone());
        Ok(driver)
    }
}

pub struct SimulatedDriver {
    device_id: String,
    journal: Arc<Mutex<Vec<(String, DriverCall)>>>,
    stalled: Arc<AtomicBool>,
    collisions: broadcast::Sender<CollisionEvent>,
}

impl SimulatedDriver {
    async fn record(&self, call: DriverCall) -> Result<(), DriverError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        lock(&self.journal).push((self.device_id.clone(), call));
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    async fn roll(&self, speed: u8, heading: u16, mode: RollMode) -> Result<(), DriverError> {
        self.record(DriverCall::Roll {
            speed,
            heading,
            mode,
        })
        .await
    }

    async fn set_heading(&self, heading: u16) -> Result<(), DriverError> {
        self.record(DriverCall::SetHeading(heading)).await
    }

    async fn color(&self, rgb: u32) -> Result<(), DriverError> {
        self.record(DriverCall::Color(rgb)).await
    }

    async fn stop(&self) -> Result<(), DriverError> {
        self.record(DriverCall::Stop).await
    }

    async fn detect_collisions(&self) -> Result<(), DriverError> {
        self.record(DriverCall::DetectCollisions).await
    }

    async fn stop_on_disconnect(&self) -> Result<(), DriverError> {
        self.record(DriverCall::StopOnDisconnect).await
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.record(DriverCall::Disconnect).await
    }

    fn collisions(&self) -> broadcast::Receiver<CollisionEvent> {
        self.collisions.subscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
