use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};

/// Power state of the local radio adaptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// One raw advertisement seen during a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discovery {
    pub device_id: String,
    pub address: String,
    pub local_name: Option<String>,
}

/// Motor state passed along with a roll, mirroring the device firmware values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollMode {
    Normal = 1,
    Fast = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollisionEvent {
    pub x_magnitude: i16,
    pub y_magnitude: i16,
    pub speed: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverError {
    message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DriverError {}

/// Short-range radio used to find and open devices.
#[async_trait]
pub trait Radio: Send + Sync {
    fn state(&self) -> watch::Receiver<AdapterState>;

    /// Starts a discovery pass. Advertisements arrive on the returned receiver
    /// until `stop_scan` is called.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Discovery>, DriverError>;

    async fn stop_scan(&self);

    /// Performs the connection handshake with one device.
    async fn open(&self, device_id: &str) -> Result<Arc<dyn DeviceDriver>, DriverError>;
}

/// An open connection to one device. Every call resolves once the device
/// acknowledges it.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    async fn roll(&self, speed: u8, heading: u16, mode: RollMode) -> Result<(), DriverError>;

    /// Redefines the device's zero heading relative to its current orientation.
    async fn set_heading(&self, heading: u16) -> Result<(), DriverError>;

    async fn color(&self, rgb: u32) -> Result<(), DriverError>;

    async fn stop(&self) -> Result<(), DriverError>;

    async fn detect_collisions(&self) -> Result<(), DriverError>;

    async fn stop_on_disconnect(&self) -> Result<(), DriverError>;

    async fn disconnect(&self) -> Result<(), DriverError>;

    fn collisions(&self) -> broadcast::Receiver<CollisionEvent>;
}
