use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        Arc, Mutex as StdMutex, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use protocol::DeviceSummary;
use tokio::{
    sync::{Mutex, RwLock, broadcast},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    blinker::{Blinker, Led},
    driver::{AdapterState, DeviceDriver, Discovery, DriverError, Radio},
    error::DeviceError,
    logging::category_device,
};

pub const CONNECT_FLASH_COLOR: u32 = 0x0000FF;
pub const CONNECT_FLASH_DURATION: Duration = Duration::from_secs(3);
pub const COLLISION_COLOR: u32 = 0xFF0000;
pub const COLLISION_RECOVERY: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Upper bound on how long a driver call may stay unconfirmed.
    pub driver_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            driver_timeout: Duration::from_secs(10),
        }
    }
}

/// Device status changes worth reporting upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Detected(DeviceSummary),
    Disconnected(DeviceSummary),
}

impl DeviceEvent {
    pub fn summary(&self) -> &DeviceSummary {
        match self {
            DeviceEvent::Detected(summary) | DeviceEvent::Disconnected(summary) => summary,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Disconnected,
    NotConnected,
}

struct DeviceLink {
    driver: Arc<dyn DeviceDriver>,
    collision_watch: JoinHandle<()>,
}

struct DeviceRecord {
    device_id: String,
    address: String,
    name: String,
    // Present exactly while the device is connected.
    link: Option<DeviceLink>,
    path_id: Option<u64>,
    last_color: u32,
    blinker: Arc<Mutex<Blinker>>,
}

impl DeviceRecord {
    fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            connected: self.link.is_some(),
            device_id: self.device_id.clone(),
            address: self.address.clone(),
            name: self.name.clone(),
        }
    }

    fn driver(&self) -> Option<Arc<dyn DeviceDriver>> {
        self.link.as_ref().map(|link| link.driver.clone())
    }
}

struct RegistryInner {
    radio: Arc<dyn Radio>,
    config: RegistryConfig,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    events: broadcast::Sender<DeviceEvent>,
    connect_lock: Mutex<()>,
    scan_task: StdMutex<Option<JoinHandle<()>>>,
    path_generation: AtomicU64,
}

/// Devices seen by this controller, keyed by radio id.
///
/// Records are created on first discovery and kept for the life of the
/// process. Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(radio: Arc<dyn Radio>, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                radio,
                config,
                devices: RwLock::new(HashMap::new()),
                events,
                connect_lock: Mutex::new(()),
                scan_task: StdMutex::new(None),
                path_generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    /// Starts a discovery pass bounded by `timeout`, replacing any pass still
    /// running. Connected devices are re-announced before this returns.
    pub async fn scan(&self, timeout: Duration, filters: Vec<String>) {
        for summary in self.connected_summaries().await {
            self.emit(DeviceEvent::Detected(summary));
        }

        let registry = self.clone();
        let task = tokio::spawn(async move { registry.run_scan(timeout, filters).await });
        let previous = self
            .inner
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceSummary> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .map(DeviceRecord::summary)
    }

    pub async fn devices(&self) -> Vec<DeviceSummary> {
        let devices = self.inner.devices.read().await;
        let mut summaries = devices.values().map(DeviceRecord::summary).collect::<Vec<_>>();
        summaries.sort_by(|left, right| left.device_id.cmp(&right.device_id));
        summaries
    }

    pub async fn connect(&self, device_id: &str) -> Result<DeviceSummary, DeviceError> {
        let _serialized = self.inner.connect_lock.lock().await;

        let existing = {
            let devices = self.inner.devices.read().await;
            let record = devices
                .get(device_id)
                .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
            record.driver().map(|driver| (driver, record.summary()))
        };
        if let Some((driver, summary)) = existing {
            debug!("{} {device_id} already connected", category_device());
            spawn_connect_flash(driver);
            return Ok(summary);
        }

        let driver = self.confirm("connect", self.inner.radio.open(device_id)).await?;
        spawn_connect_flash(driver.clone());

        let collision_watch = self.spawn_collision_watch(device_id, driver.clone());
        if let Err(err) = self.arm(driver.as_ref()).await {
            collision_watch.abort();
            let _ = driver.disconnect().await;
            return Err(err);
        }

        let mut devices = self.inner.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
        record.link = Some(DeviceLink {
            driver,
            collision_watch,
        });
        info!("{} {device_id} ({}) connected", category_device(), record.name);
        Ok(record.summary())
    }

    pub async fn disconnect(&self, device_id: &str) -> Result<DisconnectOutcome, DeviceError> {
        let (link, summary) = {
            let mut devices = self.inner.devices.write().await;
            let record = devices
                .get_mut(device_id)
                .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
            record.path_id = None;
            (record.link.take(), record.summary())
        };
        let Some(link) = link else {
            return Ok(DisconnectOutcome::NotConnected);
        };

        link.collision_watch.abort();
        let result = self.confirm("disconnect", link.driver.disconnect()).await;
        info!("{} {device_id} disconnected", category_device());
        self.emit(DeviceEvent::Disconnected(summary));
        result.map(|_| DisconnectOutcome::Disconnected)
    }

    /// Disconnects every connected device. Failures are logged and do not
    /// stop the remaining disconnects. Returns how many devices were released.
    pub async fn shutdown(&self) -> usize {
        let scan = self
            .inner
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(scan) = scan {
            scan.abort();
            self.inner.radio.stop_scan().await;
        }

        let connected = {
            let devices = self.inner.devices.read().await;
            devices
                .values()
                .filter(|record| record.link.is_some())
                .map(|record| record.device_id.clone())
                .collect::<Vec<_>>()
        };

        let mut released = 0;
        for device_id in connected {
            match self.disconnect(&device_id).await {
                Ok(DisconnectOutcome::Disconnected) => released += 1,
                Ok(DisconnectOutcome::NotConnected) => {}
                Err(err) => warn!("{} failed to disconnect {device_id}: {err}", category_device()),
            }
        }
        info!("{} shutdown released {released} device(s)", category_device());
        released
    }

    /// Returns the driver of a connected device.
    pub async fn driver(&self, device_id: &str) -> Result<Arc<dyn DeviceDriver>, DeviceError> {
        let devices = self.inner.devices.read().await;
        let record = devices
            .get(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
        record
            .driver()
            .ok_or_else(|| DeviceError::DeviceNotConnected(device_id.to_string()))
    }

    pub async fn blinker(&self, device_id: &str) -> Result<Arc<Mutex<Blinker>>, DeviceError> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .map(|record| record.blinker.clone())
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))
    }

    /// Drives a color and remembers it as the color to restore after a collision.
    pub async fn apply_color(&self, device_id: &str, rgb: u32) -> Result<(), DeviceError> {
        let driver = self.driver(device_id).await?;
        self.confirm("color", driver.color(rgb)).await?;
        if let Some(record) = self.inner.devices.write().await.get_mut(device_id) {
            record.last_color = rgb;
        }
        Ok(())
    }

    /// Claims a fresh path generation for a connected device, superseding any
    /// path already running on it.
    pub async fn begin_path(
        &self,
        device_id: &str,
    ) -> Result<(u64, Arc<dyn DeviceDriver>), DeviceError> {
        let mut devices = self.inner.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
        let driver = record
            .driver()
            .ok_or_else(|| DeviceError::DeviceNotConnected(device_id.to_string()))?;
        let path_id = self.inner.path_generation.fetch_add(1, Ordering::Relaxed) + 1;
        record.path_id = Some(path_id);
        Ok((path_id, driver))
    }

    pub async fn clear_path(&self, device_id: &str) -> Result<(), DeviceError> {
        let mut devices = self.inner.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| DeviceError::UnknownDevice(device_id.to_string()))?;
        record.path_id = None;
        Ok(())
    }

    pub async fn active_path(&self, device_id: &str) -> Option<u64> {
        self.inner
            .devices
            .read()
            .await
            .get(device_id)
            .and_then(|record| record.path_id)
    }

    pub fn driver_timeout(&self) -> Duration {
        self.inner.config.driver_timeout
    }

    /// Awaits one driver call, bounded by the driver timeout.
    pub async fn confirm<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T, DriverError>>,
    ) -> Result<T, DeviceError> {
        match tokio::time::timeout(self.inner.config.driver_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DeviceError::DriverFailure(format!("{operation}: {err}"))),
            Err(_) => Err(DeviceError::DriverFailure(format!(
                "{operation} was never confirmed"
            ))),
        }
    }

    async fn arm(&self, driver: &dyn DeviceDriver) -> Result<(), DeviceError> {
        self.confirm("detect collisions", driver.detect_collisions())
            .await?;
        self.confirm("stop on disconnect", driver.stop_on_disconnect())
            .await
    }

    async fn connected_summaries(&self) -> Vec<DeviceSummary> {
        self.inner
            .devices
            .read()
            .await
            .values()
            .filter(|record| record.link.is_some())
            .map(DeviceRecord::summary)
            .collect()
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn run_scan(&self, timeout: Duration, filters: Vec<String>) {
        let mut state = self.inner.radio.state();
        let powered = *state.borrow_and_update();
        if powered != AdapterState::PoweredOn {
            info!("{} radio adaptor is {powered:?}, waiting for power on", category_device());
            loop {
                if state.changed().await.is_err() {
                    warn!("{} radio adaptor went away, scan canceled", category_device());
                    return;
                }
                let next = *state.borrow_and_update();
                match next {
                    AdapterState::PoweredOn => break,
                    AdapterState::PoweredOff => {
                        warn!("{} radio adaptor powered off, scan canceled", category_device());
                        return;
                    }
                    AdapterState::Unknown => {}
                }
            }
        }

        let mut discoveries = match self.inner.radio.start_scan().await {
            Ok(discoveries) => discoveries,
            Err(err) => {
                warn!("{} failed to start scanning: {err}", category_device());
                return;
            }
        };
        info!(
            "{} scanning for {}ms with filters {filters:?}",
            category_device(),
            timeout.as_millis()
        );

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut reported = HashSet::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                discovery = discoveries.recv() => {
                    let Some(discovery) = discovery else { break };
                    self.on_discovery(discovery, &filters, &mut reported).await;
                }
            }
        }

        self.inner.radio.stop_scan().await;
        info!("{} scan finished", category_device());
    }

    async fn on_discovery(
        &self,
        discovery: Discovery,
        filters: &[String],
        reported: &mut HashSet<String>,
    ) {
        let Some(name) = discovery.local_name.as_deref() else {
            return;
        };
        if !matches_filters(name, filters) || !reported.insert(discovery.device_id.clone()) {
            return;
        }

        let summary = {
            let mut devices = self.inner.devices.write().await;
            match devices.get_mut(&discovery.device_id) {
                // Already announced when the scan started.
                Some(record) if record.link.is_some() => return,
                Some(record) => {
                    record.address = discovery.address.clone();
                    record.name = name.to_string();
                    record.summary()
                }
                None => {
                    let led = Arc::new(DeviceLed {
                        registry: Arc::downgrade(&self.inner),
                        device_id: discovery.device_id.clone(),
                    });
                    let record = DeviceRecord {
                        device_id: discovery.device_id.clone(),
                        address: discovery.address.clone(),
                        name: name.to_string(),
                        link: None,
                        path_id: None,
                        last_color: 0,
                        blinker: Arc::new(Mutex::new(Blinker::new(led))),
                    };
                    let summary = record.summary();
                    devices.insert(discovery.device_id.clone(), record);
                    info!(
                        "{} detected {} ({}) at {}",
                        category_device(),
                        summary.name,
                        summary.device_id,
                        summary.address
                    );
                    summary
                }
            }
        };
        self.emit(DeviceEvent::Detected(summary));
    }

    fn spawn_collision_watch(
        &self,
        device_id: &str,
        driver: Arc<dyn DeviceDriver>,
    ) -> JoinHandle<()> {
        let mut collisions = driver.collisions();
        let registry = Arc::downgrade(&self.inner);
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            loop {
                let event = match collisions.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                info!(
                    "{} {device_id} collision x={} y={} speed={}",
                    category_device(),
                    event.x_magnitude,
                    event.y_magnitude,
                    event.speed
                );
                if let Err(err) = driver.color(COLLISION_COLOR).await {
                    debug!("{} collision flash failed on {device_id}: {err}", category_device());
                }
                if let Err(err) = driver.stop().await {
                    warn!("{} collision stop failed on {device_id}: {err}", category_device());
                }
                tokio::time::sleep(COLLISION_RECOVERY).await;

                let Some(inner) = registry.upgrade() else {
                    return;
                };
                let restore = inner
                    .devices
                    .read()
                    .await
                    .get(&device_id)
                    .map(|record| record.last_color)
                    .unwrap_or(0);
                if let Err(err) = driver.color(restore).await {
                    debug!("{} color restore failed on {device_id}: {err}", category_device());
                }
            }
        })
    }
}

fn matches_filters(name: &str, filters: &[String]) -> bool {
    filters
        .iter()
        .any(|filter| filter == "*" || name.contains(filter.as_str()))
}

fn spawn_connect_flash(driver: Arc<dyn DeviceDriver>) {
    tokio::spawn(async move {
        if let Err(err) = driver.color(CONNECT_FLASH_COLOR).await {
            debug!("connect flash failed: {err}");
            return;
        }
        tokio::time::sleep(CONNECT_FLASH_DURATION).await;
        if let Err(err) = driver.color(0).await {
            debug!("connect flash reset failed: {err}");
        }
    });
}

/// Routes blinker output to one device through its registry.
struct DeviceLed {
    registry: Weak<RegistryInner>,
    device_id: String,
}

#[async_trait]
impl Led for DeviceLed {
    async fn set_color(&self, rgb: u32) -> Result<(), DeviceError> {
        let inner = self
            .registry
            .upgrade()
            .ok_or_else(|| DeviceError::DeviceNotConnected(self.device_id.clone()))?;
        DeviceRegistry { inner }.apply_color(&self.device_id, rgb).await
    }
}
