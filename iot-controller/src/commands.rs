use std::{sync::Arc, time::Duration};

use protocol::{
    BlinkArgs, CommandAction, DeviceSummary, PathArgs, PathShape, RollArgs, STATUS_DEVICE_CONNECTED,
    STATUS_DONE,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    driver::RollMode, error::DeviceError, logging::category_command, registry::DeviceRegistry,
};

/// Pause between the heading roll and re-zeroing the heading.
pub const HEADING_SETTLE_DELAY: Duration = Duration::from_millis(300);
pub const DEFAULT_PATH_STEP: Duration = Duration::from_millis(250);
/// Side length the HTTP surface uses for square paths.
pub const SQUARE_SIDE_LENGTH: f64 = 3.0;

/// Maps elapsed seconds since a path started to a heading in degrees.
pub type PathFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Heading cycling 0, 90, 180, 270 with one side per `length / (speed * 0.01)`
/// seconds.
pub fn square_path(length: f64, speed: f64) -> PathFn {
    let rate = speed * 0.01;
    Arc::new(move |elapsed: f64| {
        if length <= 0.0 {
            return 0.0;
        }
        let side = (rate * elapsed / length).floor() as i64;
        (side.rem_euclid(4) * 90) as f64
    })
}

/// Clamps a requested speed into the driver's range.
fn driver_speed(speed: f64) -> u8 {
    speed.clamp(0.0, f64::from(u8::MAX)).round() as u8
}

/// Normalizes any heading in degrees to `0..360`.
fn driver_heading(heading: f64) -> u16 {
    (heading.rem_euclid(360.0).round() as u16) % 360
}

/// Outcome of one executed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executed {
    pub status: &'static str,
    /// Updated record for commands that change connection state.
    pub device: Option<DeviceSummary>,
}

impl Executed {
    fn done() -> Self {
        Self {
            status: STATUS_DONE,
            device: None,
        }
    }
}

/// Request/response surface over connected devices.
#[derive(Clone)]
pub struct CommandDriver {
    registry: DeviceRegistry,
    path_step: Duration,
}

impl CommandDriver {
    pub fn new(registry: DeviceRegistry, path_step: Duration) -> Self {
        Self {
            registry,
            path_step,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub async fn execute(
        &self,
        device_id: &str,
        action: &CommandAction,
    ) -> Result<Executed, DeviceError> {
        debug!("{} {device_id} {}", category_command(), action.cmd_id());
        match action {
            CommandAction::Connect => {
                let device = self.registry.connect(device_id).await?;
                Ok(Executed {
                    status: STATUS_DEVICE_CONNECTED,
                    device: Some(device),
                })
            }
            CommandAction::Roll(RollArgs { speed, heading }) => {
                self.roll(device_id, *speed, *heading).await?;
                Ok(Executed::done())
            }
            CommandAction::Heading(args) => {
                self.set_heading(device_id, args.heading).await?;
                Ok(Executed::done())
            }
            CommandAction::Blink(BlinkArgs {
                enabled,
                period,
                color,
            }) => {
                self.blink(device_id, *enabled, *period, *color).await?;
                Ok(Executed::done())
            }
            CommandAction::Color(args) => {
                self.color(device_id, args.color).await?;
                Ok(Executed::done())
            }
            CommandAction::Path(PathArgs {
                speed,
                shape,
                length,
            }) => {
                match shape {
                    PathShape::Square => {
                        self.start_path(device_id, square_path(*length, *speed), *speed)
                            .await?;
                    }
                    PathShape::Stop => self.stop_path(device_id).await?,
                }
                Ok(Executed::done())
            }
        }
    }

    pub async fn roll(&self, device_id: &str, speed: f64, heading: f64) -> Result<(), DeviceError> {
        let driver = self.registry.driver(device_id).await?;
        self.registry
            .confirm(
                "roll",
                driver.roll(driver_speed(speed), driver_heading(heading), RollMode::Normal),
            )
            .await
    }

    /// Turns toward `heading` and makes it the device's new zero heading.
    pub async fn set_heading(&self, device_id: &str, heading: f64) -> Result<(), DeviceError> {
        let driver = self.registry.driver(device_id).await?;
        self.registry
            .confirm(
                "heading roll",
                driver.roll(0, driver_heading(heading), RollMode::Fast),
            )
            .await?;
        tokio::time::sleep(HEADING_SETTLE_DELAY).await;
        self.registry
            .confirm("set heading", driver.set_heading(0))
            .await?;
        self.registry
            .confirm("heading stop", driver.roll(0, 0, RollMode::Normal))
            .await
    }

    pub async fn color(&self, device_id: &str, rgb: u32) -> Result<(), DeviceError> {
        self.registry.apply_color(device_id, rgb).await
    }

    /// Reconfigures the device's blinker. Returns as soon as the parameters
    /// are applied; the LED is driven in the background.
    pub async fn blink(
        &self,
        device_id: &str,
        enabled: bool,
        period_ms: u64,
        rgb: u32,
    ) -> Result<(), DeviceError> {
        let blinker = self.registry.blinker(device_id).await?;
        let mut blinker = blinker.lock().await;
        blinker.set_period(period_ms);
        blinker.set_color(rgb);
        blinker.enable(enabled);
        Ok(())
    }

    /// Starts following `path` at `speed`, superseding any running path.
    /// Returns the new path id.
    pub async fn start_path(
        &self,
        device_id: &str,
        path: PathFn,
        speed: f64,
    ) -> Result<u64, DeviceError> {
        let (path_id, driver) = self.registry.begin_path(device_id).await?;
        info!("{} {device_id} path {path_id} started", category_command());

        let registry = self.registry.clone();
        let device_id = device_id.to_string();
        let step = self.path_step;
        let speed = driver_speed(speed);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(step);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if registry.active_path(&device_id).await != Some(path_id) {
                    if let Err(err) = registry
                        .confirm("path stop", driver.roll(0, 0, RollMode::Normal))
                        .await
                    {
                        warn!("{} {device_id} path {path_id} stop: {err}", category_command());
                    }
                    debug!("{} {device_id} path {path_id} ended", category_command());
                    return;
                }

                // Rolls are not awaited so a slow driver never delays the next tick.
                let heading = driver_heading(path(started.elapsed().as_secs_f64()));
                let registry = registry.clone();
                let driver = driver.clone();
                let device_id = device_id.clone();
                tokio::spawn(async move {
                    if let Err(err) = registry
                        .confirm("path roll", driver.roll(speed, heading, RollMode::Normal))
                        .await
                    {
                        warn!("{} {device_id} path {path_id} roll: {err}", category_command());
                    }
                });
            }
        });
        Ok(path_id)
    }

    pub async fn stop_path(&self, device_id: &str) -> Result<(), DeviceError> {
        self.registry.clear_path(device_id).await
    }
}
