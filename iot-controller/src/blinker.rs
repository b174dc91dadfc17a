use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::error::DeviceError;

/// How long the LED stays lit on each blink.
pub const FLASH_DURATION: Duration = Duration::from_millis(50);

/// Sink for LED colors, usually one device's driver.
#[async_trait]
pub trait Led: Send + Sync {
    async fn set_color(&self, rgb: u32) -> Result<(), DeviceError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlinkerState {
    Off,
    SolidOn,
    Blinking,
}

/// Periodic LED toggling for one device.
///
/// Every input re-evaluates the state: disabled drives color 0, a non-zero
/// period starts a repeating flash, otherwise the color is driven solid.
/// Inputs never wait on the LED. Each state runs as one background task, and
/// the previous task is cancelled before the new state is applied.
pub struct Blinker {
    led: Arc<dyn Led>,
    enabled: bool,
    period: Duration,
    color: u32,
    output: Option<JoinHandle<()>>,
}

impl Blinker {
    pub fn new(led: Arc<dyn Led>) -> Self {
        Self {
            led,
            enabled: false,
            period: Duration::ZERO,
            color: 0,
            output: None,
        }
    }

    pub fn state(&self) -> BlinkerState {
        if !self.enabled {
            BlinkerState::Off
        } else if !self.period.is_zero() {
            BlinkerState::Blinking
        } else {
            BlinkerState::SolidOn
        }
    }

    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.apply();
    }

    pub fn set_period(&mut self, period_ms: u64) {
        self.period = Duration::from_millis(period_ms);
        self.apply();
    }

    pub fn set_color(&mut self, rgb: u32) {
        self.color = rgb;
        self.apply();
    }

    fn apply(&mut self) {
        self.cancel_output();
        let led = self.led.clone();
        self.output = Some(match self.state() {
            BlinkerState::Off => spawn_solid(led, 0),
            BlinkerState::SolidOn => spawn_solid(led, self.color),
            BlinkerState::Blinking => spawn_flash_timer(led, self.period, self.color),
        });
    }

    fn cancel_output(&mut self) {
        if let Some(output) = self.output.take() {
            output.abort();
        }
    }
}

impl Drop for Blinker {
    fn drop(&mut self) {
        self.cancel_output();
    }
}

fn spawn_solid(led: Arc<dyn Led>, rgb: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        drive(led.as_ref(), rgb).await;
    })
}

fn spawn_flash_timer(led: Arc<dyn Led>, period: Duration, color: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            drive(led.as_ref(), color).await;
            tokio::time::sleep(FLASH_DURATION).await;
            drive(led.as_ref(), 0).await;
        }
    })
}

async fn drive(led: &dyn Led, rgb: u32) {
    if let Err(err) = led.set_color(rgb).await {
        debug!("blinker could not drive color {rgb:#08x}: {err}");
    }
}
