mod blinker;
mod commands;
mod driver;
mod error;
mod logging;
mod registry;
mod relay_link;
pub mod simulated;

pub use blinker::{Blinker, BlinkerState, FLASH_DURATION, Led};
pub use commands::{
    CommandDriver, DEFAULT_PATH_STEP, Executed, HEADING_SETTLE_DELAY, PathFn, SQUARE_SIDE_LENGTH,
    square_path,
};
pub use driver::{
    AdapterState, CollisionEvent, DeviceDriver, Discovery, DriverError, Radio, RollMode,
};
pub use error::DeviceError;
pub use logging::init as init_logging;
pub use registry::{
    COLLISION_COLOR, COLLISION_RECOVERY, CONNECT_FLASH_COLOR, CONNECT_FLASH_DURATION,
    DeviceEvent, DeviceRegistry, DisconnectOutcome, RegistryConfig,
};
pub use relay_link::{RelayLinkConfig, run_relay_link, spawn_relay_link};
