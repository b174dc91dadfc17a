mod channel;
mod error;
mod relay;
mod router;
mod server;
mod sessions;

pub use channel::ControllerChannel;
pub use error::RelayError;
pub use relay::{Relay, RelayConfig};
pub use router::{CommandRouter, RouterMetrics};
pub use server::build_relay_app;
pub use sessions::{ControllerInfo, SessionEvent, SessionRegistry};
