pub mod config;
pub mod control;
pub mod error;
pub mod proxy;
pub mod resources;
pub mod signals;
pub mod state;

pub use config::Config;
pub use control::{ControlEvent, ControlOutcome, Controller, StatsReport};
pub use error::StartupError;
pub use proxy::{BufferPool, Direction, Forwarder, ForwarderConfig, Listener};
pub use state::{RelayState, RelayStats, StatsSnapshot};
