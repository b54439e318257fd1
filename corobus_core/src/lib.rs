pub mod config;
pub mod error;
pub mod runtime;
pub mod telemetry;
pub use config::BusConfig;
pub use error::{last_error, set_last_error, BusError, BusResult, ErrorCode};
pub use runtime::{Bus, ChannelHandle};
pub use telemetry::BusStats;
