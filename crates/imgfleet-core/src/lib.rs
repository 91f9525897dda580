pub mod config;
pub mod duration;
pub mod protocol;
pub mod types;

pub use config::FleetConfig;
pub use duration::parse_duration;
pub use protocol::{DispatchMessage, ResultNotice};
pub use types::*;
