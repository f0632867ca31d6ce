pub mod config;
pub mod directory;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod schedule;
pub mod types;

pub use config::{MonitorConfig, NetworkConfig, RuntimeConfig, ServerConfig, WorkerConfig};
pub use directory::{ConfigDocument, DayEntry, Device, DeviceDirectory, DeviceEntry};
pub use error::ConfigError;
pub use messages::{Inbound, Outbound, Remote, RemoteAction, RemoteCommand};
pub use protocol::*;
pub use schedule::{minute_of_day, DeviceSchedule, ScheduleCursor, TimeRule};
pub use types::{DayType, Direction, MacAddr};
