//! Siren is a supervisory alarm-state engine for small industrial and
//! marine installations. A central [`AlarmManager`] owns the alarm
//! collection and enforces the state machine; [`raiser`]s push sensor and
//! peer-service events into it; an [`OutputCoordinator`] derives the
//! physical buzzer, pilot-light and master-interlock lines from the
//! aggregate state; and the [`AlarmService`] ties them together with a
//! change log, broadcast alerts and an operator command surface.
//!
//! # Example
//!
//! ```no_run
//! use siren::{AlarmManager, AlarmState, NO_CODE};
//! use std::sync::Arc;
//!
//! # fn main() -> siren::Result<()> {
//! let manager: Arc<AlarmManager> = Arc::new(AlarmManager::new());
//! manager.register_alarm("local", "smoke1", "Smoke detector 1", true)?;
//! manager.raise("smoke1", AlarmState::Critical, Some("smoke!".into()), NO_CODE)?;
//! assert!(manager.is_raised());
//! # Ok(())
//! # }
//! ```

pub mod alarm;
pub mod config;
pub mod error;
pub mod manager;
pub mod messaging;
pub mod outputs;
pub mod persistence;
pub mod raiser;
pub mod service;
pub mod state;

pub use alarm::Alarm;
pub use config::{AlarmDefinition, Config};
pub use error::{Result, SirenError};
pub use manager::{AlarmChange, AlarmManager};
pub use messaging::{
    AlarmAlert, AlarmBroadcaster, Command, CommandResponse, LogBroadcaster, StatusReport,
};
pub use outputs::{OutputCoordinator, OutputDriver, OutputState};
pub use persistence::{AlarmStore, JsonlStore, LogEntry, MemoryStore};
pub use raiser::{AlarmRaiser, LocalAlarm, RemoteAlarm, SensorPort};
pub use service::{AlarmService, OutputLine};
pub use state::{
    AlarmState, BinaryState, Severity, CODE_SOURCE_OFFLINE, CODE_SOURCE_ONLINE, NO_CODE,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
