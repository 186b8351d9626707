// src/outputs.rs - Physical output derivation: buzzer, pilot light, master
// interlock. Pure function of the manager's alarm set plus the silence
// window; recomputed by the service on every change event.

use crate::error::{Result, SirenError};
use crate::manager::AlarmManager;
use crate::state::Severity;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Snapshot of the three derived outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    /// Sounds while any alarm sits at the highest severity and the buzzer is
    /// not silenced
    pub buzzer: bool,
    /// Lit while any alarm is raised
    pub pilot: bool,
    /// Engaged while any alarm is raised; also operator-settable when idle
    pub master: bool,
    /// Whether a silence window is currently active
    pub silenced: bool,
}

/// Sink for the physical side of the outputs (GPIO relay board, simulator).
pub trait OutputDriver: Send + Sync {
    /// Drive the buzzer line.
    fn set_buzzer(&self, on: bool);
    /// Drive the pilot-light line.
    fn set_pilot(&self, on: bool);
    /// Drive the master interlock relay.
    fn set_master(&self, on: bool);
}

/// Derives [`OutputState`] from the aggregate alarm set.
pub struct OutputCoordinator {
    state: OutputState,
    silenced_until: Option<DateTime<Utc>>,
    master_override: bool,
    any_raised: bool,
    driver: Option<Arc<dyn OutputDriver>>,
}

impl OutputCoordinator {
    /// Coordinator with no physical driver attached.
    pub fn new() -> Self {
        Self {
            state: OutputState::default(),
            silenced_until: None,
            master_override: false,
            any_raised: false,
            driver: None,
        }
    }

    /// Attach the physical driver. Output changes are pushed through it on
    /// every recompute.
    pub fn with_driver(mut self, driver: Arc<dyn OutputDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Latest derived output snapshot.
    pub fn state(&self) -> OutputState {
        self.state
    }

    /// Whether a silence window is active right now.
    pub fn is_silenced(&self) -> bool {
        matches!(self.silenced_until, Some(until) if until > Utc::now())
    }

    /// Recompute the outputs from the manager's current alarm set and push
    /// them to the driver. Clears an active silence once nothing is raised.
    pub fn recompute<S: Severity>(&mut self, manager: &AlarmManager<S>) -> OutputState {
        let alarms = manager.alarms();
        self.any_raised = alarms.iter().any(|a| a.is_raised());
        let any_max = alarms.iter().any(|a| a.is_raised() && a.state().is_max());

        if self.any_raised {
            self.state.pilot = true;
            self.state.master = true;
            self.state.buzzer = any_max && !self.is_silenced();
        } else {
            self.silenced_until = None;
            self.state.pilot = false;
            self.state.buzzer = false;
            self.state.master = self.master_override;
        }
        self.state.silenced = self.is_silenced();
        self.push();
        debug!(state = ?self.state, "outputs recomputed");
        self.state
    }

    /// Open a time-boxed silence window for the buzzer only. Zero durations
    /// and overlapping requests are rejected without effect.
    pub fn silence(&mut self, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(SirenError::InvalidArgument(
                "silence duration must be positive".into(),
            ));
        }
        if self.is_silenced() {
            return Err(SirenError::InvalidArgument(
                "buzzer is already silenced".into(),
            ));
        }
        self.silenced_until = Some(Utc::now() + Duration::seconds(secs as i64));
        self.state.silenced = true;
        if self.state.buzzer {
            self.state.buzzer = false;
            self.push();
        }
        Ok(())
    }

    /// Close an active silence window early.
    pub fn unsilence(&mut self) {
        self.silenced_until = None;
        self.state.silenced = false;
    }

    /// Operator master control. The interlock owns the line while any alarm
    /// is raised, so the command is only accepted when idle. Checked against
    /// the live alarm set, not the last recompute.
    pub fn set_master<S: Severity>(&mut self, on: bool, manager: &AlarmManager<S>) -> Result<()> {
        if manager.is_raised() {
            return Err(SirenError::invalid_transition(
                "master",
                "interlock engaged while an alarm is raised",
            ));
        }
        self.master_override = on;
        self.state.master = on;
        if let Some(driver) = &self.driver {
            driver.set_master(on);
        }
        Ok(())
    }

    /// Drive the buzzer line directly for an output test.
    pub fn force_buzzer(&mut self, on: bool) {
        self.state.buzzer = on;
        if let Some(driver) = &self.driver {
            driver.set_buzzer(on);
        }
    }

    /// Drive the pilot line directly for an output test.
    pub fn force_pilot(&mut self, on: bool) {
        self.state.pilot = on;
        if let Some(driver) = &self.driver {
            driver.set_pilot(on);
        }
    }

    fn push(&self) {
        if let Some(driver) = &self.driver {
            driver.set_buzzer(self.state.buzzer);
            driver.set_pilot(self.state.pilot);
            driver.set_master(self.state.master);
        }
    }
}

impl Default for OutputCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
