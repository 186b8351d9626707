// src/messaging.rs - Event schemas and collaborator contracts for the
// messaging layer. Wire framing is out of scope; these are the typed
// payloads a transport serializes.

use crate::error::Result;
use crate::manager::AlarmChange;
use crate::outputs::OutputState;
use crate::state::{AlarmState, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Alert broadcast to subscribers on every alarm state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmAlert<S = AlarmState> {
    /// Alarm the alert is about
    pub alarm_id: String,
    /// New state
    pub state: S,
    /// Explanation of the new state
    pub message: Option<String>,
    /// Code annotation
    pub code: i32,
    /// Whether the change belongs to a test sequence
    pub testing: bool,
    /// Snapshot of the derived outputs at the time of the alert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<OutputState>,
}

impl<S: Severity> AlarmAlert<S> {
    /// Build an alert from a manager change event plus an output snapshot.
    pub fn from_change(change: &AlarmChange<S>, outputs: OutputState) -> Self {
        Self {
            alarm_id: change.id.clone(),
            state: change.state,
            message: change.message.clone(),
            code: change.code,
            testing: change.testing,
            outputs: Some(outputs),
        }
    }
}

/// Periodic full-status broadcast: every alarm's state, message and code
/// plus the derived outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport<S = AlarmState> {
    /// State per alarm id
    pub states: HashMap<String, S>,
    /// Message per alarm id
    pub messages: HashMap<String, Option<String>>,
    /// Code per alarm id
    pub codes: HashMap<String, i32>,
    /// Derived outputs
    pub outputs: OutputState,
    /// Whether a test is running
    pub testing: bool,
}

/// Outbound messaging contract. Failures are logged at the boundary and
/// never roll back the in-memory state mutation.
#[async_trait]
pub trait AlarmBroadcaster<S: Severity>: Send + Sync {
    /// Broadcast one state-change alert to all listeners.
    async fn broadcast_alert(&self, alert: &AlarmAlert<S>) -> Result<()>;

    /// Broadcast a full status report.
    async fn broadcast_status(&self, status: &StatusReport<S>) -> Result<()>;

    /// Ask a remote alarm source to re-announce its status.
    async fn request_status(&self, source: &str) -> Result<()>;
}

/// Broadcaster that writes alerts and status reports to the log instead of
/// a transport. Used standalone and as a stand-in while wiring a real bus.
pub struct LogBroadcaster;

#[async_trait]
impl<S: Severity> AlarmBroadcaster<S> for LogBroadcaster {
    async fn broadcast_alert(&self, alert: &AlarmAlert<S>) -> Result<()> {
        tracing::info!(
            alarm = %alert.alarm_id,
            state = %alert.state,
            code = alert.code,
            testing = alert.testing,
            "alert"
        );
        Ok(())
    }

    async fn broadcast_status(&self, status: &StatusReport<S>) -> Result<()> {
        tracing::info!(
            alarms = status.states.len(),
            testing = status.testing,
            outputs = ?status.outputs,
            "status"
        );
        Ok(())
    }

    async fn request_status(&self, source: &str) -> Result<()> {
        tracing::info!(source, "status requested");
        Ok(())
    }
}

/// Operator command surface, abstracted as typed request/response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command<S = AlarmState> {
    /// List the configured alarm definitions
    ListAlarms,
    /// Report current states and outputs, or one alarm's detail
    AlarmStatus {
        /// Restrict the report to one alarm
        #[serde(default)]
        id: Option<String>,
    },
    /// Silence the buzzer for a number of seconds
    Silence {
        /// Duration; the service default applies when omitted
        #[serde(default)]
        secs: Option<u64>,
    },
    /// Clear an active silence window
    Unsilence,
    /// Disable one alarm
    DisableAlarm {
        /// Alarm to disable
        id: String,
    },
    /// Re-enable a disabled alarm
    EnableAlarm {
        /// Alarm to enable
        id: String,
    },
    /// Run a timed test on one alarm
    TestAlarm {
        /// Alarm to test
        id: String,
        /// Severity to test at; random raised severity when omitted
        #[serde(default)]
        state: Option<S>,
        /// Test duration; the service default applies when omitted
        #[serde(default)]
        secs: Option<u64>,
    },
    /// Sound the buzzer for a number of seconds
    TestBuzzer {
        /// Test duration; the service default applies when omitted
        #[serde(default)]
        secs: Option<u64>,
    },
    /// Light the pilot for a number of seconds
    TestPilot {
        /// Test duration; the service default applies when omitted
        #[serde(default)]
        secs: Option<u64>,
    },
    /// End the currently running test
    EndTest,
    /// Operator master-interlock control
    Master {
        /// Requested line state
        on: bool,
    },
}

/// Response rendered back to the operator layer.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    /// Human-readable outcome
    pub message: String,
    /// Structured payload, command-dependent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    /// Response with a message only.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Response carrying a structured payload.
    pub fn with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}
