// src/state.rs - Alarm severity model
//
// Alarm states are an ordered enumeration. Anything above the quiescent band
// counts as raised; DISABLED sits outside the ordering semantics entirely
// ("intentionally ignored" rather than "nothing wrong"). The manager is
// generic over the scheme so binary deployments can swap in [`BinaryState`]
// without touching the transition logic.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// No code attached to a state change.
pub const NO_CODE: i32 = 0;
/// The alarm's source (remote peer or sensor) went offline.
pub const CODE_SOURCE_OFFLINE: i32 = 1;
/// The alarm's source came back online.
pub const CODE_SOURCE_ONLINE: i32 = 2;

/// A pluggable severity ordering for alarm states.
///
/// Implementations classify every value into exactly one of three bands:
/// disabled, quiescent (lowered or disconnected) or raised. `Ord` must order
/// raised values by ascending severity.
pub trait Severity:
    Copy
    + Eq
    + Ord
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// The "nothing wrong" quiescent value. Lowering targets this.
    fn lowered() -> Self;

    /// The "no data from source" quiescent value. Schemes without a distinct
    /// disconnected value alias this to [`Severity::lowered`].
    fn disconnected() -> Self;

    /// The "intentionally ignored" value.
    fn disabled() -> Self;

    /// All raised values, ascending severity. Never empty.
    fn raised_levels() -> &'static [Self];

    /// True for the disabled value.
    fn is_disabled(&self) -> bool {
        *self == Self::disabled()
    }

    /// True for lowered or disconnected.
    fn is_quiescent(&self) -> bool {
        *self == Self::lowered() || *self == Self::disconnected()
    }

    /// True for any raised severity.
    fn is_raised(&self) -> bool {
        !self.is_quiescent() && !self.is_disabled()
    }

    /// True for the highest raised severity. Drives the buzzer.
    fn is_max(&self) -> bool {
        Self::raised_levels().last() == Some(self)
    }
}

/// Default seven-level alarm state scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    /// Intentionally ignored by an operator
    Disabled,
    /// Source offline, no reading available
    Disconnected,
    /// Nothing wrong
    Lowered,
    /// Lowest raised severity
    Minor,
    /// Raised, operator attention useful
    Moderate,
    /// Raised, operator action required
    Severe,
    /// Highest severity, sounds the buzzer
    Critical,
}

impl Severity for AlarmState {
    fn lowered() -> Self {
        AlarmState::Lowered
    }

    fn disconnected() -> Self {
        AlarmState::Disconnected
    }

    fn disabled() -> Self {
        AlarmState::Disabled
    }

    fn raised_levels() -> &'static [Self] {
        &[
            AlarmState::Minor,
            AlarmState::Moderate,
            AlarmState::Severe,
            AlarmState::Critical,
        ]
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlarmState::Disabled => "DISABLED",
            AlarmState::Disconnected => "DISCONNECTED",
            AlarmState::Lowered => "LOWERED",
            AlarmState::Minor => "MINOR",
            AlarmState::Moderate => "MODERATE",
            AlarmState::Severe => "SEVERE",
            AlarmState::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

impl Default for AlarmState {
    fn default() -> Self {
        AlarmState::Lowered
    }
}

/// Binary scheme for deployments that only distinguish off/on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BinaryState {
    /// Intentionally ignored
    Disabled,
    /// Nothing wrong
    Off,
    /// Raised; the single level is also the buzzer level
    On,
}

impl Severity for BinaryState {
    fn lowered() -> Self {
        BinaryState::Off
    }

    fn disconnected() -> Self {
        BinaryState::Off
    }

    fn disabled() -> Self {
        BinaryState::Disabled
    }

    fn raised_levels() -> &'static [Self] {
        &[BinaryState::On]
    }
}

impl fmt::Display for BinaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryState::Disabled => "DISABLED",
            BinaryState::Off => "OFF",
            BinaryState::On => "ON",
        };
        f.write_str(s)
    }
}

impl Default for BinaryState {
    fn default() -> Self {
        BinaryState::Off
    }
}
