// src/alarm.rs - Single alarm entity and transition validation
//
// All state-machine rules live here so the manager only has to care about
// lookup, event fan-out and test orchestration. Policy on escalation is
// strict: a raised alarm cannot move straight to a different severity, it has
// to be lowered first. Re-asserting the same state with a different code is a
// legitimate change (that is what the code annotation is for).

use crate::error::{Result, SirenError};
use crate::state::{Severity, NO_CODE};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One named alarm: current state, message, code and timestamp buckets.
///
/// Created by [`AlarmManager::register_alarm`](crate::AlarmManager::register_alarm)
/// and mutated only through the validated transition methods. The manager
/// hands out clones as read snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct Alarm<S> {
    id: String,
    name: String,
    raiser_id: String,
    state: S,
    message: Option<String>,
    code: i32,
    can_disable: bool,
    testing: bool,
    last_raised: Option<DateTime<Utc>>,
    last_lowered: Option<DateTime<Utc>>,
    last_disabled: Option<DateTime<Utc>>,
}

impl<S: Severity> Alarm<S> {
    pub(crate) fn new(id: &str, name: &str, raiser_id: &str, can_disable: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            raiser_id: raiser_id.to_string(),
            state: S::lowered(),
            message: None,
            code: NO_CODE,
            can_disable,
            testing: false,
            last_raised: None,
            last_lowered: None,
            last_disabled: None,
        }
    }

    /// Stable unique key, immutable after registration.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the raiser this alarm is bound to.
    pub fn raiser_id(&self) -> &str {
        &self.raiser_id
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.state
    }

    /// Free-text explanation of the current state.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Small integer annotation attached to the current state.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Whether this alarm accepts being disabled.
    pub fn can_disable(&self) -> bool {
        self.can_disable
    }

    /// Whether the current state is part of a test sequence.
    pub fn is_testing(&self) -> bool {
        self.testing
    }

    /// True while the state is any raised severity.
    pub fn is_raised(&self) -> bool {
        self.state.is_raised()
    }

    /// True while the state is lowered or disconnected.
    pub fn is_quiescent(&self) -> bool {
        self.state.is_quiescent()
    }

    /// True while the alarm is disabled.
    pub fn is_disabled(&self) -> bool {
        self.state.is_disabled()
    }

    /// When the alarm last entered a raised state.
    pub fn last_raised(&self) -> Option<DateTime<Utc>> {
        self.last_raised
    }

    /// When the alarm last entered a quiescent state.
    pub fn last_lowered(&self) -> Option<DateTime<Utc>> {
        self.last_lowered
    }

    /// When the alarm was last disabled.
    pub fn last_disabled(&self) -> Option<DateTime<Utc>> {
        self.last_disabled
    }

    /// Apply a validated transition. Returns whether anything observable
    /// (state or code) changed; identical updates are silent no-ops.
    pub(crate) fn update(
        &mut self,
        state: S,
        message: Option<String>,
        code: i32,
    ) -> Result<bool> {
        if state == self.state && code == self.code {
            return Ok(false);
        }
        // Re-confirming DISABLED carries no information, whatever the code.
        if state.is_disabled() && self.state.is_disabled() {
            return Ok(false);
        }
        self.validate_transition(state)?;

        self.state = state;
        self.message = message;
        self.code = code;

        let now = Utc::now();
        if self.state.is_raised() {
            self.last_raised = Some(now);
        } else if self.state.is_quiescent() {
            self.last_lowered = Some(now);
        } else {
            self.last_disabled = Some(now);
        }
        Ok(true)
    }

    fn validate_transition(&self, target: S) -> Result<()> {
        if target.is_disabled() && !self.can_disable {
            return Err(SirenError::invalid_transition(
                &self.id,
                "alarm does not permit disabling",
            ));
        }
        if self.state.is_disabled() && !target.is_quiescent() {
            return Err(SirenError::invalid_transition(
                &self.id,
                format!("disabled alarm can only be cleared to quiescent, not {}", target),
            ));
        }
        if target.is_raised() && self.state.is_raised() && target != self.state {
            return Err(SirenError::invalid_transition(
                &self.id,
                format!(
                    "already raised at {}; lower before raising at {}",
                    self.state, target
                ),
            ));
        }
        Ok(())
    }

    /// Raise to the given severity. Quiescent and disabled values are not
    /// valid raise targets.
    pub(crate) fn raise(&mut self, state: S, message: Option<String>, code: i32) -> Result<bool> {
        if !state.is_raised() {
            return Err(SirenError::InvalidArgument(format!(
                "state {} is not valid for raising an alarm",
                state
            )));
        }
        self.update(state, message, code)
    }

    /// Lower back to the quiescent state.
    pub(crate) fn lower(&mut self, message: Option<String>, code: i32) -> Result<bool> {
        self.update(S::lowered(), message, code)
    }

    /// Clear the disabled state. No-op when not disabled.
    pub(crate) fn enable(&mut self) -> Result<bool> {
        if !self.state.is_disabled() {
            return Ok(false);
        }
        self.update(S::lowered(), None, NO_CODE)
    }

    /// Disable the alarm. No-op when already disabled.
    pub(crate) fn disable(&mut self) -> Result<bool> {
        if self.state.is_disabled() {
            return Ok(false);
        }
        self.update(S::disabled(), None, NO_CODE)
    }

    /// Mark the alarm as testing, then raise.
    pub(crate) fn start_test(&mut self, state: S, message: Option<String>, code: i32) -> Result<bool> {
        self.testing = true;
        match self.raise(state, message, code) {
            Ok(changed) => Ok(changed),
            Err(e) => {
                self.testing = false;
                Err(e)
            }
        }
    }

    /// Lower, then clear the testing mark.
    pub(crate) fn end_test(&mut self, message: Option<String>, code: i32) -> Result<bool> {
        let changed = self.lower(message, code)?;
        self.testing = false;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AlarmState, CODE_SOURCE_OFFLINE};
    use proptest::prelude::*;

    fn alarm() -> Alarm<AlarmState> {
        Alarm::new("smoke1", "Smoke detector 1", "local", true)
    }

    #[test]
    fn test_raise_from_quiescent() {
        let mut a = alarm();
        assert!(a.raise(AlarmState::Severe, Some("smoke".into()), NO_CODE).unwrap());
        assert_eq!(a.state(), AlarmState::Severe);
        assert!(a.is_raised());
        assert!(a.last_raised().is_some());
    }

    #[test]
    fn test_raise_rejects_quiescent_target() {
        let mut a = alarm();
        assert!(matches!(
            a.raise(AlarmState::Lowered, None, NO_CODE),
            Err(SirenError::InvalidArgument(_))
        ));
        assert!(matches!(
            a.raise(AlarmState::Disabled, None, NO_CODE),
            Err(SirenError::InvalidArgument(_))
        ));
        // ... also when already raised
        a.raise(AlarmState::Minor, None, NO_CODE).unwrap();
        assert!(matches!(
            a.raise(AlarmState::Disconnected, None, NO_CODE),
            Err(SirenError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_no_escalation_while_raised() {
        let mut a = alarm();
        a.raise(AlarmState::Minor, None, NO_CODE).unwrap();
        assert!(matches!(
            a.raise(AlarmState::Critical, None, NO_CODE),
            Err(SirenError::InvalidTransition { .. })
        ));
        assert_eq!(a.state(), AlarmState::Minor);
        a.lower(None, NO_CODE).unwrap();
        assert!(a.raise(AlarmState::Critical, None, NO_CODE).unwrap());
    }

    #[test]
    fn test_code_change_while_raised_is_a_change() {
        let mut a = alarm();
        a.raise(AlarmState::Severe, None, NO_CODE).unwrap();
        let changed = a
            .update(AlarmState::Severe, Some("source offline".into()), CODE_SOURCE_OFFLINE)
            .unwrap();
        assert!(changed);
        assert_eq!(a.code(), CODE_SOURCE_OFFLINE);
    }

    #[test]
    fn test_disable_requires_permission() {
        let mut a: Alarm<AlarmState> = Alarm::new("fixed", "Fixed alarm", "local", false);
        assert!(matches!(
            a.disable(),
            Err(SirenError::InvalidTransition { .. })
        ));
        assert_eq!(a.state(), AlarmState::Lowered);
    }

    #[test]
    fn test_disable_enable_round_trip() {
        let mut a = alarm();
        assert!(a.disable().unwrap());
        assert!(a.is_disabled());
        assert!(a.last_disabled().is_some());
        // no-op when already disabled
        assert!(!a.disable().unwrap());
        assert!(a.enable().unwrap());
        assert!(a.is_quiescent());
        assert!(!a.is_raised());
        // enable again is a no-op
        assert!(!a.enable().unwrap());
    }

    #[test]
    fn test_disabled_blocks_everything_but_clearing() {
        let mut a = alarm();
        a.disable().unwrap();
        assert!(matches!(
            a.update(AlarmState::Critical, None, NO_CODE),
            Err(SirenError::InvalidTransition { .. })
        ));
        assert!(a.update(AlarmState::Disconnected, None, NO_CODE).unwrap());
        assert!(a.is_quiescent());
    }

    #[test]
    fn test_testing_flag_lifecycle() {
        let mut a = alarm();
        a.start_test(AlarmState::Critical, Some("start test".into()), NO_CODE)
            .unwrap();
        assert!(a.is_testing());
        assert!(a.is_raised());
        a.end_test(Some("end test".into()), NO_CODE).unwrap();
        assert!(!a.is_testing());
        assert!(a.is_quiescent());
    }

    #[test]
    fn test_failed_test_start_clears_testing() {
        let mut a = alarm();
        a.raise(AlarmState::Minor, None, NO_CODE).unwrap();
        assert!(a.start_test(AlarmState::Critical, None, NO_CODE).is_err());
        assert!(!a.is_testing());
    }

    proptest! {
        // Updating with the alarm's current (state, code) never reports a
        // change, whatever state the alarm is in.
        #[test]
        fn prop_identical_update_is_noop(seed in 0usize..6, code in 0i32..5) {
            let mut a = alarm();
            let states = [
                AlarmState::Lowered,
                AlarmState::Disconnected,
                AlarmState::Minor,
                AlarmState::Moderate,
                AlarmState::Severe,
                AlarmState::Critical,
            ];
            let state = states[seed];
            a.update(state, None, code).unwrap();
            let before_lowered = a.last_lowered();
            let before_raised = a.last_raised();
            prop_assert!(!a.update(state, None, code).unwrap());
            prop_assert_eq!(a.last_lowered(), before_lowered);
            prop_assert_eq!(a.last_raised(), before_raised);
        }
    }
}
