// src/manager.rs - Alarm manager: registry, state machine entry points,
// change-event fan-out and test orchestration.
//
// Lock discipline: every mutation takes the interior write lock for its
// duration, collects the resulting change events, and emits them only after
// the lock is released. Queries take the read lock. The test-expiry timer is
// a cancellable tokio task that re-enters through the same public methods.

use crate::alarm::Alarm;
use crate::error::{Result, SirenError};
use crate::raiser::AlarmRaiser;
use crate::state::{AlarmState, Severity, NO_CODE};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

/// Capacity of the change-event channel. Slow subscribers lag, they never
/// block a mutation.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Snapshot of one observable alarm change, emitted exactly once per
/// effective mutation.
#[derive(Debug, Clone, Serialize)]
pub struct AlarmChange<S> {
    /// Alarm id
    pub id: String,
    /// Display name
    pub name: String,
    /// State after the change
    pub state: S,
    /// Message after the change
    pub message: Option<String>,
    /// Code after the change
    pub code: i32,
    /// Whether the change belongs to a test sequence
    pub testing: bool,
    /// Operator/engine annotation for the change log
    pub comment: Option<String>,
    /// When the change was applied
    pub at: DateTime<Utc>,
}

struct ActiveTest {
    alarm_id: String,
    expiry: Option<JoinHandle<()>>,
}

impl ActiveTest {
    fn cancel(&self) {
        if let Some(handle) = &self.expiry {
            handle.abort();
        }
    }
}

struct Inner<S> {
    alarms: HashMap<String, Alarm<S>>,
    active_test: Option<ActiveTest>,
}

/// Owns the alarm collection and enforces the state machine.
///
/// Updates arrive from raisers, operator commands and timers; all of them are
/// serialized through the interior lock. Subscribers obtain change events via
/// [`AlarmManager::subscribe`].
pub struct AlarmManager<S: Severity = AlarmState> {
    inner: RwLock<Inner<S>>,
    raisers: RwLock<Vec<Arc<dyn AlarmRaiser<S>>>>,
    events: broadcast::Sender<AlarmChange<S>>,
}

impl<S: Severity> AlarmManager<S> {
    /// Create an empty manager.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                alarms: HashMap::new(),
                active_test: None,
            }),
            raisers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Subscribe to change events. Events are sent after the state lock is
    /// released; a lagging receiver loses old events, never new state.
    pub fn subscribe(&self) -> broadcast::Receiver<AlarmChange<S>> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a new alarm bound to `raiser_id`. Fails if the id is already
    /// present or either id is empty.
    pub fn register_alarm(
        &self,
        raiser_id: &str,
        id: &str,
        name: &str,
        can_disable: bool,
    ) -> Result<Alarm<S>> {
        if id.is_empty() {
            return Err(SirenError::InvalidArgument("alarm id is empty".into()));
        }
        if raiser_id.is_empty() {
            return Err(SirenError::InvalidArgument(format!(
                "raiser id for alarm '{}' is empty",
                id
            )));
        }
        let mut inner = self.inner.write();
        if inner.alarms.contains_key(id) {
            return Err(SirenError::Config(format!(
                "there is already an alarm with id '{}'",
                id
            )));
        }
        let alarm = Alarm::new(id, name, raiser_id, can_disable);
        inner.alarms.insert(id.to_string(), alarm.clone());
        info!(alarm = id, raiser = raiser_id, "registered alarm");
        Ok(alarm)
    }

    /// Force-lower and remove an alarm. The forced lower flushes a final
    /// change event if the alarm was not already quiescent.
    pub fn deregister_alarm(&self, id: &str) -> Result<()> {
        let change = {
            let mut inner = self.inner.write();
            let alarm = inner
                .alarms
                .get_mut(id)
                .ok_or_else(|| SirenError::NotFound(id.to_string()))?;
            let change = if alarm.lower(None, NO_CODE)? {
                Some(Self::change_of(alarm, Some("alarm deregistered".into())))
            } else {
                None
            };
            inner.alarms.remove(id);
            change
        };
        self.emit(change);
        info!(alarm = id, "deregistered alarm");
        Ok(())
    }

    /// Add a raiser; idempotent by raiser id. On first add the raiser's
    /// registration callback runs, through which it registers its alarms.
    pub fn add_raiser(self: &Arc<Self>, raiser: Arc<dyn AlarmRaiser<S>>) -> Result<()> {
        {
            let mut raisers = self.raisers.write();
            if raisers.iter().any(|r| r.id() == raiser.id()) {
                return Ok(());
            }
            raisers.push(Arc::clone(&raiser));
        }
        if let Err(e) = raiser.register_alarms(self) {
            self.raisers.write().retain(|r| r.id() != raiser.id());
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot of one alarm.
    pub fn alarm(&self, id: &str) -> Result<Alarm<S>> {
        self.inner
            .read()
            .alarms
            .get(id)
            .cloned()
            .ok_or_else(|| SirenError::NotFound(id.to_string()))
    }

    /// Snapshot of one alarm, or `None` when unknown.
    pub fn get_alarm(&self, id: &str) -> Option<Alarm<S>> {
        self.inner.read().alarms.get(id).cloned()
    }

    /// Whether an alarm with this id is registered.
    pub fn has_alarm(&self, id: &str) -> bool {
        self.inner.read().alarms.contains_key(id)
    }

    /// Whether any alarm currently holds exactly this state.
    pub fn has_alarm_with_state(&self, state: S) -> bool {
        self.inner.read().alarms.values().any(|a| a.state() == state)
    }

    /// True iff at least one alarm is raised (non-quiescent, non-disabled).
    pub fn is_raised(&self) -> bool {
        self.inner.read().alarms.values().any(|a| a.is_raised())
    }

    /// Whether the given alarm is disabled.
    pub fn is_disabled(&self, id: &str) -> Result<bool> {
        self.alarm(id).map(|a| a.is_disabled())
    }

    /// Snapshots of all alarms, in registration-independent order.
    pub fn alarms(&self) -> Vec<Alarm<S>> {
        self.inner.read().alarms.values().cloned().collect()
    }

    /// Id of the alarm currently under test, if any.
    pub fn testing_alarm(&self) -> Option<String> {
        self.inner
            .read()
            .active_test
            .as_ref()
            .map(|t| t.alarm_id.clone())
    }

    /// Whether an alarm test is running.
    pub fn test_active(&self) -> bool {
        self.inner.read().active_test.is_some()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Apply a validated state update to one alarm. Returns whether anything
    /// observably changed. A raise arriving while a test is running aborts
    /// the test first; the real event always wins.
    pub fn update(&self, id: &str, state: S, message: Option<String>, code: i32) -> Result<bool> {
        self.update_with_comment(id, state, message, code, None)
    }

    /// [`AlarmManager::update`] with an annotation for the change log.
    pub fn update_with_comment(
        &self,
        id: &str,
        state: S,
        message: Option<String>,
        code: i32,
        comment: Option<String>,
    ) -> Result<bool> {
        let mut changes: Vec<AlarmChange<S>> = Vec::new();
        let changed = {
            let mut inner = self.inner.write();
            if !inner.alarms.contains_key(id) {
                return Err(SirenError::NotFound(id.to_string()));
            }

            if state.is_raised() && inner.active_test.is_some() {
                let testing_id = inner.active_test.as_ref().map(|t| t.alarm_id.clone());
                if testing_id.as_deref() != Some(id) {
                    // Probe on a copy so a rejected raise leaves the test running.
                    let mut probe = inner.alarms.get(id).cloned().unwrap();
                    probe.update(state, message.clone(), code)?;
                }
                let test = inner.active_test.take().unwrap();
                test.cancel();
                warn!(alarm = id, "aborting alarm test, real event takes priority");
                if let Some(tested) = inner.alarms.get_mut(&test.alarm_id) {
                    if tested.end_test(None, NO_CODE).unwrap_or(false) {
                        let mut change = Self::change_of(
                            tested,
                            Some(format!("test aborted by real event on '{}'", id)),
                        );
                        // the closing lower still belongs to the test sequence
                        change.testing = true;
                        changes.push(change);
                    }
                }
            }

            let alarm = inner.alarms.get_mut(id).unwrap();
            let changed = alarm.update(state, message, code)?;
            if changed {
                changes.push(Self::change_of(alarm, comment));
            }
            changed
        };
        for change in changes {
            self.emit(Some(change));
        }
        Ok(changed)
    }

    /// Raise an alarm. Quiescent or disabled target values are rejected with
    /// an invalid-argument error regardless of the alarm's current state.
    pub fn raise(&self, id: &str, state: S, message: Option<String>, code: i32) -> Result<bool> {
        if !state.is_raised() {
            return Err(SirenError::InvalidArgument(format!(
                "state {} is not valid for raising an alarm",
                state
            )));
        }
        self.update(id, state, message, code)
    }

    /// Lower an alarm back to the quiescent state.
    pub fn lower(&self, id: &str, message: Option<String>, code: i32) -> Result<bool> {
        self.update(id, S::lowered(), message, code)
    }

    /// Clear an alarm's disabled state. No-op when not disabled.
    pub fn enable(&self, id: &str) -> Result<bool> {
        self.toggle_disable(id, true)
    }

    /// Disable an alarm. No-op when already disabled; fails when the alarm
    /// does not permit disabling.
    pub fn disable(&self, id: &str) -> Result<bool> {
        self.toggle_disable(id, false)
    }

    fn toggle_disable(&self, id: &str, enable: bool) -> Result<bool> {
        let change = {
            let mut inner = self.inner.write();
            let alarm = inner
                .alarms
                .get_mut(id)
                .ok_or_else(|| SirenError::NotFound(id.to_string()))?;
            let changed = if enable { alarm.enable()? } else { alarm.disable()? };
            changed.then(|| Self::change_of(alarm, None))
        };
        let changed = change.is_some();
        self.emit(change);
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Test orchestration
    // ------------------------------------------------------------------

    /// Start a timed test on one alarm. Fails while any alarm is raised or a
    /// test is already running. A quiescent requested state draws a random
    /// raised severity. With `secs > 0` the test ends itself on a timer.
    pub fn start_test(
        self: &Arc<Self>,
        id: &str,
        state: Option<S>,
        secs: u64,
    ) -> Result<()> {
        let change = {
            let mut inner = self.inner.write();
            if !inner.alarms.contains_key(id) {
                return Err(SirenError::NotFound(id.to_string()));
            }
            if let Some(test) = &inner.active_test {
                return Err(SirenError::invalid_transition(
                    id,
                    format!("a test is already running on '{}'", test.alarm_id),
                ));
            }
            if inner.alarms.values().any(|a| a.is_raised()) {
                return Err(SirenError::invalid_transition(
                    id,
                    "cannot test while an alarm is raised",
                ));
            }
            let alarm = inner.alarms.get_mut(id).unwrap();

            let state = match state {
                Some(s) if s.is_raised() => s,
                _ => *S::raised_levels()
                    .choose(&mut rand::thread_rng())
                    .expect("severity scheme has at least one raised level"),
            };
            let msg = format!("Start alarm test at {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
            alarm.start_test(state, Some(msg), NO_CODE)?;
            let change = Self::change_of(alarm, Some("start alarm test".into()));

            let expiry = (secs > 0).then(|| {
                let manager = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    if let Err(e) = manager.end_test(Some("end alarm test after timeout")) {
                        warn!("failed to end alarm test after timeout: {}", e);
                    }
                })
            });
            inner.active_test = Some(ActiveTest {
                alarm_id: id.to_string(),
                expiry,
            });
            change
        };
        info!(alarm = id, secs, "alarm test started");
        self.emit(Some(change));
        Ok(())
    }

    /// End the running test: cancel its countdown, lower the tested alarm and
    /// clear its testing mark.
    pub fn end_test(&self, comment: Option<&str>) -> Result<()> {
        let change = {
            let mut inner = self.inner.write();
            let test = inner
                .active_test
                .take()
                .ok_or_else(|| SirenError::InvalidArgument("no test is running".into()))?;
            test.cancel();
            let alarm = inner
                .alarms
                .get_mut(&test.alarm_id)
                .ok_or_else(|| SirenError::NotFound(test.alarm_id.clone()))?;
            alarm.end_test(None, NO_CODE)?;
            let mut change = Self::change_of(
                alarm,
                Some(comment.unwrap_or("end alarm test").to_string()),
            );
            // the closing lower still belongs to the test sequence
            change.testing = true;
            change
        };
        self.emit(Some(change));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raiser delegation
    // ------------------------------------------------------------------

    /// Ask one raiser (or all raisers) to push a fresh status reading. The
    /// call never blocks on the answer; the eventual push corrects state.
    pub fn request_update_alarms(&self, id: Option<&str>) -> Result<()> {
        match id {
            Some(id) => {
                let alarm = self.alarm(id)?;
                let raiser = self
                    .raisers
                    .read()
                    .iter()
                    .find(|r| r.id() == alarm.raiser_id())
                    .cloned()
                    .ok_or_else(|| {
                        SirenError::Config(format!("alarm '{}' has no registered raiser", id))
                    })?;
                raiser.request_update();
            }
            None => {
                let raisers: Vec<_> = self.raisers.read().iter().cloned().collect();
                for raiser in raisers {
                    raiser.request_update();
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn change_of(alarm: &Alarm<S>, comment: Option<String>) -> AlarmChange<S> {
        AlarmChange {
            id: alarm.id().to_string(),
            name: alarm.name().to_string(),
            state: alarm.state(),
            message: alarm.message().map(str::to_string),
            code: alarm.code(),
            testing: alarm.is_testing(),
            comment,
            at: Utc::now(),
        }
    }

    fn emit(&self, change: Option<AlarmChange<S>>) {
        if let Some(change) = change {
            // No receivers is fine; subscribers are optional.
            let _ = self.events.send(change);
        }
    }
}

impl<S: Severity> Default for AlarmManager<S> {
    fn default() -> Self {
        Self::new()
    }
}
