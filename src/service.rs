// src/service.rs - Service layer: owns the manager, the output coordinator,
// the change-log store and the broadcaster, runs the event loop and the
// periodic poll, and dispatches operator commands.

use crate::config::{AlarmDefinition, Config};
use crate::error::{Result, SirenError};
use crate::manager::{AlarmChange, AlarmManager};
use crate::messaging::{AlarmAlert, AlarmBroadcaster, Command, CommandResponse, StatusReport};
use crate::outputs::{OutputCoordinator, OutputState};
use crate::persistence::AlarmStore;
use crate::raiser::{LocalAlarm, RemoteAlarm, SensorPort};
use crate::state::{AlarmState, Severity};
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Output line exercised by a buzzer or pilot test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLine {
    Buzzer,
    Pilot,
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputLine::Buzzer => write!(f, "buzzer"),
            OutputLine::Pilot => write!(f, "pilot"),
        }
    }
}

struct OutputTest {
    line: OutputLine,
    expiry: JoinHandle<()>,
}

/// Ties the alarm engine together and runs it.
pub struct AlarmService<S: Severity = AlarmState> {
    config: Config,
    manager: Arc<AlarmManager<S>>,
    outputs: Mutex<OutputCoordinator>,
    store: Arc<dyn AlarmStore<S>>,
    broadcaster: Arc<dyn AlarmBroadcaster<S>>,
    output_test: Mutex<Option<OutputTest>>,
}

impl<S: Severity> AlarmService<S> {
    /// Assemble a service. Alarms are registered separately via
    /// [`AlarmService::install_alarms`].
    pub fn new(
        config: Config,
        outputs: OutputCoordinator,
        store: Arc<dyn AlarmStore<S>>,
        broadcaster: Arc<dyn AlarmBroadcaster<S>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager: Arc::new(AlarmManager::new()),
            outputs: Mutex::new(outputs),
            store,
            broadcaster,
            output_test: Mutex::new(None),
        })
    }

    /// The alarm manager, for wiring additional raisers or subscribing.
    pub fn manager(&self) -> &Arc<AlarmManager<S>> {
        &self.manager
    }

    /// Latest derived output snapshot.
    pub fn output_state(&self) -> OutputState {
        self.outputs.lock().state()
    }

    /// Register a raiser per enabled configured alarm: local definitions get
    /// a [`LocalAlarm`] on a sensor from `sensors`, remote ones a
    /// [`RemoteAlarm`] relaying through the service broadcaster.
    pub fn install_alarms<F>(self: &Arc<Self>, sensors: F) -> Result<()>
    where
        F: Fn(&AlarmDefinition) -> Arc<dyn SensorPort>,
    {
        let max_severity = *S::raised_levels()
            .last()
            .expect("severity scheme has at least one raised level");
        for def in self.config.alarms.iter().filter(|d| d.enabled) {
            if def.is_local() {
                self.manager.add_raiser(Arc::new(LocalAlarm::new(
                    &def.id,
                    &def.name,
                    def.pin,
                    def.noise_threshold,
                    def.can_disable,
                    max_severity,
                    sensors(def),
                )))?;
            } else {
                self.manager.add_raiser(Arc::new(RemoteAlarm::new(
                    &def.id,
                    &def.name,
                    def.source.as_deref().unwrap_or_default(),
                    def.can_disable,
                    Arc::clone(&self.broadcaster),
                )))?;
            }
        }
        Ok(())
    }

    /// Run the event loop until the manager's event channel closes. Change
    /// events drive output recomputation, persistence and alert broadcasts;
    /// the poll timer refreshes raiser readings and publishes status.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut events = self.manager.subscribe();
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_secs = self.config.poll_interval_secs,
            alarms = self.manager.alarms().len(),
            "alarm service running"
        );
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(change) => self.handle_change(change).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "change events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = poll.tick() => self.poll().await,
            }
        }
        Ok(())
    }

    /// Full status snapshot: every alarm's state, message and code plus the
    /// derived outputs.
    pub fn status_report(&self) -> StatusReport<S> {
        let mut report = StatusReport {
            states: Default::default(),
            messages: Default::default(),
            codes: Default::default(),
            outputs: self.output_state(),
            testing: self.manager.test_active() || self.output_test.lock().is_some(),
        };
        for alarm in self.manager.alarms() {
            report.states.insert(alarm.id().to_string(), alarm.state());
            report
                .messages
                .insert(alarm.id().to_string(), alarm.message().map(str::to_string));
            report.codes.insert(alarm.id().to_string(), alarm.code());
        }
        report
    }

    async fn handle_change(&self, change: AlarmChange<S>) {
        // A real raise takes the outputs back from any running output test.
        if change.state.is_raised() && !change.testing {
            self.abort_output_test("real event takes priority");
        }
        let outputs = self.outputs.lock().recompute(&self.manager);
        if !change.testing {
            if let Err(e) = self.store.log_change(&change).await {
                error!(alarm = %change.id, "failed to log alarm change: {}", e);
            }
        }
        let alert = AlarmAlert::from_change(&change, outputs);
        if let Err(e) = self.broadcaster.broadcast_alert(&alert).await {
            warn!(alarm = %change.id, "alert broadcast failed: {}", e);
        }
    }

    async fn poll(&self) {
        if let Err(e) = self.manager.request_update_alarms(None) {
            warn!("update poll failed: {}", e);
        }
        let report = self.status_report();
        if let Err(e) = self.broadcaster.broadcast_status(&report).await {
            warn!("status broadcast failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Output tests
    // ------------------------------------------------------------------

    /// Drive one output line for `secs` seconds. Exclusive with alarm tests
    /// and refused while any alarm is raised.
    pub fn start_output_test(self: &Arc<Self>, line: OutputLine, secs: u64) -> Result<()> {
        if secs == 0 {
            return Err(SirenError::InvalidArgument(
                "test duration must be positive".into(),
            ));
        }
        let mut active = self.output_test.lock();
        if let Some(test) = &*active {
            return Err(SirenError::invalid_transition(
                "outputs",
                format!("a {} test is already running", test.line),
            ));
        }
        if self.manager.test_active() {
            return Err(SirenError::invalid_transition(
                "outputs",
                "an alarm test is already running",
            ));
        }
        if self.manager.is_raised() {
            return Err(SirenError::invalid_transition(
                "outputs",
                "cannot test outputs while an alarm is raised",
            ));
        }
        self.force_line(line, true);
        let service = Arc::clone(self);
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            service.finish_output_test(line);
        });
        *active = Some(OutputTest { line, expiry });
        info!(%line, secs, "output test started");
        Ok(())
    }

    /// End a running output test early.
    pub fn end_output_test(&self) -> Result<()> {
        let test = self
            .output_test
            .lock()
            .take()
            .ok_or_else(|| SirenError::InvalidArgument("no output test is running".into()))?;
        test.expiry.abort();
        self.force_line(test.line, false);
        Ok(())
    }

    fn abort_output_test(&self, reason: &str) {
        if let Some(test) = self.output_test.lock().take() {
            test.expiry.abort();
            warn!(line = %test.line, "aborting output test, {}", reason);
            self.force_line(test.line, false);
        }
    }

    fn finish_output_test(&self, line: OutputLine) {
        let mut active = self.output_test.lock();
        if active.as_ref().map(|t| t.line) == Some(line) {
            *active = None;
            drop(active);
            self.force_line(line, false);
            info!(%line, "output test ended");
        }
    }

    fn force_line(&self, line: OutputLine, on: bool) {
        let mut outputs = self.outputs.lock();
        match line {
            OutputLine::Buzzer => outputs.force_buzzer(on),
            OutputLine::Pilot => outputs.force_pilot(on),
        }
    }

    // ------------------------------------------------------------------
    // Command dispatch
    // ------------------------------------------------------------------

    /// Execute one operator command and render the outcome.
    pub async fn handle_command(self: &Arc<Self>, command: Command<S>) -> Result<CommandResponse> {
        match command {
            Command::ListAlarms => {
                let data = serde_json::to_value(&self.config.alarms)
                    .map_err(|e| SirenError::Config(format!("encode alarm list: {}", e)))?;
                Ok(CommandResponse::with_data(
                    format!("{} alarms configured", self.config.alarms.len()),
                    data,
                ))
            }
            Command::AlarmStatus { id: Some(id) } => {
                let alarm = self.manager.alarm(&id)?;
                let last_raised = self.store.last_raised(&id).await?;
                let last_lowered = self.store.last_lowered(&id).await?;
                let data = json!({
                    "id": alarm.id(),
                    "name": alarm.name(),
                    "state": alarm.state(),
                    "message": alarm.message(),
                    "code": alarm.code(),
                    "testing": alarm.is_testing(),
                    "last_raised": last_raised,
                    "last_lowered": last_lowered,
                });
                Ok(CommandResponse::with_data(
                    format!("alarm '{}' is {}", id, alarm.state()),
                    data,
                ))
            }
            Command::AlarmStatus { id: None } => {
                let report = self.status_report();
                let data = serde_json::to_value(&report)
                    .map_err(|e| SirenError::Config(format!("encode status: {}", e)))?;
                let message = if self.manager.is_raised() {
                    "alarms raised".to_string()
                } else {
                    "all quiet".to_string()
                };
                Ok(CommandResponse::with_data(message, data))
            }
            Command::Silence { secs } => {
                if !self.manager.is_raised() {
                    return Err(SirenError::InvalidArgument(
                        "nothing to silence, no alarm is raised".into(),
                    ));
                }
                let secs = secs.unwrap_or(self.config.default_silence_secs);
                self.outputs.lock().silence(secs)?;
                // the window expires on its own; recompute then so the buzzer
                // resumes even if no alarm event arrives in the meantime
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    service.outputs.lock().recompute(&service.manager);
                });
                Ok(CommandResponse::ok(format!(
                    "buzzer silenced for {} seconds",
                    secs
                )))
            }
            Command::Unsilence => {
                self.outputs.lock().unsilence();
                self.outputs.lock().recompute(&self.manager);
                Ok(CommandResponse::ok("silence cleared"))
            }
            Command::DisableAlarm { id } => {
                let changed = self.manager.disable(&id)?;
                Ok(CommandResponse::ok(if changed {
                    format!("alarm '{}' disabled", id)
                } else {
                    format!("alarm '{}' was already disabled", id)
                }))
            }
            Command::EnableAlarm { id } => {
                let changed = self.manager.enable(&id)?;
                Ok(CommandResponse::ok(if changed {
                    format!("alarm '{}' enabled", id)
                } else {
                    format!("alarm '{}' was not disabled", id)
                }))
            }
            Command::TestAlarm { id, state, secs } => {
                if self.output_test.lock().is_some() {
                    return Err(SirenError::invalid_transition(
                        &id,
                        "an output test is already running",
                    ));
                }
                let secs = secs.unwrap_or(self.config.default_test_secs);
                self.manager.start_test(&id, state, secs)?;
                Ok(CommandResponse::ok(format!(
                    "testing alarm '{}' for {} seconds",
                    id, secs
                )))
            }
            Command::TestBuzzer { secs } => {
                let secs = secs.unwrap_or(self.config.default_test_secs);
                self.start_output_test(OutputLine::Buzzer, secs)?;
                Ok(CommandResponse::ok(format!(
                    "sounding buzzer for {} seconds",
                    secs
                )))
            }
            Command::TestPilot { secs } => {
                let secs = secs.unwrap_or(self.config.default_test_secs);
                self.start_output_test(OutputLine::Pilot, secs)?;
                Ok(CommandResponse::ok(format!(
                    "lighting pilot for {} seconds",
                    secs
                )))
            }
            Command::EndTest => {
                if self.manager.test_active() {
                    self.manager.end_test(Some("test ended by command"))?;
                    Ok(CommandResponse::ok("alarm test ended"))
                } else {
                    self.end_output_test()?;
                    self.outputs.lock().recompute(&self.manager);
                    Ok(CommandResponse::ok("output test ended"))
                }
            }
            Command::Master { on } => {
                self.outputs.lock().set_master(on, &self.manager)?;
                Ok(CommandResponse::ok(format!(
                    "master line {}",
                    if on { "on" } else { "off" }
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::AlarmAlert;
    use crate::persistence::MemoryStore;
    use crate::state::NO_CODE;
    use async_trait::async_trait;

    struct CapturingBroadcaster {
        alerts: Mutex<Vec<AlarmAlert<AlarmState>>>,
    }

    #[async_trait]
    impl AlarmBroadcaster<AlarmState> for CapturingBroadcaster {
        async fn broadcast_alert(&self, alert: &AlarmAlert<AlarmState>) -> Result<()> {
            self.alerts.lock().push(alert.clone());
            Ok(())
        }
        async fn broadcast_status(&self, _status: &StatusReport<AlarmState>) -> Result<()> {
            Ok(())
        }
        async fn request_status(&self, _source: &str) -> Result<()> {
            Ok(())
        }
    }

    struct IdleSensor;

    impl SensorPort for IdleSensor {
        fn request_status(&self) {}
    }

    fn config() -> Config {
        Config::from_yaml(
            r#"
default_test_secs: 60
alarms:
  - { id: smoke1, name: Smoke detector 1, pin: 4 }
  - { id: gas1, name: Gas detector 1, pin: 5, can_disable: false }
"#,
        )
        .unwrap()
    }

    fn service() -> Arc<AlarmService> {
        let svc = AlarmService::new(
            config(),
            OutputCoordinator::new(),
            Arc::new(MemoryStore::new(Vec::new())),
            Arc::new(CapturingBroadcaster {
                alerts: Mutex::new(Vec::new()),
            }),
        );
        svc.install_alarms(|_| Arc::new(IdleSensor)).unwrap();
        svc
    }

    #[tokio::test]
    async fn test_install_alarms_from_config() {
        let svc = service();
        assert!(svc.manager().has_alarm("smoke1"));
        assert!(svc.manager().has_alarm("gas1"));
        let report = svc.status_report();
        assert_eq!(report.states.len(), 2);
        assert!(!report.testing);
    }

    #[tokio::test]
    async fn test_silence_requires_a_raised_alarm() {
        let svc = service();
        let err = svc
            .handle_command(Command::Silence { secs: Some(30) })
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::InvalidArgument(_)));

        svc.manager()
            .raise("smoke1", AlarmState::Critical, None, NO_CODE)
            .unwrap();
        svc.outputs.lock().recompute(svc.manager());
        svc.handle_command(Command::Silence { secs: Some(30) })
            .await
            .unwrap();
        assert!(!svc.output_state().buzzer);
        assert!(svc.output_state().silenced);
    }

    #[tokio::test]
    async fn test_output_test_runs_and_ends() {
        let svc = service();
        svc.handle_command(Command::TestBuzzer { secs: Some(60) })
            .await
            .unwrap();
        assert!(svc.output_state().buzzer);
        assert!(svc.status_report().testing);

        svc.handle_command(Command::EndTest).await.unwrap();
        assert!(!svc.output_state().buzzer);
        assert!(!svc.status_report().testing);
    }

    #[tokio::test]
    async fn test_output_and_alarm_tests_are_exclusive() {
        let svc = service();
        svc.start_output_test(OutputLine::Pilot, 60).unwrap();
        let err = svc
            .handle_command(Command::TestAlarm {
                id: "smoke1".into(),
                state: None,
                secs: Some(60),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SirenError::InvalidTransition { .. }));
        svc.end_output_test().unwrap();

        svc.manager()
            .start_test("smoke1", Some(AlarmState::Minor), 0)
            .unwrap();
        assert!(matches!(
            svc.start_output_test(OutputLine::Buzzer, 60),
            Err(SirenError::InvalidTransition { .. })
        ));
        svc.manager().end_test(None).unwrap();
    }

    #[tokio::test]
    async fn test_real_raise_aborts_output_test() {
        let svc = service();
        svc.start_output_test(OutputLine::Buzzer, 600).unwrap();
        assert!(svc.output_state().buzzer);

        svc.manager()
            .raise("gas1", AlarmState::Minor, None, NO_CODE)
            .unwrap();
        let change = AlarmChange {
            id: "gas1".into(),
            name: "Gas detector 1".into(),
            state: AlarmState::Minor,
            message: None,
            code: NO_CODE,
            testing: false,
            comment: None,
            at: chrono::Utc::now(),
        };
        svc.handle_change(change).await;
        assert!(svc.output_test.lock().is_none());
        // minor severity: pilot on, buzzer off
        assert!(svc.output_state().pilot);
        assert!(!svc.output_state().buzzer);
    }

    #[tokio::test]
    async fn test_command_surface() {
        let svc = service();

        let resp = svc.handle_command(Command::ListAlarms).await.unwrap();
        assert!(resp.data.unwrap().as_array().unwrap().len() == 2);

        svc.handle_command(Command::DisableAlarm { id: "smoke1".into() })
            .await
            .unwrap();
        assert!(svc.manager().is_disabled("smoke1").unwrap());
        // gas1 is marked non-disableable in the config
        assert!(svc
            .handle_command(Command::DisableAlarm { id: "gas1".into() })
            .await
            .is_err());
        svc.handle_command(Command::EnableAlarm { id: "smoke1".into() })
            .await
            .unwrap();

        let resp = svc
            .handle_command(Command::AlarmStatus {
                id: Some("smoke1".into()),
            })
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["state"], "LOWERED");

        svc.handle_command(Command::Master { on: true }).await.unwrap();
        assert!(svc.output_state().master);
        svc.handle_command(Command::Master { on: false })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_changes_are_logged_and_broadcast_except_tests() {
        let store = Arc::new(MemoryStore::new(Vec::new()));
        let broadcaster = Arc::new(CapturingBroadcaster {
            alerts: Mutex::new(Vec::new()),
        });
        let svc = AlarmService::new(
            config(),
            OutputCoordinator::new(),
            store.clone() as Arc<dyn AlarmStore<AlarmState>>,
            broadcaster.clone(),
        );
        svc.install_alarms(|_| Arc::new(IdleSensor)).unwrap();

        let mut events = svc.manager().subscribe();
        svc.manager()
            .raise("smoke1", AlarmState::Severe, Some("smoke".into()), NO_CODE)
            .unwrap();
        svc.handle_change(events.try_recv().unwrap()).await;
        assert_eq!(store.entries().len(), 1);
        assert_eq!(broadcaster.alerts.lock().len(), 1);

        svc.manager().lower("smoke1", None, NO_CODE).unwrap();
        svc.handle_change(events.try_recv().unwrap()).await;

        // test-sequence changes broadcast but stay out of the log
        svc.manager()
            .start_test("smoke1", Some(AlarmState::Critical), 0)
            .unwrap();
        svc.handle_change(events.try_recv().unwrap()).await;
        assert_eq!(store.entries().len(), 2);
        assert_eq!(broadcaster.alerts.lock().len(), 3);
        assert!(broadcaster.alerts.lock().last().unwrap().testing);
        svc.manager().end_test(None).unwrap();
    }
}
