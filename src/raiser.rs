// src/raiser.rs - Alarm raisers: the collaborators that originate state
// changes. Local raisers own a physical sensor switch; remote raisers relay
// another service's broadcast alerts. Both self-describe to the manager
// through the registration callback and push fresh readings on request.

use crate::error::Result;
use crate::manager::AlarmManager;
use crate::messaging::{AlarmAlert, AlarmBroadcaster};
use crate::state::{Severity, CODE_SOURCE_OFFLINE, CODE_SOURCE_ONLINE, NO_CODE};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A source of truth for one or more alarms.
///
/// Raisers register their alarms when added to a manager and can be asked to
/// push a fresh status reading at any time. The request never blocks; the
/// eventual push corrects state.
pub trait AlarmRaiser<S: Severity>: Send + Sync {
    /// Stable raiser id, unique within a manager.
    fn id(&self) -> &str;

    /// Register this raiser's alarms and keep the manager handle for pushes.
    fn register_alarms(&self, manager: &Arc<AlarmManager<S>>) -> Result<()>;

    /// Ask the underlying source for a fresh reading, fire-and-forget.
    fn request_update(&self);
}

/// Physical side of a local alarm: a passive switch input.
pub trait SensorPort: Send + Sync {
    /// Ask the switch to re-report its position. The wiring layer routes the
    /// answer back through [`LocalAlarm::handle_reading`].
    fn request_status(&self);
}

/// An alarm backed by a local sensor switch.
///
/// The switch closing raises at the configured severity; opening lowers.
pub struct LocalAlarm<S: Severity> {
    alarm_id: String,
    name: String,
    pin: u8,
    noise_threshold: u32,
    can_disable: bool,
    active_state: S,
    sensor: Arc<dyn SensorPort>,
    manager: RwLock<Weak<AlarmManager<S>>>,
}

impl<S: Severity> LocalAlarm<S> {
    /// New local alarm on the given input pin.
    pub fn new(
        alarm_id: &str,
        name: &str,
        pin: u8,
        noise_threshold: u32,
        can_disable: bool,
        active_state: S,
        sensor: Arc<dyn SensorPort>,
    ) -> Self {
        Self {
            alarm_id: alarm_id.to_string(),
            name: name.to_string(),
            pin,
            noise_threshold,
            can_disable,
            active_state,
            sensor,
            manager: RwLock::new(Weak::new()),
        }
    }

    /// Input pin the switch is wired to.
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Debounce threshold for the switch input.
    pub fn noise_threshold(&self) -> u32 {
        self.noise_threshold
    }

    /// Push a debounced switch reading into the manager.
    pub fn handle_reading(&self, on: bool) {
        let Some(manager) = self.manager.read().upgrade() else {
            warn!(alarm = %self.alarm_id, "sensor reading before registration");
            return;
        };
        let msg = format!(
            "Alarm {} {} @ {}",
            self.alarm_id,
            if on { "on" } else { "off" },
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
        );
        let result = if on {
            manager.raise(&self.alarm_id, self.active_state, Some(msg), NO_CODE)
        } else {
            manager.lower(&self.alarm_id, Some(msg), NO_CODE)
        };
        if let Err(e) = result {
            // A disabled alarm rejects raises; that is the point of disabling.
            debug!(alarm = %self.alarm_id, "sensor reading dropped: {}", e);
        }
    }
}

impl<S: Severity> AlarmRaiser<S> for LocalAlarm<S> {
    fn id(&self) -> &str {
        &self.alarm_id
    }

    fn register_alarms(&self, manager: &Arc<AlarmManager<S>>) -> Result<()> {
        *self.manager.write() = Arc::downgrade(manager);
        manager.register_alarm(&self.alarm_id, &self.alarm_id, &self.name, self.can_disable)?;
        Ok(())
    }

    fn request_update(&self) {
        self.sensor.request_status();
    }
}

/// An alarm relayed from a remote peer's broadcast alerts.
///
/// Inbound alerts matched by alarm id update the cached state and push it
/// into the manager. A peer going offline parks the alarm in the
/// disconnected state with the source-offline code.
pub struct RemoteAlarm<S: Severity> {
    alarm_id: String,
    name: String,
    source: String,
    can_disable: bool,
    enabled: RwLock<bool>,
    last_state: RwLock<S>,
    broadcaster: Arc<dyn AlarmBroadcaster<S>>,
    manager: RwLock<Weak<AlarmManager<S>>>,
}

impl<S: Severity> RemoteAlarm<S> {
    /// New remote alarm relayed from `source`.
    pub fn new(
        alarm_id: &str,
        name: &str,
        source: &str,
        can_disable: bool,
        broadcaster: Arc<dyn AlarmBroadcaster<S>>,
    ) -> Self {
        Self {
            alarm_id: alarm_id.to_string(),
            name: name.to_string(),
            source: source.to_string(),
            can_disable,
            enabled: RwLock::new(true),
            last_state: RwLock::new(S::disconnected()),
            broadcaster,
            manager: RwLock::new(Weak::new()),
        }
    }

    /// Peer service the alerts come from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Last state the peer reported.
    pub fn last_state(&self) -> S {
        *self.last_state.read()
    }

    /// Gate inbound alert handling without touching the manager's state.
    pub fn set_enabled(&self, enabled: bool) {
        *self.enabled.write() = enabled;
    }

    /// Handle an inbound alert. Alerts for other alarm ids are ignored;
    /// returns whether the alert was consumed.
    pub fn handle_alert(&self, alert: &AlarmAlert<S>) -> bool {
        if alert.alarm_id != self.alarm_id || !*self.enabled.read() {
            return false;
        }
        *self.last_state.write() = alert.state;
        self.push(alert.state, alert.message.clone(), alert.code);
        true
    }

    /// Mark the peer as offline: the alarm parks in the disconnected state.
    pub fn handle_source_offline(&self) {
        self.push(
            S::disconnected(),
            Some(format!("Source {} offline", self.source)),
            CODE_SOURCE_OFFLINE,
        );
    }

    /// Mark the peer as back online and ask it for a fresh status.
    pub fn handle_source_online(&self) {
        self.push(
            S::lowered(),
            Some(format!("Source {} online", self.source)),
            CODE_SOURCE_ONLINE,
        );
        self.request_update();
    }

    fn push(&self, state: S, message: Option<String>, code: i32) {
        let Some(manager) = self.manager.read().upgrade() else {
            warn!(alarm = %self.alarm_id, "remote update before registration");
            return;
        };
        if let Err(e) = manager.update(&self.alarm_id, state, message, code) {
            debug!(alarm = %self.alarm_id, "remote update dropped: {}", e);
        }
    }
}

impl<S: Severity> AlarmRaiser<S> for RemoteAlarm<S> {
    fn id(&self) -> &str {
        &self.alarm_id
    }

    fn register_alarms(&self, manager: &Arc<AlarmManager<S>>) -> Result<()> {
        *self.manager.write() = Arc::downgrade(manager);
        manager.register_alarm(&self.alarm_id, &self.alarm_id, &self.name, self.can_disable)?;
        // Remote alarms start disconnected until the peer reports in.
        manager.update(
            &self.alarm_id,
            S::disconnected(),
            Some(format!("Awaiting first report from {}", self.source)),
            CODE_SOURCE_OFFLINE,
        )?;
        Ok(())
    }

    fn request_update(&self) {
        let broadcaster = Arc::clone(&self.broadcaster);
        let source = self.source.clone();
        tokio::spawn(async move {
            if let Err(e) = broadcaster.request_status(&source).await {
                warn!(source = %source, "status request failed: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SirenError;
    use crate::state::AlarmState;
    use async_trait::async_trait;
    use crate::messaging::StatusReport;
    use parking_lot::Mutex;

    struct FakeSensor {
        requests: Mutex<u32>,
    }

    impl SensorPort for FakeSensor {
        fn request_status(&self) {
            *self.requests.lock() += 1;
        }
    }

    struct NullBroadcaster;

    #[async_trait]
    impl AlarmBroadcaster<AlarmState> for NullBroadcaster {
        async fn broadcast_alert(&self, _alert: &AlarmAlert<AlarmState>) -> Result<()> {
            Ok(())
        }
        async fn broadcast_status(&self, _status: &StatusReport<AlarmState>) -> Result<()> {
            Ok(())
        }
        async fn request_status(&self, _source: &str) -> Result<()> {
            Ok(())
        }
    }

    fn local(sensor: Arc<FakeSensor>) -> Arc<LocalAlarm<AlarmState>> {
        Arc::new(LocalAlarm::new(
            "smoke1",
            "Smoke detector 1",
            7,
            100,
            true,
            AlarmState::Critical,
            sensor,
        ))
    }

    #[test]
    fn test_local_alarm_registers_and_pushes() {
        let manager = Arc::new(AlarmManager::new());
        let sensor = Arc::new(FakeSensor {
            requests: Mutex::new(0),
        });
        let alarm = local(Arc::clone(&sensor));
        manager.add_raiser(alarm.clone()).unwrap();
        assert!(manager.has_alarm("smoke1"));

        alarm.handle_reading(true);
        assert_eq!(manager.alarm("smoke1").unwrap().state(), AlarmState::Critical);
        alarm.handle_reading(false);
        assert!(manager.alarm("smoke1").unwrap().is_quiescent());

        manager.request_update_alarms(Some("smoke1")).unwrap();
        assert_eq!(*sensor.requests.lock(), 1);
    }

    #[test]
    fn test_add_raiser_is_idempotent() {
        let manager = Arc::new(AlarmManager::new());
        let sensor = Arc::new(FakeSensor {
            requests: Mutex::new(0),
        });
        let alarm = local(sensor);
        manager.add_raiser(alarm.clone()).unwrap();
        // second add is a no-op, not a duplicate-id error
        manager.add_raiser(alarm).unwrap();
        assert_eq!(manager.alarms().len(), 1);
    }

    #[test]
    fn test_remote_alarm_relays_matched_alerts() {
        let manager = Arc::new(AlarmManager::new());
        let remote: Arc<RemoteAlarm<AlarmState>> = Arc::new(RemoteAlarm::new(
            "pump1",
            "Bilge pump",
            "pump-service",
            true,
            Arc::new(NullBroadcaster),
        ));
        manager.add_raiser(remote.clone()).unwrap();
        assert_eq!(
            manager.alarm("pump1").unwrap().state(),
            AlarmState::Disconnected
        );

        let alert = AlarmAlert {
            alarm_id: "pump1".into(),
            state: AlarmState::Severe,
            message: Some("pump jammed".into()),
            code: NO_CODE,
            testing: false,
            outputs: None,
        };
        assert!(remote.handle_alert(&alert));
        assert_eq!(manager.alarm("pump1").unwrap().state(), AlarmState::Severe);

        // other ids pass through untouched
        let other = AlarmAlert {
            alarm_id: "other".into(),
            ..alert.clone()
        };
        assert!(!remote.handle_alert(&other));

        // disabled gate drops matched alerts
        remote.set_enabled(false);
        assert!(!remote.handle_alert(&alert));
    }

    #[test]
    fn test_remote_source_offline_parks_disconnected() {
        let manager = Arc::new(AlarmManager::new());
        let remote: Arc<RemoteAlarm<AlarmState>> = Arc::new(RemoteAlarm::new(
            "pump1",
            "Bilge pump",
            "pump-service",
            true,
            Arc::new(NullBroadcaster),
        ));
        manager.add_raiser(remote.clone()).unwrap();
        let alert = AlarmAlert {
            alarm_id: "pump1".into(),
            state: AlarmState::Lowered,
            message: None,
            code: NO_CODE,
            testing: false,
            outputs: None,
        };
        remote.handle_alert(&alert);
        remote.handle_source_offline();
        let a = manager.alarm("pump1").unwrap();
        assert_eq!(a.state(), AlarmState::Disconnected);
        assert_eq!(a.code(), CODE_SOURCE_OFFLINE);
    }

    struct ClashingRaiser;

    impl AlarmRaiser<AlarmState> for ClashingRaiser {
        fn id(&self) -> &str {
            "imposter"
        }
        fn register_alarms(&self, manager: &Arc<AlarmManager<AlarmState>>) -> Result<()> {
            manager.register_alarm("imposter", "smoke1", "Imposter", true)?;
            Ok(())
        }
        fn request_update(&self) {}
    }

    #[test]
    fn test_duplicate_alarm_id_fails_registration() {
        let manager = Arc::new(AlarmManager::new());
        let sensor = Arc::new(FakeSensor {
            requests: Mutex::new(0),
        });
        manager.add_raiser(local(Arc::clone(&sensor))).unwrap();

        // a different raiser claiming the same alarm id is rejected and not
        // kept in the raiser list
        assert!(matches!(
            manager.add_raiser(Arc::new(ClashingRaiser)),
            Err(SirenError::Config(_))
        ));
        manager.request_update_alarms(None).unwrap();
        assert_eq!(*sensor.requests.lock(), 1);
    }
}
