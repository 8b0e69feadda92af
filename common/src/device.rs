use std::collections::VecDeque;

use chrono::{DateTime, FixedOffset};
use log::{error, info, warn};

use crate::{
    actuator::{Light, StatusIndicator, TimedActuator},
    command::{Command, CommandMessage},
    config::{DeviceConfig, NetworkConfig},
    connectivity::ConnectivityManager,
    error::ConfigError,
    hal::{LinkDriver, MemoryProbe, OutputPin, SensorBus, Transport},
    health::HealthMonitor,
    reminder::{ReminderEvent, ReminderScheduler},
    sensors::SensorSampler,
    telemetry::{PublishOutcome, TelemetryPublisher, TelemetrySnapshot},
    types::LinkState,
};

pub const COMMAND_QUEUE_CAPACITY: usize = 8;

/// Clock readings for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Now {
    /// Monotonic milliseconds since boot.
    pub mono_ms: u64,
    /// Local wall-clock time, `None` until the clock has been synced.
    pub local: Option<DateTime<FixedOffset>>,
}

/// Platform drivers the device runs against.
pub struct Board<L, S, M, T, P> {
    pub link: L,
    pub sensors: S,
    pub memory: M,
    pub transport: T,
    pub buzzer: P,
    pub light: P,
    pub status_led: P,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub link: LinkState,
    pub fired: Vec<ReminderEvent>,
    pub publish: PublishOutcome,
    pub reboot_requested: bool,
}

/// Single-threaded control loop. Each `tick` runs every component once in a
/// fixed order: link, sensors, health, commands, reminders, status LED,
/// telemetry.
pub struct Device {
    connectivity: ConnectivityManager,
    sampler: SensorSampler,
    health: HealthMonitor,
    reminders: ReminderScheduler,
    buzzer: TimedActuator,
    light: Light,
    indicator: StatusIndicator,
    publisher: TelemetryPublisher,
    auth_token: String,
    inbox: VecDeque<Vec<u8>>,
    clock_wait_logged: bool,
}

impl Device {
    pub fn new(config: DeviceConfig, boot_ms: u64) -> Self {
        Self {
            connectivity: ConnectivityManager::new(config.network, config.retry),
            sampler: SensorSampler::new(config.sampling, config.hardware),
            health: HealthMonitor::new(config.memory, boot_ms),
            reminders: ReminderScheduler::new(
                &config.reminders.times,
                config.reminders.window_minutes,
            ),
            buzzer: TimedActuator::new(config.reminders.buzz_duration_ms),
            light: Light::default(),
            indicator: StatusIndicator::default(),
            publisher: TelemetryPublisher::new(
                &config.telemetry.namespace,
                config.telemetry.publish_interval_ms,
            ),
            auth_token: config.telemetry.auth_token,
            inbox: VecDeque::with_capacity(COMMAND_QUEUE_CAPACITY),
            clock_wait_logged: false,
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.connectivity.state()
    }

    pub fn connectivity(&self) -> &ConnectivityManager {
        &self.connectivity
    }

    pub fn reminders(&self) -> &ReminderScheduler {
        &self.reminders
    }

    pub fn light_on(&self) -> bool {
        self.light.is_on()
    }

    /// Queues a raw command for the next tick. Returns `false` and drops the
    /// message when the queue is full.
    pub fn enqueue_command(&mut self, payload: Vec<u8>) -> bool {
        if self.inbox.len() >= COMMAND_QUEUE_CAPACITY {
            warn!(
                "command queue full ({COMMAND_QUEUE_CAPACITY}); dropping {} byte message",
                payload.len()
            );
            return false;
        }
        self.inbox.push_back(payload);
        true
    }

    pub fn reconfigure_network<L: LinkDriver>(
        &mut self,
        network: NetworkConfig,
        now_ms: u64,
        link: &mut L,
    ) -> Result<(), ConfigError> {
        self.connectivity.reconfigure(network, now_ms, link)
    }

    /// Keeps the link down until the portal supplies usable network settings.
    pub fn hold_config_fault(&mut self, err: ConfigError) {
        self.connectivity.hold_fault(err);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot::capture(
            &self.sampler.latest(),
            self.health.last(),
            self.connectivity.state(),
            self.connectivity.fault(),
            &self.reminders,
            self.light.is_on(),
        )
    }

    pub fn tick<L, S, M, T, P>(&mut self, now: Now, board: &mut Board<L, S, M, T, P>) -> TickReport
    where
        L: LinkDriver,
        S: SensorBus,
        M: MemoryProbe,
        T: Transport,
        P: OutputPin,
    {
        let mono = now.mono_ms;

        let link = self.connectivity.tick(mono, &mut board.link);
        self.sampler.sample(mono, &mut board.sensors);
        self.health.update(mono, &board.memory, self.sampler.faults());

        let mut reboot_requested = false;
        while let Some(payload) = self.inbox.pop_front() {
            match CommandMessage::parse(&payload, &self.auth_token) {
                Ok(command) => reboot_requested |= self.apply(command, now, board),
                Err(err) => warn!("rejected command: {err}"),
            }
        }

        let fired = self.run_reminders(now, &mut board.buzzer);

        self.indicator.update(link, mono, &mut board.status_led);

        let publish = self.publish(mono, board);

        TickReport {
            link: self.connectivity.state(),
            fired,
            publish,
            reboot_requested,
        }
    }

    /// Returns `true` when the command asks for a reboot.
    fn apply<L, S, M, T, P>(&mut self, command: Command, now: Now, board: &mut Board<L, S, M, T, P>) -> bool
    where
        P: OutputPin,
    {
        info!("applying command {}", command.name());

        match command {
            Command::Reboot => return true,
            Command::ToggleLight => {
                if let Err(err) = self.light.toggle(&mut board.light) {
                    warn!("failed to toggle light: {err}");
                }
            }
            Command::SetLight { on } => {
                if let Err(err) = self.light.set(on, &mut board.light) {
                    warn!("failed to set light: {err}");
                }
            }
            Command::SetReminder { times } => self.reminders.set_times(&times, now.local),
            Command::ClearReminders => self.reminders.set_times(&[], now.local),
            Command::PublishNow => self.publisher.force(),
        }
        false
    }

    fn run_reminders<P: OutputPin>(&mut self, now: Now, buzzer: &mut P) -> Vec<ReminderEvent> {
        if let Err(err) = self.buzzer.tick(now.mono_ms, buzzer) {
            warn!("failed to release buzzer: {err}");
        }

        let Some(local) = now.local else {
            if !self.clock_wait_logged {
                info!("wall clock not synced; reminders paused");
                self.clock_wait_logged = true;
            }
            return Vec::new();
        };
        self.clock_wait_logged = false;

        let mut events = self.reminders.check_due(local);
        for event in &mut events {
            match self.buzzer.trigger(now.mono_ms, buzzer) {
                Ok(()) => {
                    info!("reminder {} fired", event.scheduled);
                    event.fired_at = Some(local);
                    self.reminders.record_fired(event);
                }
                Err(err) => error!("reminder {} could not sound: {err}", event.scheduled),
            }
        }
        events
    }

    fn publish<L, S, M, T, P>(&mut self, mono: u64, board: &mut Board<L, S, M, T, P>) -> PublishOutcome
    where
        L: LinkDriver,
        T: Transport,
    {
        if !self.publisher.is_due(mono) {
            return PublishOutcome::NotDue;
        }

        let snapshot = self.snapshot();
        let outcome = self.publisher.publish(
            mono,
            &snapshot,
            self.connectivity.state(),
            &mut board.transport,
        );

        match &outcome {
            PublishOutcome::Sent => self.connectivity.report_publish_success(),
            PublishOutcome::Failed(_) => {
                self.connectivity.report_publish_failure(mono, &mut board.link)
            }
            PublishOutcome::NotDue | PublishOutcome::Skipped => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::TransportError,
        reminder::ReminderTime,
        testing::{test_network, FixedMemory, MockLink, RecordingPin, RecordingTransport, SteadySensors},
        types::LinkFault,
    };

    const TOKEN: &str = "s3cret-token";

    type TestBoard = Board<MockLink, SteadySensors, FixedMemory, RecordingTransport, RecordingPin>;

    fn config() -> DeviceConfig {
        let mut config = DeviceConfig::default();
        config.network = test_network();
        config.telemetry.auth_token = TOKEN.to_string();
        config.telemetry.publish_interval_ms = 10_000;
        config.reminders.times = vec![ReminderTime::new(8, 0).unwrap()];
        config.reminders.buzz_duration_ms = 3_000;
        config
    }

    fn board() -> TestBoard {
        Board {
            link: MockLink::reliable(),
            sensors: SteadySensors {
                temperature_c: 21.0,
                humidity_pct: 40.0,
                power_raw: 1241,
            },
            memory: FixedMemory(Some(50_000)),
            transport: RecordingTransport::default(),
            buzzer: RecordingPin::default(),
            light: RecordingPin::default(),
            status_led: RecordingPin::default(),
        }
    }

    fn local(hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3_600)
            .unwrap()
            .with_ymd_and_hms(2026, 5, 4, hour, minute, second)
            .unwrap()
    }

    fn mono(mono_ms: u64) -> Now {
        Now {
            mono_ms,
            local: None,
        }
    }

    fn command(kind: &str, payload: &str, token: &str) -> Vec<u8> {
        format!(r#"{{"type":"{kind}","payload":{payload},"authToken":"{token}"}}"#).into_bytes()
    }

    #[test]
    fn first_tick_connects_and_publishes() {
        let mut device = Device::new(config(), 0);
        let mut board = board();

        let report = device.tick(mono(0), &mut board);

        assert_eq!(report.link, LinkState::Connected);
        assert_eq!(report.publish, PublishOutcome::Sent);
        assert!(board.status_led.level);

        let (topic, payload) = &board.transport.sent[0];
        assert_eq!(topic, "smartpill/status");
        let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(body["linkState"], "CONNECTED");
        assert_eq!(body["temperature"], 21.5);
        assert_eq!(body["pendingReminders"], 1);

        assert_eq!(device.tick(mono(1_000), &mut board).publish, PublishOutcome::NotDue);
    }

    #[test]
    fn rejected_command_changes_nothing() {
        let mut device = Device::new(config(), 0);
        let mut board = board();
        device.tick(mono(0), &mut board);
        let before = device.snapshot();

        device.enqueue_command(command("TOGGLE_LIGHT", "{}", "wrong"));
        device.enqueue_command(command("CLEAR_REMINDERS", "{}", "wrong"));
        device.enqueue_command(command("REBOOT", "{}", "wrong"));
        device.enqueue_command(b"garbage".to_vec());
        let report = device.tick(mono(1_000), &mut board);

        assert!(!report.reboot_requested);
        assert!(board.light.writes.is_empty());
        assert_eq!(device.reminders().times().len(), 1);
        assert_eq!(device.snapshot().light_on, before.light_on);
        assert_eq!(report.publish, PublishOutcome::NotDue);
    }

    #[test]
    fn applies_authenticated_commands() {
        let mut device = Device::new(config(), 0);
        let mut board = board();
        device.tick(mono(0), &mut board);

        device.enqueue_command(command("TOGGLE_LIGHT", "{}", TOKEN));
        device.enqueue_command(command("SET_REMINDER", r#"{"times":["21:00","09:30"]}"#, TOKEN));
        device.enqueue_command(command("PUBLISH_NOW", "null", TOKEN));
        let report = device.tick(mono(1_000), &mut board);

        assert!(device.light_on());
        assert!(board.light.level);
        assert_eq!(
            device.reminders().times(),
            vec![ReminderTime::new(9, 30).unwrap(), ReminderTime::new(21, 0).unwrap()]
        );
        assert_eq!(report.publish, PublishOutcome::Sent);

        let body: serde_json::Value =
            serde_json::from_slice(&board.transport.sent[1].1).unwrap();
        assert_eq!(body["lightOn"], true);
        assert_eq!(body["pendingReminders"], 2);
    }

    #[test]
    fn reboot_is_reported_to_runtime() {
        let mut device = Device::new(config(), 0);
        let mut board = board();

        device.enqueue_command(command("REBOOT", "{}", TOKEN));

        assert!(device.tick(mono(0), &mut board).reboot_requested);
        assert!(!device.tick(mono(1_000), &mut board).reboot_requested);
    }

    #[test]
    fn command_queue_is_bounded() {
        let mut device = Device::new(config(), 0);

        for _ in 0..COMMAND_QUEUE_CAPACITY {
            assert!(device.enqueue_command(command("TOGGLE_LIGHT", "{}", TOKEN)));
        }
        assert!(!device.enqueue_command(command("REBOOT", "{}", TOKEN)));

        let mut board = board();
        let report = device.tick(mono(0), &mut board);
        assert!(!report.reboot_requested);
        assert_eq!(board.light.writes.len(), COMMAND_QUEUE_CAPACITY);
    }

    #[test]
    fn reminder_sounds_buzzer_for_bounded_time() {
        let mut device = Device::new(config(), 0);
        let mut board = board();

        let at = |mono_ms: u64, second: u32| Now {
            mono_ms,
            local: Some(local(8, 0, second)),
        };

        let report = device.tick(at(0, 10), &mut board);
        assert_eq!(report.fired.len(), 1);
        assert_eq!(report.fired[0].fired_at, Some(local(8, 0, 10)));
        assert!(board.buzzer.level);

        assert!(device.tick(at(1_000, 11), &mut board).fired.is_empty());
        device.tick(at(2_000, 12), &mut board);
        assert!(board.buzzer.level);
        device.tick(at(3_000, 13), &mut board);
        assert!(!board.buzzer.level);

        let snapshot = device.snapshot();
        assert_eq!(snapshot.last_reminder_fired, Some(local(8, 0, 10).timestamp()));
        assert_eq!(snapshot.pending_reminders, 0);
    }

    #[test]
    fn reminders_wait_for_wall_clock() {
        let mut device = Device::new(config(), 0);
        let mut board = board();

        let report = device.tick(mono(0), &mut board);

        assert!(report.fired.is_empty());
        assert!(board.buzzer.writes.is_empty());
        assert_eq!(device.reminders().pending_count(), 1);
    }

    #[test]
    fn repeated_publish_failures_force_reconnect() {
        let mut config = config();
        config.telemetry.publish_interval_ms = 1_000;
        let mut device = Device::new(config, 0);
        let mut board = board();
        board.transport.fail_with = Some(TransportError::Busy);

        let links: Vec<LinkState> = [0, 1_000, 2_000]
            .into_iter()
            .map(|now| device.tick(mono(now), &mut board).link)
            .collect();

        assert_eq!(
            links,
            vec![LinkState::Connected, LinkState::Connected, LinkState::Disconnected]
        );
        assert_eq!(board.link.disconnects, 1);

        board.transport.fail_with = None;
        let report = device.tick(mono(3_000), &mut board);
        assert_eq!(report.link, LinkState::Connected);
        assert_eq!(report.publish, PublishOutcome::Sent);
    }

    #[test]
    fn missing_credentials_park_the_link_and_keep_sampling() {
        let mut config = config();
        config.network.wifi_ssid = "CHANGE_ME".to_string();
        let mut device = Device::new(config, 0);
        let mut board = board();

        let report = device.tick(mono(0), &mut board);

        assert_eq!(report.link, LinkState::Disconnected);
        assert_eq!(report.publish, PublishOutcome::Skipped);
        assert_eq!(board.link.begin_calls, 0);
        assert_eq!(board.link.access_point_starts, 1);
        assert!(device.snapshot().link_fault.is_some());
        assert_eq!(device.snapshot().temperature, Some(21.5));
    }

    #[test]
    fn unreadable_network_settings_hold_the_link() {
        let loaded = DeviceConfig::from_stored(br#"{"network": [1, 2, 3]}"#);
        let mut device = Device::new(config(), 0);
        let mut board = board();
        device.hold_config_fault(loaded.network_fault().unwrap());

        let report = device.tick(mono(0), &mut board);

        assert_eq!(report.link, LinkState::Disconnected);
        assert_eq!(board.link.begin_calls, 0);
        match device.snapshot().link_fault {
            Some(LinkFault::Configuration(reason)) => {
                assert!(reason.starts_with("stored configuration unreadable: network: "))
            }
            other => panic!("unexpected fault {other:?}"),
        }

        device
            .reconfigure_network(test_network(), 1_000, &mut board.link)
            .unwrap();
        assert_eq!(device.tick(mono(1_000), &mut board).link, LinkState::Connected);
    }
}
