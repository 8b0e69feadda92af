use log::{debug, warn};
use serde::Serialize;

use crate::{
    error::TransportError,
    hal::Transport,
    reminder::ReminderScheduler,
    topics,
    types::{DeviceHealth, LinkFault, LinkState, SensorKind, SensorSet},
};

/// Status document sent to the desktop collaborator. Built fresh for every
/// publish cycle and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    #[serde(rename = "powerWatts")]
    pub power_watts: Option<f32>,
    #[serde(rename = "linkState")]
    pub link_state: LinkState,
    #[serde(rename = "uptimeSeconds")]
    pub uptime_seconds: u64,
    #[serde(rename = "freeMemoryBytes")]
    pub free_memory_bytes: Option<u64>,
    #[serde(rename = "lowMemoryWarning")]
    pub low_memory_warning: bool,
    /// Epoch seconds of the last reminder that actually sounded.
    #[serde(rename = "lastReminderFired")]
    pub last_reminder_fired: Option<i64>,
    #[serde(rename = "linkFault")]
    pub link_fault: Option<LinkFault>,
    #[serde(rename = "sensorFaults")]
    pub sensor_faults: Vec<SensorKind>,
    #[serde(rename = "lightOn")]
    pub light_on: bool,
    #[serde(rename = "pendingReminders")]
    pub pending_reminders: usize,
}

impl TelemetrySnapshot {
    pub fn capture(
        sensors: &SensorSet,
        health: &DeviceHealth,
        link_state: LinkState,
        link_fault: Option<&LinkFault>,
        reminders: &ReminderScheduler,
        light_on: bool,
    ) -> Self {
        let value = |kind| sensors.get(kind).and_then(|reading| reading.usable_value());

        Self {
            temperature: value(SensorKind::Temperature),
            humidity: value(SensorKind::Humidity),
            power_watts: value(SensorKind::PowerDraw),
            link_state,
            uptime_seconds: health.uptime_seconds,
            free_memory_bytes: health.free_memory_bytes,
            low_memory_warning: health.low_memory_warning,
            last_reminder_fired: reminders.last_fired().map(|at| at.timestamp()),
            link_fault: link_fault.cloned(),
            sensor_faults: health.sensor_faults.kinds(),
            light_on,
            pending_reminders: reminders.pending_count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    NotDue,
    /// Link was down; the snapshot was dropped.
    Skipped,
    Sent,
    Failed(TransportError),
}

#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    topic: String,
    interval_ms: u64,
    next_due_ms: Option<u64>,
}

impl TelemetryPublisher {
    pub fn new(namespace: &str, interval_ms: u64) -> Self {
        Self {
            topic: topics::status_topic(namespace),
            interval_ms,
            next_due_ms: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_due_ms.map(|due| now_ms >= due).unwrap_or(true)
    }

    /// Makes the next `publish` call due regardless of the interval.
    pub fn force(&mut self) {
        self.next_due_ms = None;
    }

    /// At most one attempt per call. Nothing is queued or retried here: a
    /// skipped or failed snapshot is superseded by the next cycle's.
    pub fn publish<T: Transport>(
        &mut self,
        now_ms: u64,
        snapshot: &TelemetrySnapshot,
        link: LinkState,
        transport: &mut T,
    ) -> PublishOutcome {
        if !self.is_due(now_ms) {
            return PublishOutcome::NotDue;
        }
        self.next_due_ms = Some(now_ms.saturating_add(self.interval_ms));

        if link != LinkState::Connected {
            debug!("link {}; dropping telemetry snapshot", link.as_str());
            return PublishOutcome::Skipped;
        }

        let payload = match serde_json::to_vec(snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode telemetry snapshot: {err}");
                return PublishOutcome::Failed(TransportError::Rejected(err.to_string()));
            }
        };

        match transport.publish(&self.topic, &payload, false) {
            Ok(()) => PublishOutcome::Sent,
            Err(err) => {
                warn!("telemetry publish failed: {err}");
                PublishOutcome::Failed(err)
            }
        }
    }
}
