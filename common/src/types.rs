use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    FallbackMode,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::FallbackMode => "FALLBACK_MODE",
        }
    }
}

/// Persistent connectivity fault that needs an operator to fix the
/// configuration before the link manager tries again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkFault {
    Configuration(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorKind {
    Temperature,
    Humidity,
    PowerDraw,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [Self::Temperature, Self::Humidity, Self::PowerDraw];

    pub fn index(self) -> usize {
        match self {
            Self::Temperature => 0,
            Self::Humidity => 1,
            Self::PowerDraw => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "TEMPERATURE",
            Self::Humidity => "HUMIDITY",
            Self::PowerDraw => "POWER_DRAW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub value: f32,
    pub timestamp_ms: u64,
    pub valid: bool,
}

impl SensorReading {
    pub fn valid(kind: SensorKind, value: f32, timestamp_ms: u64) -> Self {
        Self {
            kind,
            value,
            timestamp_ms,
            valid: true,
        }
    }

    pub fn invalid(kind: SensorKind, timestamp_ms: u64) -> Self {
        Self {
            kind,
            value: f32::NAN,
            timestamp_ms,
            valid: false,
        }
    }

    /// Value usable for telemetry; invalid readings never leave the device as data.
    pub fn usable_value(&self) -> Option<f32> {
        (self.valid && self.value.is_finite()).then_some(self.value)
    }
}

/// Latest reading per sensor kind. `None` until the kind has been read once.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSet {
    pub temperature: Option<SensorReading>,
    pub humidity: Option<SensorReading>,
    pub power: Option<SensorReading>,
}

impl SensorSet {
    pub fn get(&self, kind: SensorKind) -> Option<SensorReading> {
        match kind {
            SensorKind::Temperature => self.temperature,
            SensorKind::Humidity => self.humidity,
            SensorKind::PowerDraw => self.power,
        }
    }

    pub fn set(&mut self, reading: SensorReading) {
        match reading.kind {
            SensorKind::Temperature => self.temperature = Some(reading),
            SensorKind::Humidity => self.humidity = Some(reading),
            SensorKind::PowerDraw => self.power = Some(reading),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorFaults {
    flags: [bool; 3],
}

impl SensorFaults {
    pub fn is_faulted(&self, kind: SensorKind) -> bool {
        self.flags[kind.index()]
    }

    pub fn set(&mut self, kind: SensorKind, faulted: bool) {
        self.flags[kind.index()] = faulted;
    }

    pub fn any(&self) -> bool {
        self.flags.iter().any(|flag| *flag)
    }

    pub fn kinds(&self) -> Vec<SensorKind> {
        SensorKind::ALL
            .into_iter()
            .filter(|kind| self.is_faulted(*kind))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceHealth {
    pub uptime_seconds: u64,
    /// `None` when the platform could not report free memory.
    pub free_memory_bytes: Option<u64>,
    pub low_memory_warning: bool,
    pub sensor_faults: SensorFaults,
}
