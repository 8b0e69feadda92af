use std::ops::RangeInclusive;

use log::warn;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::ConfigError, reminder::ReminderTime, topics::DEFAULT_NAMESPACE};

const PLACEHOLDER_SSIDS: [&str; 2] = ["CHANGE_ME", "your_wifi_ssid"];
const MAX_SSID_LEN: usize = 32;
const MAX_PASSPHRASE_LEN: usize = 64;

/// GPIOs wired to ADC1. ADC2 is unusable while the radio is on.
pub const ADC1_PINS: RangeInclusive<i32> = 32..=39;

/// Name reported when the stored document as a whole could not be parsed.
pub const WHOLE_DOCUMENT: &str = "document";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && !PLACEHOLDER_SSIDS.contains(&ssid)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.has_station_credentials() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.wifi_ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::InvalidCredentials("wifi ssid too long"));
        }
        if self.wifi_pass.len() > MAX_PASSPHRASE_LEN {
            return Err(ConfigError::InvalidCredentials("wifi password too long"));
        }
        if !self.wifi_pass.is_empty() && self.wifi_pass.len() < 8 {
            return Err(ConfigError::InvalidCredentials(
                "wifi password shorter than 8 characters",
            ));
        }
        if self.mqtt_host.trim().is_empty() {
            return Err(ConfigError::InvalidBroker("mqtt host cannot be empty"));
        }
        if self.mqtt_port == 0 {
            return Err(ConfigError::InvalidBroker("mqtt port must be between 1 and 65535"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HardwareConfig {
    pub dht_pin: i32,
    pub power_pin: i32,
    pub buzzer_pin: i32,
    pub light_pin: i32,
    pub status_led_pin: i32,
    pub shunt_ohms: f32,
    pub vref_volts: f32,
    pub temp_offset_c: f32,
    pub humidity_offset_pct: f32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            dht_pin: 4,
            power_pin: 34,
            buzzer_pin: 15,
            light_pin: 2,
            status_led_pin: 5,
            shunt_ohms: 0.1,
            vref_volts: 3.3,
            temp_offset_c: 0.5,
            humidity_offset_pct: 2.0,
        }
    }
}

impl HardwareConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.shunt_ohms.is_finite() && self.shunt_ohms > 0.0) {
            return Err(ConfigError::InvalidHardware("shunt resistance must be positive"));
        }
        if !(self.vref_volts.is_finite() && self.vref_volts > 0.0) {
            return Err(ConfigError::InvalidHardware("reference voltage must be positive"));
        }
        let pins = [
            self.dht_pin,
            self.power_pin,
            self.buzzer_pin,
            self.light_pin,
            self.status_led_pin,
        ];
        if pins.iter().any(|pin| *pin < 0) {
            return Err(ConfigError::InvalidHardware("pin numbers must be >= 0"));
        }
        if !ADC1_PINS.contains(&self.power_pin) {
            return Err(ConfigError::InvalidHardware(
                "power pin must be an ADC1 input (gpio 32-39)",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature_interval_ms: u64,
    pub humidity_interval_ms: u64,
    pub power_interval_ms: u64,
    pub smoothing_window: usize,
    pub fault_threshold: u8,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature_interval_ms: 30_000,
            humidity_interval_ms: 60_000,
            power_interval_ms: 10_000,
            smoothing_window: 5,
            fault_threshold: 3,
        }
    }
}

impl SamplingConfig {
    pub fn sanitize(&mut self) {
        // DHT22 cannot be read faster than every two seconds.
        self.temperature_interval_ms = self.temperature_interval_ms.max(2_000);
        self.humidity_interval_ms = self.humidity_interval_ms.max(2_000);
        self.power_interval_ms = self.power_interval_ms.max(500);
        self.smoothing_window = self.smoothing_window.clamp(1, 16);
        self.fault_threshold = self.fault_threshold.max(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MemoryConfig {
    pub low_watermark_bytes: u64,
    pub high_watermark_bytes: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            low_watermark_bytes: 10_000,
            high_watermark_bytes: 16_000,
        }
    }
}

impl MemoryConfig {
    pub fn sanitize(&mut self) {
        if self.high_watermark_bytes < self.low_watermark_bytes {
            self.high_watermark_bytes = self.low_watermark_bytes;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
    pub jitter_ms: u64,
    pub max_consecutive_failures: u32,
    pub fallback_retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub publish_failure_threshold: u32,
    /// How long a link must stay up before earlier failures are forgiven.
    pub stable_link_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_ms: 1_000,
            max_consecutive_failures: 3,
            fallback_retry_interval_ms: 300_000,
            connect_timeout_ms: 15_000,
            publish_failure_threshold: 3,
            stable_link_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn sanitize(&mut self) {
        self.initial_backoff_ms = self.initial_backoff_ms.max(100);
        self.max_backoff_ms = self.max_backoff_ms.max(self.initial_backoff_ms);
        if !self.backoff_multiplier.is_finite() {
            self.backoff_multiplier = 2.0;
        }
        self.backoff_multiplier = self.backoff_multiplier.clamp(1.0, 10.0);
        self.max_consecutive_failures = self.max_consecutive_failures.max(1);
        self.fallback_retry_interval_ms = self.fallback_retry_interval_ms.max(self.max_backoff_ms);
        self.connect_timeout_ms = self.connect_timeout_ms.max(1_000);
        self.publish_failure_threshold = self.publish_failure_threshold.max(1);
        self.stable_link_ms = self.stable_link_ms.max(1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub namespace: String,
    pub client_id: String,
    pub publish_interval_ms: u64,
    /// Shared secret expected in every inbound command. Empty rejects all commands.
    pub auth_token: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            client_id: "smartpill-device".to_string(),
            publish_interval_ms: 10_000,
            auth_token: String::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.namespace.trim().trim_matches('/');
        self.namespace = if trimmed.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            trimmed.to_string()
        };
        self.publish_interval_ms = self.publish_interval_ms.max(1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReminderConfig {
    pub times: Vec<ReminderTime>,
    pub buzz_duration_ms: u64,
    pub window_minutes: u16,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            times: Vec::new(),
            buzz_duration_ms: 5_000,
            window_minutes: 1,
        }
    }
}

impl ReminderConfig {
    pub fn sanitize(&mut self) {
        self.buzz_duration_ms = self.buzz_duration_ms.clamp(100, 60_000);
        self.window_minutes = self.window_minutes.min(30);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub network: NetworkConfig,
    pub hardware: HardwareConfig,
    pub sampling: SamplingConfig,
    pub memory: MemoryConfig,
    pub retry: RetryConfig,
    pub telemetry: TelemetryConfig,
    pub reminders: ReminderConfig,
    pub timezone: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            hardware: HardwareConfig::default(),
            sampling: SamplingConfig::default(),
            memory: MemoryConfig::default(),
            retry: RetryConfig::default(),
            telemetry: TelemetryConfig::default(),
            reminders: ReminderConfig::default(),
            timezone: "Europe/London".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.sampling.sanitize();
        self.memory.sanitize();
        self.retry.sanitize();
        self.telemetry.sanitize();
        self.reminders.sanitize();
    }

    /// Hardware errors are fatal for the whole device. Network errors are not
    /// checked here; the link manager surfaces them as a persistent fault.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hardware.validate()
    }

    /// Reads a stored document one section at a time. A section that does not
    /// parse falls back to its defaults and is reported, without taking the
    /// other sections down with it.
    pub fn from_stored(raw: &[u8]) -> LoadedConfig {
        let mut loaded = LoadedConfig::default();
        let mut document = match serde_json::from_slice::<Map<String, Value>>(raw) {
            Ok(document) => document,
            Err(err) => {
                warn!("stored configuration is not a JSON object, using defaults: {err}");
                loaded.unreadable.push((WHOLE_DOCUMENT, err.to_string()));
                return loaded;
            }
        };

        let config = &mut loaded.config;
        let unreadable = &mut loaded.unreadable;
        read_section(&mut document, "network", &mut config.network, unreadable);
        read_section(&mut document, "hardware", &mut config.hardware, unreadable);
        read_section(&mut document, "sampling", &mut config.sampling, unreadable);
        read_section(&mut document, "memory", &mut config.memory, unreadable);
        read_section(&mut document, "retry", &mut config.retry, unreadable);
        read_section(&mut document, "telemetry", &mut config.telemetry, unreadable);
        read_section(&mut document, "reminders", &mut config.reminders, unreadable);
        read_section(&mut document, "timezone", &mut config.timezone, unreadable);
        loaded
    }
}

/// A stored configuration after lenient loading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedConfig {
    pub config: DeviceConfig,
    /// Sections that fell back to defaults, with the parse error.
    pub unreadable: Vec<(&'static str, String)>,
}

impl LoadedConfig {
    /// Unreadable network settings hold the link in a configuration fault
    /// naming the parse error, instead of the generic missing-credentials one.
    pub fn network_fault(&self) -> Option<ConfigError> {
        self.unreadable
            .iter()
            .find(|(section, _)| *section == "network" || *section == WHOLE_DOCUMENT)
            .map(|(section, reason)| ConfigError::Unreadable(format!("{section}: {reason}")))
    }
}

fn read_section<T: DeserializeOwned>(
    document: &mut Map<String, Value>,
    name: &'static str,
    slot: &mut T,
    unreadable: &mut Vec<(&'static str, String)>,
) {
    let Some(value) = document.remove(name) else {
        return;
    };
    match serde_json::from_value(value) {
        Ok(parsed) => *slot = parsed,
        Err(err) => {
            warn!("stored `{name}` settings unreadable, using defaults: {err}");
            unreadable.push((name, err.to_string()));
        }
    }
}

/// Rewrites the `network` section of a stored document and leaves every other
/// section's content as it was. A document that does not parse is refused so
/// an operator can still recover the rest of it.
pub fn replace_network_section(
    raw: Option<&[u8]>,
    network: &NetworkConfig,
) -> Result<Vec<u8>, ConfigError> {
    let mut document = match raw {
        Some(raw) => serde_json::from_slice::<Map<String, Value>>(raw)
            .map_err(|err| ConfigError::Unreadable(format!("{WHOLE_DOCUMENT}: {err}")))?,
        None => Map::new(),
    };
    let section =
        serde_json::to_value(network).map_err(|err| ConfigError::Unreadable(err.to_string()))?;
    document.insert("network".to_string(), section);
    serde_json::to_vec_pretty(&Value::Object(document))
        .map_err(|err| ConfigError::Unreadable(err.to_string()))
}
