use std::collections::VecDeque;

use crate::{
    config::NetworkConfig,
    error::{HardwareError, LinkError, TransportError},
    hal::{LinkDriver, MemoryProbe, OutputPin, SensorBus, Transport},
};

pub fn test_network() -> NetworkConfig {
    NetworkConfig {
        wifi_ssid: "home".to_string(),
        wifi_pass: "correct-horse".to_string(),
        ..NetworkConfig::default()
    }
}

/// Scripted link. Each `begin_connect` pops the next scripted result (`Ok`
/// when the script is empty); an accepted attempt brings the link up only
/// when `up_on_accept` is set.
#[derive(Debug, Default)]
pub struct MockLink {
    pub begin_results: VecDeque<Result<(), LinkError>>,
    pub up_on_accept: bool,
    pub up: bool,
    pub begin_calls: u32,
    pub disconnects: u32,
    pub access_point_starts: u32,
}

impl MockLink {
    pub fn reliable() -> Self {
        Self {
            up_on_accept: true,
            ..Self::default()
        }
    }

    pub fn failing(times: usize) -> Self {
        let mut link = Self::reliable();
        for _ in 0..times {
            link.begin_results.push_back(Err(LinkError::Transport(
                TransportError::Unreachable("no beacon".to_string()),
            )));
        }
        link
    }
}

impl LinkDriver for MockLink {
    fn begin_connect(&mut self, _network: &NetworkConfig) -> Result<(), LinkError> {
        self.begin_calls += 1;
        let result = self.begin_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() && self.up_on_accept {
            self.up = true;
        }
        result
    }

    fn poll_connected(&mut self) -> Result<bool, TransportError> {
        Ok(self.up)
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.up = false;
    }

    fn start_access_point(&mut self) -> Result<(), TransportError> {
        self.access_point_starts += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockSensors {
    pub temperature: VecDeque<Result<f32, HardwareError>>,
    pub humidity: VecDeque<Result<f32, HardwareError>>,
    pub power: VecDeque<Result<u16, HardwareError>>,
    pub temperature_reads: u32,
    pub humidity_reads: u32,
    pub power_reads: u32,
}

impl SensorBus for MockSensors {
    fn read_temperature_c(&mut self) -> Result<f32, HardwareError> {
        self.temperature_reads += 1;
        self.temperature
            .pop_front()
            .unwrap_or(Err(HardwareError::Timeout))
    }

    fn read_humidity_pct(&mut self) -> Result<f32, HardwareError> {
        self.humidity_reads += 1;
        self.humidity.pop_front().unwrap_or(Err(HardwareError::Timeout))
    }

    fn read_power_raw(&mut self) -> Result<u16, HardwareError> {
        self.power_reads += 1;
        self.power.pop_front().unwrap_or(Err(HardwareError::Timeout))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SteadySensors {
    pub temperature_c: f32,
    pub humidity_pct: f32,
    pub power_raw: u16,
}

impl SensorBus for SteadySensors {
    fn read_temperature_c(&mut self) -> Result<f32, HardwareError> {
        Ok(self.temperature_c)
    }

    fn read_humidity_pct(&mut self) -> Result<f32, HardwareError> {
        Ok(self.humidity_pct)
    }

    fn read_power_raw(&mut self) -> Result<u16, HardwareError> {
        Ok(self.power_raw)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedMemory(pub Option<u64>);

impl MemoryProbe for FixedMemory {
    fn free_bytes(&self) -> Option<u64> {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct RecordingPin {
    pub level: bool,
    pub writes: Vec<bool>,
}

impl OutputPin for RecordingPin {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        self.level = on;
        self.writes.push(on);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub sent: Vec<(String, Vec<u8>)>,
    pub fail_with: Option<TransportError>,
}

impl Transport for RecordingTransport {
    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _retain: bool,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.fail_with.clone() {
            return Err(err);
        }
        self.sent.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}
