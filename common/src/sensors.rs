use std::collections::VecDeque;

use log::{error, info, warn};

use crate::{
    config::{HardwareConfig, SamplingConfig},
    error::HardwareError,
    hal::SensorBus,
    types::{SensorFaults, SensorKind, SensorReading, SensorSet},
};

pub const ADC_FULL_SCALE: u16 = 4095;

const TEMPERATURE_RANGE_C: (f32, f32) = (-40.0, 80.0);
const HUMIDITY_RANGE_PCT: (f32, f32) = (0.0, 100.0);

/// Power drawn through the shunt for a raw ADC sample.
///
/// The sample is scaled to volts against `vref_volts`, turned into current
/// through `shunt_ohms`, and multiplied by the supply voltage (`vref_volts`).
pub fn power_watts(raw: u16, shunt_ohms: f32, vref_volts: f32) -> f32 {
    let voltage = f32::from(raw) * vref_volts / f32::from(ADC_FULL_SCALE);
    let current = voltage / shunt_ohms;
    current * vref_volts
}

#[derive(Debug, Default)]
struct Channel {
    last_read_ms: Option<u64>,
    consecutive_invalid: u8,
    faulted: bool,
    window: VecDeque<f32>,
}

impl Channel {
    fn smooth(&mut self, value: f32, capacity: usize) -> f32 {
        if self.window.len() >= capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }
}

/// Reads each sensor kind on its own cadence and tracks persistent faults.
#[derive(Debug)]
pub struct SensorSampler {
    config: SamplingConfig,
    hardware: HardwareConfig,
    channels: [Channel; 3],
    latest: SensorSet,
}

impl SensorSampler {
    pub fn new(config: SamplingConfig, hardware: HardwareConfig) -> Self {
        Self {
            config,
            hardware,
            channels: Default::default(),
            latest: SensorSet::default(),
        }
    }

    pub fn latest(&self) -> SensorSet {
        self.latest
    }

    pub fn faults(&self) -> SensorFaults {
        let mut faults = SensorFaults::default();
        for kind in SensorKind::ALL {
            faults.set(kind, self.channels[kind.index()].faulted);
        }
        faults
    }

    pub fn sample<B: SensorBus>(&mut self, now_ms: u64, bus: &mut B) -> SensorSet {
        for kind in SensorKind::ALL {
            if self.is_due(kind, now_ms) {
                let reading = self.read(kind, now_ms, bus);
                self.record(reading);
            }
        }
        self.latest
    }

    fn interval_ms(&self, kind: SensorKind) -> u64 {
        match kind {
            SensorKind::Temperature => self.config.temperature_interval_ms,
            SensorKind::Humidity => self.config.humidity_interval_ms,
            SensorKind::PowerDraw => self.config.power_interval_ms,
        }
    }

    fn is_due(&self, kind: SensorKind, now_ms: u64) -> bool {
        self.channels[kind.index()]
            .last_read_ms
            .map(|last| now_ms.saturating_sub(last) >= self.interval_ms(kind))
            .unwrap_or(true)
    }

    fn read<B: SensorBus>(&mut self, kind: SensorKind, now_ms: u64, bus: &mut B) -> SensorReading {
        self.channels[kind.index()].last_read_ms = Some(now_ms);

        let measured = match kind {
            SensorKind::Temperature => bus
                .read_temperature_c()
                .map(|celsius| celsius + self.hardware.temp_offset_c)
                .and_then(|celsius| within(celsius, TEMPERATURE_RANGE_C)),
            SensorKind::Humidity => bus
                .read_humidity_pct()
                .map(|pct| pct + self.hardware.humidity_offset_pct)
                .and_then(|pct| within(pct, HUMIDITY_RANGE_PCT)),
            SensorKind::PowerDraw => bus.read_power_raw().and_then(|raw| {
                if raw > ADC_FULL_SCALE {
                    return Err(HardwareError::OutOfRange);
                }
                let watts = power_watts(raw, self.hardware.shunt_ohms, self.hardware.vref_volts);
                if watts.is_finite() && watts >= 0.0 {
                    Ok(watts)
                } else {
                    Err(HardwareError::OutOfRange)
                }
            }),
        };

        match measured {
            Ok(value) => {
                let value = match kind {
                    SensorKind::PowerDraw => value,
                    _ => self.channels[kind.index()].smooth(value, self.config.smoothing_window),
                };
                SensorReading::valid(kind, value, now_ms)
            }
            Err(err) => {
                warn!("{} read invalid: {err}", kind.as_str());
                SensorReading::invalid(kind, now_ms)
            }
        }
    }

    fn record(&mut self, reading: SensorReading) {
        let threshold = self.config.fault_threshold;
        let channel = &mut self.channels[reading.kind.index()];

        if reading.valid {
            channel.consecutive_invalid = 0;
            if channel.faulted {
                info!("{} sensor recovered", reading.kind.as_str());
                channel.faulted = false;
            }
        } else {
            channel.consecutive_invalid = channel.consecutive_invalid.saturating_add(1);
            if channel.consecutive_invalid >= threshold && !channel.faulted {
                error!(
                    "{} sensor faulted after {} consecutive invalid readings",
                    reading.kind.as_str(),
                    channel.consecutive_invalid
                );
                channel.faulted = true;
                channel.window.clear();
            }
        }

        self.latest.set(reading);
    }
}

fn within(value: f32, (min, max): (f32, f32)) -> Result<f32, HardwareError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(HardwareError::OutOfRange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockSensors, SteadySensors};

    fn no_offsets() -> HardwareConfig {
        HardwareConfig {
            temp_offset_c: 0.0,
            humidity_offset_pct: 0.0,
            ..HardwareConfig::default()
        }
    }

    fn sampler() -> SensorSampler {
        SensorSampler::new(
            SamplingConfig {
                smoothing_window: 1,
                ..SamplingConfig::default()
            },
            no_offsets(),
        )
    }

    fn approx(actual: f32, expected: f32) -> bool {
        (actual - expected).abs() < 0.01
    }

    #[test]
    fn power_conversion_matches_known_values() {
        assert!(approx(power_watts(0, 0.1, 3.3), 0.0));
        assert!(approx(power_watts(4095, 0.1, 3.3), 108.9));
        assert!(approx(power_watts(1241, 0.1, 3.3), 33.0024));
        assert!(approx(power_watts(2048, 0.5, 5.0), 25.006));
    }

    #[test]
    fn power_conversion_is_deterministic() {
        for raw in [0_u16, 1, 512, 2048, 4095] {
            assert_eq!(
                power_watts(raw, 0.22, 3.3).to_bits(),
                power_watts(raw, 0.22, 3.3).to_bits()
            );
        }
    }

    #[test]
    fn rereads_only_when_interval_elapsed() {
        let mut bus = MockSensors::default();
        bus.temperature.extend([Ok(21.0), Ok(22.0)]);
        bus.humidity.extend([Ok(40.0)]);
        bus.power.extend([Ok(100), Ok(200)]);
        let mut sampler = sampler();

        let first = sampler.sample(0, &mut bus);
        let cached = sampler.sample(5_000, &mut bus);
        assert_eq!(first, cached);
        assert_eq!(
            (bus.temperature_reads, bus.humidity_reads, bus.power_reads),
            (1, 1, 1)
        );

        sampler.sample(10_000, &mut bus);
        assert_eq!(bus.power_reads, 2);
        assert_eq!(bus.temperature_reads, 1);

        let later = sampler.sample(30_000, &mut bus);
        assert_eq!(bus.temperature_reads, 2);
        assert_eq!(later.temperature.unwrap().value, 22.0);
        assert_eq!(later.humidity.unwrap().timestamp_ms, 0);
    }

    #[test]
    fn out_of_range_reading_is_flagged_not_dropped() {
        let mut bus = MockSensors::default();
        bus.temperature.push_back(Ok(120.0));
        bus.humidity.push_back(Ok(-3.0));
        bus.power.push_back(Ok(5_000));
        let mut sampler = sampler();

        let set = sampler.sample(0, &mut bus);

        for kind in SensorKind::ALL {
            let reading = set.get(kind).unwrap();
            assert!(!reading.valid, "{kind:?} should be invalid");
            assert_eq!(reading.usable_value(), None);
        }
    }

    #[test]
    fn three_invalid_readings_fault_and_one_valid_clears() {
        let mut bus = MockSensors::default();
        bus.temperature
            .extend([Err(HardwareError::Timeout), Ok(500.0), Err(HardwareError::Timeout)]);
        bus.temperature.push_back(Ok(20.0));
        let mut sampler = sampler();
        let interval = SamplingConfig::default().temperature_interval_ms;

        sampler.sample(0, &mut bus);
        sampler.sample(interval, &mut bus);
        assert!(!sampler.faults().is_faulted(SensorKind::Temperature));

        sampler.sample(interval * 2, &mut bus);
        assert!(sampler.faults().is_faulted(SensorKind::Temperature));

        let set = sampler.sample(interval * 3, &mut bus);
        assert!(!sampler.faults().is_faulted(SensorKind::Temperature));
        assert_eq!(set.temperature.unwrap().usable_value(), Some(20.0));
    }

    #[test]
    fn faulted_sensor_keeps_normal_cadence() {
        let mut bus = MockSensors::default();
        let mut sampler = sampler();
        let interval = SamplingConfig::default().temperature_interval_ms;

        for step in 0..3 {
            sampler.sample(step * interval, &mut bus);
        }
        assert!(sampler.faults().is_faulted(SensorKind::Temperature));

        for now in (interval * 2 + 1_000..interval * 3).step_by(1_000) {
            sampler.sample(now, &mut bus);
        }
        assert_eq!(bus.temperature_reads, 3);
    }

    #[test]
    fn applies_calibration_and_smoothing() {
        let mut bus = MockSensors::default();
        bus.temperature.extend([Ok(20.0), Ok(22.0), Ok(24.0)]);
        bus.humidity.extend([Ok(40.0), Ok(40.0), Ok(40.0)]);
        bus.power.extend([Ok(0), Ok(0), Ok(0)]);
        let config = SamplingConfig {
            temperature_interval_ms: 2_000,
            humidity_interval_ms: 2_000,
            power_interval_ms: 2_000,
            smoothing_window: 2,
            fault_threshold: 3,
        };
        let mut sampler = SensorSampler::new(config, HardwareConfig::default());

        sampler.sample(0, &mut bus);
        sampler.sample(2_000, &mut bus);
        let set = sampler.sample(4_000, &mut bus);

        // (22.5 + 24.5) / 2 with the +0.5 °C offset.
        assert!(approx(set.temperature.unwrap().value, 23.5));
        assert!(approx(set.humidity.unwrap().value, 42.0));
    }

    #[test]
    fn steady_bus_produces_valid_set() {
        let mut bus = SteadySensors {
            temperature_c: 21.5,
            humidity_pct: 45.0,
            power_raw: 1241,
        };
        let mut sampler = sampler();

        let set = sampler.sample(0, &mut bus);

        assert_eq!(set.temperature.unwrap().usable_value(), Some(21.5));
        assert_eq!(set.humidity.unwrap().usable_value(), Some(45.0));
        assert!(approx(set.power.unwrap().value, 33.0024));
        assert!(!sampler.faults().any());
    }
}
