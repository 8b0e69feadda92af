//! Seams between the control loop and the platform.
//!
//! Every call here must return promptly: implementations either start work and
//! report progress on a later poll, or give up after their own short timeout.

use crate::{
    config::NetworkConfig,
    error::{HardwareError, LinkError, TransportError},
};

pub trait LinkDriver {
    /// Starts a station connection attempt without waiting for it to finish.
    fn begin_connect(&mut self, network: &NetworkConfig) -> Result<(), LinkError>;

    /// `Ok(true)` once the link carries traffic.
    fn poll_connected(&mut self) -> Result<bool, TransportError>;

    fn disconnect(&mut self);

    /// Brings up the local access point used for on-site configuration.
    fn start_access_point(&mut self) -> Result<(), TransportError>;
}

pub trait SensorBus {
    fn read_temperature_c(&mut self) -> Result<f32, HardwareError>;
    fn read_humidity_pct(&mut self) -> Result<f32, HardwareError>;
    /// Raw 12-bit sample from the shunt amplifier.
    fn read_power_raw(&mut self) -> Result<u16, HardwareError>;
}

pub trait MemoryProbe {
    fn free_bytes(&self) -> Option<u64>;
}

pub trait OutputPin {
    fn set(&mut self, on: bool) -> Result<(), HardwareError>;
}

pub trait Transport {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
        -> Result<(), TransportError>;
}
