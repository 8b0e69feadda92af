//! Host stand-ins for the board drivers.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use rumqttc::{AsyncClient, ClientError, QoS};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use pillbox_common::{
    HardwareError, LinkDriver, LinkError, MemoryProbe, NetworkConfig, OutputPin, SensorBus,
    Transport, TransportError,
};

/// Treats the broker session as the link. The MQTT event loop only dials the
/// broker after `begin_connect` asks it to, so the link manager's backoff and
/// forced reconnects decide when a new session is attempted.
pub struct BrokerLink {
    client: AsyncClient,
    broker_up: Arc<AtomicBool>,
    connect_requests: Arc<Notify>,
}

impl BrokerLink {
    pub fn new(client: AsyncClient, broker_up: Arc<AtomicBool>, connect_requests: Arc<Notify>) -> Self {
        Self {
            client,
            broker_up,
            connect_requests,
        }
    }
}

impl LinkDriver for BrokerLink {
    fn begin_connect(&mut self, network: &NetworkConfig) -> Result<(), LinkError> {
        debug!(
            "requesting broker session at {}:{}",
            network.mqtt_host, network.mqtt_port
        );
        self.connect_requests.notify_one();
        Ok(())
    }

    fn poll_connected(&mut self) -> Result<bool, TransportError> {
        Ok(self.broker_up.load(Ordering::Relaxed))
    }

    fn disconnect(&mut self) {
        info!("link reset requested; closing broker session");
        self.broker_up.store(false, Ordering::Relaxed);
        if let Err(err) = self.client.try_disconnect() {
            debug!("mqtt disconnect not queued: {err}");
        }
    }

    fn start_access_point(&mut self) -> Result<(), TransportError> {
        info!("fallback mode: local portal stays reachable on the host listener");
        Ok(())
    }
}

/// Slowly drifting readings so dashboards show movement.
#[derive(Debug, Default)]
pub struct SimulatedSensors {
    reads: u32,
}

impl SimulatedSensors {
    fn step(&mut self) -> f32 {
        self.reads = self.reads.wrapping_add(1);
        (self.reads % 12) as f32
    }
}

impl SensorBus for SimulatedSensors {
    fn read_temperature_c(&mut self) -> Result<f32, HardwareError> {
        Ok(20.5 + self.step() * 0.1)
    }

    fn read_humidity_pct(&mut self) -> Result<f32, HardwareError> {
        Ok(43.0 + self.step() * 0.25)
    }

    fn read_power_raw(&mut self) -> Result<u16, HardwareError> {
        Ok(180 + self.step() as u16 * 4)
    }
}

/// `MemAvailable` from `/proc/meminfo`.
#[derive(Debug, Default)]
pub struct ProcMemory;

impl MemoryProbe for ProcMemory {
    fn free_bytes(&self) -> Option<u64> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_mem_available(&meminfo)
    }
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kib = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kib.saturating_mul(1024))
}

/// Pin that only logs its level changes.
#[derive(Debug)]
pub struct LoggedPin {
    name: &'static str,
    level: Option<bool>,
}

impl LoggedPin {
    pub fn new(name: &'static str) -> Self {
        Self { name, level: None }
    }
}

impl OutputPin for LoggedPin {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        if self.level != Some(on) {
            info!("{} -> {}", self.name, if on { "on" } else { "off" });
            self.level = Some(on);
        }
        Ok(())
    }
}

pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl Transport for MqttTransport {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|err| match err {
                ClientError::TryRequest(_) => TransportError::Busy,
                other => {
                    warn!("mqtt client rejected publish: {other}");
                    TransportError::Rejected(other.to_string())
                }
            })
    }
}
