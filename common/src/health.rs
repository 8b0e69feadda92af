use log::{info, warn};

use crate::{
    config::MemoryConfig,
    hal::MemoryProbe,
    types::{DeviceHealth, SensorFaults},
};

/// Advisory health tracking. Never fails: an unknown memory reading leaves
/// the warning where it was.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: MemoryConfig,
    boot_ms: u64,
    low_memory_warning: bool,
    last: DeviceHealth,
}

impl HealthMonitor {
    /// `boot_ms` is the monotonic timestamp captured once at startup.
    pub fn new(config: MemoryConfig, boot_ms: u64) -> Self {
        Self {
            config,
            boot_ms,
            low_memory_warning: false,
            last: DeviceHealth::default(),
        }
    }

    pub fn last(&self) -> &DeviceHealth {
        &self.last
    }

    pub fn update<M: MemoryProbe>(
        &mut self,
        now_ms: u64,
        memory: &M,
        sensor_faults: SensorFaults,
    ) -> DeviceHealth {
        let free_memory_bytes = memory.free_bytes();

        if let Some(free) = free_memory_bytes {
            if !self.low_memory_warning && free < self.config.low_watermark_bytes {
                warn!(
                    "low memory: {free} bytes free (below {} byte floor)",
                    self.config.low_watermark_bytes
                );
                self.low_memory_warning = true;
            } else if self.low_memory_warning && free > self.config.high_watermark_bytes {
                info!("memory recovered: {free} bytes free");
                self.low_memory_warning = false;
            }
        }

        self.last = DeviceHealth {
            uptime_seconds: now_ms.saturating_sub(self.boot_ms) / 1_000,
            free_memory_bytes,
            low_memory_warning: self.low_memory_warning,
            sensor_faults,
        };
        self.last.clone()
    }
}
