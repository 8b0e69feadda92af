pub mod actuator;
pub mod backoff;
pub mod command;
pub mod config;
pub mod connectivity;
pub mod device;
pub mod error;
pub mod hal;
pub mod health;
pub mod reminder;
pub mod sensors;
pub mod telemetry;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use command::{Command, CommandMessage, MAX_COMMAND_BYTES};
pub use config::{
    replace_network_section, DeviceConfig, HardwareConfig, LoadedConfig, MemoryConfig,
    NetworkConfig, ReminderConfig, RetryConfig, SamplingConfig, TelemetryConfig,
};
pub use connectivity::ConnectivityManager;
pub use device::{Board, Device, Now, TickReport, COMMAND_QUEUE_CAPACITY};
pub use error::{CommandError, ConfigError, HardwareError, LinkError, TransportError};
pub use hal::{LinkDriver, MemoryProbe, OutputPin, SensorBus, Transport};
pub use reminder::{ReminderEvent, ReminderScheduler, ReminderTime};
pub use telemetry::{PublishOutcome, TelemetryPublisher, TelemetrySnapshot};
pub use topics::*;
pub use types::{DeviceHealth, LinkFault, LinkState, SensorKind, SensorReading};
