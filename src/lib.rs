//! Gateway between RS-485 power meters and an MQTT broker.
//!
//! Meters are polled over Modbus RTU, readings travel through a bounded queue
//! and are published over a mutually authenticated TLS session. A fresh device
//! obtains its certificate from the issuer on first boot.

pub mod models;
pub mod config;
pub mod network;
pub mod metering_modbus;
pub mod pipeline;
pub mod mqtt;
pub mod provisioning;
pub mod orchestrator;
pub mod system;
#[cfg(feature = "api")]
pub mod api;

// Re-export common types for easier access
pub use config::{Config, ConfigHandle, ConfigStore};
pub use models::{DeviceIdentity, MeterEndpoint, Reading};
pub use network::ConnectivityManager;
pub use metering_modbus::TelemetryReader;
pub use mqtt::SecureTelemetryPublisher;
pub use provisioning::ProvisioningManager;
pub use orchestrator::Orchestrator;
pub use system::{RestartHandle, RestartReason};
