use serde::{Deserialize, Serialize};
use std::fmt;

/// A meter on the RS-485 bus as configured by the user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(from = "RawMeterEndpoint")]
pub struct MeterEndpoint {
    pub id: u32,
    pub channel_index: u32,
    pub modbus_id: u8,
    pub name: String,
}

/* Older configuration documents have no channel_index, the id was used as channel then */
#[derive(Deserialize)]
struct RawMeterEndpoint {
    #[serde(default)]
    id: u32,
    channel_index: Option<u32>,
    #[serde(default)]
    modbus_id: u8,
    #[serde(default)]
    name: String,
}

impl From<RawMeterEndpoint> for MeterEndpoint {
    fn from(raw: RawMeterEndpoint) -> Self {
        return MeterEndpoint {
            id: raw.id,
            channel_index: raw.channel_index.unwrap_or(raw.id),
            modbus_id: raw.modbus_id,
            name: raw.name,
        };
    }
}

/// One decoded sample of a meter, this is what travels through the reading queue
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub channel: u32,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub total_kwh: f64,
}

/// Stable identifier of this gateway, derived from the hardware address.
///
/// Used as MQTT client id, as topic namespace and as certificate common name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// The address bytes are read as the little endian efuse word and printed as
    /// `%04X%08X`, so the ids match gateways that are already registered upstream.
    pub fn from_hardware_address(mac: [u8; 6]) -> Self {
        let mut word: u64 = 0;
        for (i, b) in mac.iter().enumerate() {
            word |= (*b as u64) << (8 * i);
        }

        let high = ((word >> 32) & 0xFFFF) as u32;
        let low = (word & 0xFFFF_FFFF) as u32;
        return DeviceIdentity(format!("{:04X}{:08X}", high, low));
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        DeviceIdentity(s.to_string())
    }
}
