use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// Externally visible state of one device link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Transport open and the device answered recently
    Present,
    /// Transport open but the device stopped answering
    Missing,
    /// No transport
    Closed,
}

/// Non-fatal error conditions reported through the event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The serial port could not be opened or configured
    OpenPort,
    /// A partial inbound frame was never completed
    DataTimeout,
    /// A partial or garbled acknowledgment arrived before the response timeout
    ResponseTimeout,
    /// Nothing at all came back before the response timeout
    DeviceSilent,
    /// Checksum or length mismatch on an inbound frame or acknowledgment
    WrongPacket,
}

/// Informational packets announced by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfoCode {
    /// The device performed a full reset
    Reset,
    /// The device accepted a clock update
    ClockSet,
    /// The device powered on
    DeviceOn,
    /// The device saw a reception error on its RS line
    RsReceiveError,
}

/// Serial line settings
///
/// Data bits, parity, stop bits and flow control are fixed by the device
/// (8N1, no flow control); only the speed and the read poll are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Line speed
    pub baud_rate: u32,
    /// How long a blocking read waits before the reader checks for shutdown
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub read_poll: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            baud_rate: super::DEFAULT_BAUD_RATE,
            read_poll: Duration::from_millis(50),
        }
    }
}

/// Timing and retry configuration for one protocol engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Transmissions per outgoing command before it is given up
    pub attempts: u32,
    /// How long a partial frame may wait for the rest of its bytes
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub assembly_timeout: Duration,
    /// How long to wait for an acknowledgment
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub response_timeout: Duration,
    /// Period of the outgoing queue check
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub dispatch_interval: Duration,
    /// Period of the automatic clock update
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub clock_sync_interval: Duration,
    /// Serial line settings
    #[serde(default)]
    pub serial: SerialSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            attempts: super::DEFAULT_ATTEMPTS,
            assembly_timeout: Duration::from_millis(250),
            response_timeout: Duration::from_millis(1500),
            dispatch_interval: Duration::from_millis(200),
            clock_sync_interval: Duration::from_secs(60),
            serial: SerialSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Checks that every setting can drive the state machine
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(Error::config("attempts must be at least 1"));
        }
        let durations = [
            ("assembly_timeout", self.assembly_timeout),
            ("response_timeout", self.response_timeout),
            ("dispatch_interval", self.dispatch_interval),
            ("clock_sync_interval", self.clock_sync_interval),
            ("serial.read_poll", self.serial.read_poll),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }
        if self.serial.baud_rate == 0 {
            return Err(Error::config("serial.baud_rate must be non-zero"));
        }
        Ok(())
    }
}

/// Identity of one device on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name the application uses for the device
    pub name: String,
    /// Serial port the device hangs off
    pub port: String,
    /// Device address written into every frame
    pub address: u16,
}

impl DeviceConfig {
    /// Creates a device description
    pub fn new(name: impl Into<String>, port: impl Into<String>, address: u16) -> Self {
        DeviceConfig {
            name: name.into(),
            port: port.into(),
            address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_device_timing() {
        let config = EngineConfig::default();
        assert_eq!(config.attempts, 3);
        assert_eq!(config.assembly_timeout, Duration::from_millis(250));
        assert_eq!(config.response_timeout, Duration::from_millis(1500));
        assert_eq!(config.dispatch_interval, Duration::from_millis(200));
        assert_eq!(config.clock_sync_interval, Duration::from_secs(60));
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.attempts = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let mut config = EngineConfig::default();
        config.response_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("response_timeout"));
    }

    #[test]
    fn test_config_json_round_trip() {
        let json = r#"{
            "attempts": 5,
            "assembly_timeout": 300,
            "response_timeout": 2000,
            "dispatch_interval": 100,
            "clock_sync_interval": 30000
        }"#;

        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.attempts, 5);
        assert_eq!(config.response_timeout, Duration::from_secs(2));
        assert_eq!(config.serial.baud_rate, 9600);

        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: EngineConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.clock_sync_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_device_config() {
        let device = DeviceConfig::new("north", "/dev/ttyUSB0", 0x0102);
        assert_eq!(device.name, "north");
        assert_eq!(device.address, 0x0102);
    }
}
