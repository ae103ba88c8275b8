//! Core types shared by the protocol engine, the device driver and the registry
//!
//! This module contains the error type, configuration and the small value
//! types that cross module boundaries.

pub mod error;
pub mod serde;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{
    DeviceConfig,
    DeviceStatus,
    EngineConfig,
    ErrorCode,
    InfoCode,
    SerialSettings,
};

/// Transmissions per outgoing command unless configured otherwise
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Reference line speed of USK v1 devices
pub const DEFAULT_BAUD_RATE: u32 = 9600;
