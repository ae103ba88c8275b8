//! USK link: serial protocol engine for USK v1 alarm controllers
//!
//! This library drives the fixed-frame serial protocol spoken by USK v1
//! controllers: it frames the byte stream, classifies unsolicited frames,
//! dispatches outgoing commands with bounded retry, and tracks whether each
//! device is still answering. A registry runs many devices side by side and
//! merges their events into one channel.

pub mod core;
pub mod device;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod util;

// Re-export commonly used items
pub use crate::core::{DeviceConfig, DeviceStatus, EngineConfig, Error, ErrorCode, InfoCode, Result};
pub use crate::device::{Device, DeviceHandle};
pub use crate::protocol::{CommandKind, DeviceEvent, ProtocolEngine};
pub use crate::registry::{DeviceInfo, Registry, RegistryEvent, RegistryHandle};
pub use crate::transport::{Connector, MemoryConnector, SerialConnector, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
