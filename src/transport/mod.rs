//! Byte transports between the engine and a device
//!
//! The engine only writes whole frames; received bytes arrive as a stream of
//! chunks on a channel, in whatever pieces the line delivers them.

mod memory;
mod serial;

pub use self::memory::{MemoryConnector, MemoryPeer};
pub use self::serial::SerialConnector;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::{Result, SerialSettings};

/// Channel capacity for received chunks
pub const INCOMING_CHANNEL_CAPACITY: usize = 64;

/// Write half of an open connection
pub trait Transport: Send {
    /// Writes one complete frame
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// An open connection to one device
pub struct Connection {
    /// Frame writer
    pub writer: Box<dyn Transport>,
    /// Received byte chunks; the stream ends when the line fails
    pub incoming: mpsc::Receiver<Bytes>,
}

/// Opens connections by port name
pub trait Connector: Send + Sync {
    /// Opens `port` with the given line settings
    fn connect(&self, port: &str, settings: &SerialSettings) -> Result<Connection>;
}
