use serde::{Deserialize, Serialize};

use crate::core::{ErrorCode, InfoCode};

/// Events raised by a protocol engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Transport to the device was opened
    TransportOpened {
        /// Serial port name
        port: String,
    },

    /// Transport to the device was closed
    TransportClosed {
        /// Serial port name
        port: String,
    },

    /// Non-fatal protocol error
    Error(ErrorCode),

    /// A well-formed frame no decoder recognised
    UnknownCommand(String),

    /// The device acknowledged an outgoing command
    CommandAccepted(String),

    /// First transmission of an outgoing command is starting
    StartSending(String),

    /// An outgoing command ran out of attempts
    SendFailed(String),

    /// Device presence changed
    PresenceChanged {
        /// Whether the device is reachable
        present: bool,
        /// First presence report since the engine was opened
        first: bool,
    },

    /// The device reported a full reset
    DeviceReset,

    /// Free text message from the device
    TextMessage(String),

    /// A node was attached
    NewNode {
        /// Ray the node sits on
        ray: u8,
        /// Node number
        node: u8,
    },

    /// A node dropped off
    NodeDisconnected {
        /// Ray the node sat on
        ray: u8,
        /// Node number
        node: u8,
    },

    /// A low-voltage output switched
    VoltageChanged {
        /// Output number
        output: u8,
        /// New output state
        on: bool,
    },

    /// One sensor input of a node changed
    SensorChanged {
        /// Ray the node sits on
        ray: u8,
        /// Node number
        node: u8,
        /// Sensor label, 1..=8
        sensor: u8,
        /// New sensor value, 0 or 1
        value: u8,
    },

    /// Informational packet
    InfoPacket(InfoCode),
}
