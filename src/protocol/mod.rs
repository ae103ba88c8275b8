//! Protocol implementation module
//!
//! This module defines the USK v1 frame layout, the outgoing command
//! encoders, the classification of unsolicited frames and the per-device
//! state machine that ties them together.

pub mod codec;
pub mod incoming;
pub mod message;
pub mod outgoing;
pub mod state;

pub use self::codec::{FrameCodec, FrameKind};
pub use self::incoming::{IncomingCommand, IncomingFrame, IncomingRegistry};
pub use self::message::DeviceEvent;
pub use self::outgoing::{CommandKind, OutgoingCommand};
pub use self::state::{EngineState, ProtocolEngine, Wait};

// Constants
/// Size of an unsolicited frame sent by the device
pub const INCOMING_FRAME_LEN: usize = 26;

/// Size of the acknowledgment the device returns for every command
pub const ACK_FRAME_LEN: usize = 5;

/// Size of a frame sent to the device
pub const OUTGOING_FRAME_LEN: usize = 27;

/// Text payload size shared by both directions
pub const PAYLOAD_LEN: usize = 16;
