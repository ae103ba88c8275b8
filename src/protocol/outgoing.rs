use bytes::Bytes;
use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::core::Result;
use crate::transport::Transport;
use crate::util::TextCodec;
use super::codec::append_checksum;
use super::{OUTGOING_FRAME_LEN, PAYLOAD_LEN};

/// Flags of the clock update command
pub const FLAG_SET_CLOCK: u32 = 0x0000_0002;
/// Flags of the text message command
pub const FLAG_TEXT_MESSAGE: u32 = 0x0000_0004;
/// Flags of the relay change command
pub const FLAG_CHANGE_RELAY: u32 = 0x0000_1000;
/// Flags switching output 2 on
pub const FLAG_OUTPUT2_ON: u32 = 0x0000_2000;
/// Flags switching output 2 off
pub const FLAG_OUTPUT2_OFF: u32 = 0x0000_4000;
/// Flags switching any other output on
pub const FLAG_OUTPUT_ON: u32 = 0x0000_0020;
/// Flags switching any other output off
pub const FLAG_OUTPUT_OFF: u32 = 0x0000_0100;

/// Priority byte of the common header
const PRIORITY: u8 = 0x00;

/// Business payload of an outgoing command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Set the device clock
    SetClock {
        /// Local time to set
        at: NaiveDateTime,
    },

    /// Show a text message on the device
    TextMessage {
        /// Message, cut to 16 characters on the wire
        text: String,
    },

    /// Full device reset
    Reset,

    /// Switch an actuator attached to a node
    ChangeRelay {
        /// Ray number
        ray: u8,
        /// Node number
        node: u8,
        /// Sensor (actuator) number, 1-based
        sensor: u8,
        /// Target relay state
        on: bool,
        /// Human name of the actuator, only used in descriptions
        sensor_name: String,
    },

    /// Switch a low-voltage output
    ChangeVoltage {
        /// Output number
        output: u8,
        /// Target output state
        on: bool,
    },
}

/// An outgoing command with its retry bookkeeping
#[derive(Debug, Clone)]
pub struct OutgoingCommand {
    address: u16,
    kind: CommandKind,
    remaining_attempts: u32,
    first_attempt: bool,
}

impl OutgoingCommand {
    /// Creates a command addressed to `address` that may be sent `attempts` times
    pub fn new(address: u16, kind: CommandKind, attempts: u32) -> Self {
        OutgoingCommand {
            address,
            kind,
            remaining_attempts: attempts,
            first_attempt: true,
        }
    }

    /// Device address
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Command payload
    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Transmissions left
    pub fn remaining_attempts(&self) -> u32 {
        self.remaining_attempts
    }

    /// Whether the command has never been handed to the transport
    pub fn is_first_attempt(&self) -> bool {
        self.first_attempt
    }

    /// Whether the caller hears about the start, acceptance and failure of
    /// this command. The periodic clock update is silent.
    pub fn requires_start_notification(&self) -> bool {
        !matches!(self.kind, CommandKind::SetClock { .. })
    }

    /// Human readable description for events and logs
    pub fn describe(&self) -> String {
        match &self.kind {
            CommandKind::SetClock { at } => {
                format!("set clock ({})", at.format("%d.%m.%Y %H:%M:%S"))
            }
            CommandKind::TextMessage { text } => format!("send message '{}'", text),
            CommandKind::Reset => "reset device".to_string(),
            CommandKind::ChangeRelay { sensor_name, on, .. } => {
                format!("switch actuator \"{}\" to logical {}", sensor_name, u8::from(*on))
            }
            CommandKind::ChangeVoltage { output, on } => format!(
                "{} low-voltage output {}",
                if *on { "enable" } else { "disable" },
                output
            ),
        }
    }

    /// Encodes the command into its 27-byte wire frame
    pub fn encode(&self, codec: &dyn TextCodec) -> Bytes {
        let mut frame = Vec::with_capacity(OUTGOING_FRAME_LEN);
        match &self.kind {
            CommandKind::SetClock { at } => {
                self.push_header(&mut frame, FLAG_SET_CLOCK);
                frame.extend_from_slice(clock_string(at).as_bytes());
                frame.extend_from_slice(&[0x00, 0x00]);
            }
            CommandKind::TextMessage { text } => {
                self.push_header(&mut frame, FLAG_TEXT_MESSAGE);
                let truncated: String = text.chars().take(PAYLOAD_LEN).collect();
                let mut payload = codec.encode(&truncated);
                payload.resize(PAYLOAD_LEN, b' ');
                frame.extend_from_slice(&payload);
                frame.extend_from_slice(&[0x00, 0x00]);
            }
            CommandKind::Reset => {
                frame.resize(OUTGOING_FRAME_LEN - 1, 0x00);
                frame[1..3].copy_from_slice(&self.address.to_le_bytes());
                frame[3] = 0x01;
            }
            CommandKind::ChangeRelay { ray, node, sensor, on, .. } => {
                self.push_header(&mut frame, FLAG_CHANGE_RELAY);
                let text = format!(
                    "КПУ {}/{}/{}/{}",
                    ray % 10,
                    node % 10,
                    sensor % 10,
                    if *on { "Вкл 0 " } else { "Выкл 0" }
                );
                frame.extend_from_slice(&codec.encode(&text));
                frame.push(*ray);
                frame.push(relay_byte(*node, *sensor, *on));
            }
            CommandKind::ChangeVoltage { output, on } => {
                let flags = match (*output, *on) {
                    (2, true) => FLAG_OUTPUT2_ON,
                    (2, false) => FLAG_OUTPUT2_OFF,
                    (_, true) => FLAG_OUTPUT_ON,
                    (_, false) => FLAG_OUTPUT_OFF,
                };
                self.push_header(&mut frame, flags);
                frame.extend_from_slice(&[b' '; PAYLOAD_LEN]);
                frame.extend_from_slice(&[0x00, 0x00]);
            }
        }
        append_checksum(&mut frame);
        Bytes::from(frame)
    }

    /// Spends one attempt and writes the frame to `transport`
    ///
    /// A failed write still counts as an attempt; the response timeout then
    /// treats it like a silent device.
    pub fn send(&mut self, transport: &mut dyn Transport, codec: &dyn TextCodec) -> Result<()> {
        self.first_attempt = false;
        self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
        transport.write_frame(&self.encode(codec))
    }

    /// Marks the command as handed out when there is no transport to write to
    pub fn skip_send(&mut self) {
        self.first_attempt = false;
    }

    /// Common header: lead byte, address, flags and priority
    fn push_header(&self, frame: &mut Vec<u8>, flags: u32) {
        frame.push(0x00);
        frame.extend_from_slice(&self.address.to_le_bytes());
        frame.extend_from_slice(&flags.to_le_bytes());
        frame.push(PRIORITY);
    }
}

/// `DD/MM/Y HH:MM:SS` with the year reduced to its last digit
fn clock_string(at: &NaiveDateTime) -> String {
    format!(
        "{:02}/{:02}/{} {:02}:{:02}:{:02}",
        at.day(),
        at.month(),
        at.year().rem_euclid(10),
        at.hour(),
        at.minute(),
        at.second()
    )
}

/// Node in the high nibble, sensor index in bits 1..=3, relay state in bit 0
fn relay_byte(node: u8, sensor: u8, on: bool) -> u8 {
    node.wrapping_mul(0x10)
        .wrapping_add(sensor.wrapping_sub(1) << 1)
        .wrapping_add(u8::from(on))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use crate::protocol::codec::{checksum, verify};
    use crate::protocol::incoming::IncomingFrame;
    use crate::util::Cp1251;

    struct Recorder(Vec<Bytes>);

    impl Transport for Recorder {
        fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
            self.0.push(Bytes::copy_from_slice(frame));
            Ok(())
        }
    }

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 42)
            .unwrap()
    }

    #[test]
    fn test_clock_frame_layout() {
        let cmd = OutgoingCommand::new(0x0201, CommandKind::SetClock { at: at() }, 3);
        let frame = cmd.encode(&Cp1251);

        assert_eq!(frame.len(), OUTGOING_FRAME_LEN);
        assert_eq!(&frame[..8], &[0x00, 0x01, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&frame[8..24], b"07/03/4 09:05:42");
        assert_eq!(&frame[24..26], &[0x00, 0x00]);
        assert_eq!(frame[26], checksum(&frame[..26]));
        assert!(!cmd.requires_start_notification());
    }

    #[test]
    fn test_clock_header_round_trip() {
        let cmd = OutgoingCommand::new(0xBEEF, CommandKind::SetClock { at: at() }, 3);
        let frame = cmd.encode(&Cp1251);

        // Without its lead byte an outgoing frame is shaped like an inbound one
        let (address, flags) = IncomingFrame::parse_header(&frame[1..]).unwrap();
        assert_eq!(address, 0xBEEF);
        assert_eq!(flags, FLAG_SET_CLOCK);
        assert!(IncomingFrame::parse(&frame[1..]).is_some());
    }

    #[test]
    fn test_text_message_is_padded_and_truncated() {
        let short = OutgoingCommand::new(1, CommandKind::TextMessage { text: "Тест".into() }, 3);
        let frame = short.encode(&Cp1251);
        assert_eq!(frame.len(), OUTGOING_FRAME_LEN);
        assert_eq!(&frame[3..7], &FLAG_TEXT_MESSAGE.to_le_bytes());
        assert_eq!(&frame[8..12], &[0xD2, 0xE5, 0xF1, 0xF2]);
        assert_eq!(&frame[12..24], &[b' '; 12]);
        assert!(verify(&frame));

        let long = OutgoingCommand::new(
            1,
            CommandKind::TextMessage { text: "0123456789abcdefXYZ".into() },
            3,
        );
        let frame = long.encode(&Cp1251);
        assert_eq!(frame.len(), OUTGOING_FRAME_LEN);
        assert_eq!(&frame[8..24], b"0123456789abcdef");
    }

    #[test]
    fn test_reset_frame() {
        let cmd = OutgoingCommand::new(0x0304, CommandKind::Reset, 3);
        let frame = cmd.encode(&Cp1251);

        let mut expected = vec![0u8; 26];
        expected[1] = 0x04;
        expected[2] = 0x03;
        expected[3] = 0x01;
        expected.push(0x08);
        assert_eq!(&frame[..], &expected[..]);
        assert!(cmd.requires_start_notification());
    }

    #[test]
    fn test_relay_frame() {
        let cmd = OutgoingCommand::new(
            7,
            CommandKind::ChangeRelay {
                ray: 2,
                node: 5,
                sensor: 3,
                on: true,
                sensor_name: "siren".into(),
            },
            3,
        );
        let frame = cmd.encode(&Cp1251);

        assert_eq!(frame.len(), OUTGOING_FRAME_LEN);
        assert_eq!(&frame[3..7], &FLAG_CHANGE_RELAY.to_le_bytes());
        assert_eq!(Cp1251.decode(&frame[8..24]), "КПУ 2/5/3/Вкл 0 ");
        assert_eq!(frame[24], 2);
        assert_eq!(frame[25], 5 * 16 + (2 << 1) + 1);
        assert!(verify(&frame));

        let off = OutgoingCommand::new(
            7,
            CommandKind::ChangeRelay {
                ray: 12,
                node: 1,
                sensor: 1,
                on: false,
                sensor_name: "lamp".into(),
            },
            3,
        );
        let frame = off.encode(&Cp1251);
        assert_eq!(Cp1251.decode(&frame[8..24]), "КПУ 2/1/1/Выкл 0");
        assert_eq!(frame[24], 12);
        assert_eq!(frame[25], 0x10);
        assert_eq!(off.describe(), "switch actuator \"lamp\" to logical 0");
    }

    #[test]
    fn test_voltage_flags() {
        let cases = [
            (2, true, FLAG_OUTPUT2_ON),
            (2, false, FLAG_OUTPUT2_OFF),
            (1, true, FLAG_OUTPUT_ON),
            (1, false, FLAG_OUTPUT_OFF),
        ];
        for (output, on, flags) in cases {
            let cmd = OutgoingCommand::new(9, CommandKind::ChangeVoltage { output, on }, 3);
            let frame = cmd.encode(&Cp1251);
            assert_eq!(frame.len(), OUTGOING_FRAME_LEN);
            assert_eq!(IncomingFrame::parse_header(&frame[1..]).unwrap(), (9, flags));
            assert_eq!(&frame[8..24], &[b' '; 16]);
            assert!(verify(&frame));
        }
    }

    #[test]
    fn test_send_spends_attempts() {
        let mut transport = Recorder(Vec::new());
        let mut cmd = OutgoingCommand::new(1, CommandKind::Reset, 2);
        assert!(cmd.is_first_attempt());

        cmd.send(&mut transport, &Cp1251).unwrap();
        assert!(!cmd.is_first_attempt());
        assert_eq!(cmd.remaining_attempts(), 1);

        cmd.send(&mut transport, &Cp1251).unwrap();
        assert_eq!(cmd.remaining_attempts(), 0);
        assert_eq!(transport.0.len(), 2);
        assert_eq!(transport.0[0], cmd.encode(&Cp1251));
    }

    #[test]
    fn test_skip_send_keeps_attempts() {
        let mut cmd = OutgoingCommand::new(1, CommandKind::Reset, 3);
        cmd.skip_send();
        assert!(!cmd.is_first_attempt());
        assert_eq!(cmd.remaining_attempts(), 3);
    }
}
