//! Classification of unsolicited frames
//!
//! Every 26-byte frame the device sends on its own is run through an ordered
//! table of matchers. The first matcher that accepts the frame decides what
//! it means; a malformed frame is caught by the first matcher and anything
//! well-formed that nothing else claims falls through to the last one.

use tracing::trace;

use crate::core::{ErrorCode, InfoCode};
use crate::util::TextCodec;
use super::codec::verify;
use super::message::DeviceEvent;
use super::{INCOMING_FRAME_LEN, PAYLOAD_LEN};

/// Priority of the malformed-frame matcher
pub const PRIORITY_MALFORMED: u16 = 0;
/// Priority of the device command matchers
pub const PRIORITY_DEVICE: u16 = 10;
/// Priority of the catch-all matcher
pub const PRIORITY_FALLBACK: u16 = u16::MAX;

/// Flag bit marking a free text message
pub const FLAG_TEXT_MESSAGE: u32 = 0x0001_0000;

const RESET_PHRASE: &str = "полный сброс уск";
const NEW_NODE_PREFIX: &str = "новый оу:";
const NODE_DISCONNECTED_PREFIX: &str = "неисп.оу:";
const VOLTAGE_MARKER: &str = " 220-";
const VOLTAGE_ON: &str = "включение";
const VOLTAGE_OFF: &str = "выключение";

/// Character positions inside node announcements
const NODE_DIGIT: usize = 9;
const RAY_DIGIT: usize = 15;

const INFO_PHRASES: [(&str, InfoCode); 3] = [
    ("включение уск", InfoCode::DeviceOn),
    ("установка часов", InfoCode::ClockSet),
    ("ошибка приема rs", InfoCode::RsReceiveError),
];

/// A validated inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFrame {
    /// Device address
    pub address: u16,
    /// Command flags
    pub flags: u32,
    /// Text payload in the device codepage
    pub payload: [u8; PAYLOAD_LEN],
    /// Sensor bits before the change
    pub prev_bits: u8,
    /// Sensor bits after the change
    pub cur_bits: u8,
}

impl IncomingFrame {
    /// Parses a frame, returning `None` on a length or checksum mismatch
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() != INCOMING_FRAME_LEN || !verify(raw) {
            return None;
        }
        let (address, flags) = Self::parse_header(raw)?;
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&raw[7..7 + PAYLOAD_LEN]);

        Some(IncomingFrame {
            address,
            flags,
            payload,
            prev_bits: raw[23],
            cur_bits: raw[24],
        })
    }

    /// Reads the little-endian address and flags from the first six bytes
    pub fn parse_header(raw: &[u8]) -> Option<(u16, u32)> {
        if raw.len() < 6 {
            return None;
        }
        let address = u16::from_le_bytes([raw[0], raw[1]]);
        let flags = u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]);
        Some((address, flags))
    }
}

/// What an inbound frame turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingCommand {
    /// Length or checksum mismatch
    Malformed,
    /// The device announced a full reset
    Reset,
    /// Free text from the device
    TextMessage(String),
    /// A node was attached
    NewNode { ray: u8, node: u8 },
    /// A node dropped off
    NodeDisconnected { ray: u8, node: u8 },
    /// A low-voltage output switched
    VoltageChanged { output: u8, on: bool },
    /// Sensor inputs of a node changed; `changes` holds (label, new value)
    SensorChanged { ray: u8, node: u8, changes: Vec<(u8, u8)> },
    /// Informational packet
    Info(InfoCode),
    /// Well-formed but not recognised
    Unknown(String),
}

impl IncomingCommand {
    /// False only for malformed frames
    pub fn is_correct(&self) -> bool {
        !matches!(self, IncomingCommand::Malformed)
    }

    /// Events this command raises, in order
    pub fn events(&self) -> Vec<DeviceEvent> {
        match self {
            IncomingCommand::Malformed => vec![DeviceEvent::Error(ErrorCode::WrongPacket)],
            IncomingCommand::Reset => vec![
                DeviceEvent::DeviceReset,
                DeviceEvent::InfoPacket(InfoCode::Reset),
            ],
            IncomingCommand::TextMessage(text) => vec![DeviceEvent::TextMessage(text.clone())],
            IncomingCommand::NewNode { ray, node } => vec![DeviceEvent::NewNode {
                ray: *ray,
                node: *node,
            }],
            IncomingCommand::NodeDisconnected { ray, node } => {
                vec![DeviceEvent::NodeDisconnected {
                    ray: *ray,
                    node: *node,
                }]
            }
            IncomingCommand::VoltageChanged { output, on } => vec![DeviceEvent::VoltageChanged {
                output: *output,
                on: *on,
            }],
            IncomingCommand::SensorChanged { ray, node, changes } => changes
                .iter()
                .map(|&(sensor, value)| DeviceEvent::SensorChanged {
                    ray: *ray,
                    node: *node,
                    sensor,
                    value,
                })
                .collect(),
            IncomingCommand::Info(code) => vec![DeviceEvent::InfoPacket(*code)],
            IncomingCommand::Unknown(text) => vec![DeviceEvent::UnknownCommand(text.clone())],
        }
    }

    /// Log line for the command
    pub fn describe(&self) -> String {
        match self {
            IncomingCommand::Malformed => "malformed inbound frame".to_string(),
            IncomingCommand::Reset => "device reset".to_string(),
            IncomingCommand::TextMessage(text) => format!("text message '{}'", text),
            IncomingCommand::NewNode { ray, node } => {
                format!("new node detected: ray {}, node {}", ray, node)
            }
            IncomingCommand::NodeDisconnected { ray, node } => {
                format!("node disconnected: ray {}, node {}", ray, node)
            }
            IncomingCommand::VoltageChanged { output, on } => format!(
                "low-voltage output {} switched {}",
                output,
                if *on { "on" } else { "off" }
            ),
            IncomingCommand::SensorChanged { ray, node, changes } => {
                let values: Vec<String> = changes
                    .iter()
                    .map(|(sensor, value)| format!("{}:{}", sensor, value))
                    .collect();
                format!("sensors changed on node {} (ray {}): {{{}}}", node, ray, values.join(", "))
            }
            IncomingCommand::Info(code) => format!("info packet {:?}", code),
            IncomingCommand::Unknown(text) => format!("unknown inbound command '{}'", text),
        }
    }
}

/// Frame under classification, parsed once and shared by all matchers
pub struct Candidate {
    frame: Option<IncomingFrame>,
    text: String,
}

impl Candidate {
    /// Parses `raw` and decodes its payload with `codec`
    pub fn new(raw: &[u8], codec: &dyn TextCodec) -> Self {
        let frame = IncomingFrame::parse(raw);
        let text = frame
            .as_ref()
            .map(|f| codec.decode(&f.payload))
            .unwrap_or_default();
        Candidate { frame, text }
    }

    /// Parsed frame, `None` when malformed
    pub fn frame(&self) -> Option<&IncomingFrame> {
        self.frame.as_ref()
    }

    /// Payload decoded from the device codepage
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Stateless frame matcher
pub type MatchFn = fn(&Candidate) -> Option<IncomingCommand>;

/// One entry of the matcher table
#[derive(Clone, Copy)]
pub struct FrameMatcher {
    /// Lower priorities are tried first
    pub priority: u16,
    /// Name used in traces
    pub name: &'static str,
    matcher: MatchFn,
}

/// Priority-ordered matcher table
#[derive(Clone)]
pub struct IncomingRegistry {
    matchers: Vec<FrameMatcher>,
}

impl IncomingRegistry {
    /// Creates an empty table
    pub fn empty() -> Self {
        IncomingRegistry {
            matchers: Vec::new(),
        }
    }

    /// Creates the table of USK v1 inbound commands
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(PRIORITY_MALFORMED, "malformed", match_malformed);
        registry.register(PRIORITY_FALLBACK, "unknown", match_unknown);
        registry.register(PRIORITY_DEVICE, "reset", match_reset);
        registry.register(PRIORITY_DEVICE, "text-message", match_text_message);
        registry.register(PRIORITY_DEVICE, "new-node", match_new_node);
        registry.register(PRIORITY_DEVICE, "node-disconnected", match_node_disconnected);
        registry.register(PRIORITY_DEVICE, "voltage-changed", match_voltage_changed);
        registry.register(PRIORITY_DEVICE, "sensor-changed", match_sensor_changed);
        registry.register(PRIORITY_DEVICE, "info", match_info);
        registry
    }

    /// Adds a matcher; equal priorities keep registration order
    pub fn register(&mut self, priority: u16, name: &'static str, matcher: MatchFn) {
        self.matchers.push(FrameMatcher {
            priority,
            name,
            matcher,
        });
        // stable sort keeps registration order within a priority
        self.matchers.sort_by_key(|m| m.priority);
    }

    /// Matcher names in evaluation order
    pub fn names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name).collect()
    }

    /// Returns the command of the first matcher accepting `raw`
    pub fn classify(&self, raw: &[u8], codec: &dyn TextCodec) -> Option<IncomingCommand> {
        let candidate = Candidate::new(raw, codec);
        self.matchers.iter().find_map(|m| {
            let command = (m.matcher)(&candidate)?;
            trace!(matcher = m.name, priority = m.priority, "inbound frame matched");
            Some(command)
        })
    }
}

impl Default for IncomingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Sensor labels 8 down to 1 map to bits 0 up to 7; returns (label, new value)
/// for every bit that differs
pub fn changed_sensors(prev: u8, cur: u8) -> Vec<(u8, u8)> {
    let diff = prev ^ cur;
    (0..8u8)
        .filter(|bit| diff & (1 << bit) != 0)
        .map(|bit| (8 - bit, (cur >> bit) & 1))
        .collect()
}

fn digit_at(chars: &[char], idx: usize) -> u8 {
    chars
        .get(idx)
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8)
        .unwrap_or(0)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Finds `<word> 220-<1|2>` on word boundaries and returns the word and digit
fn find_voltage_switch(text: &str) -> Option<(String, u8)> {
    let chars: Vec<char> = text.chars().collect();
    let marker: Vec<char> = VOLTAGE_MARKER.chars().collect();

    for start in 0..chars.len() {
        if !chars[start..].starts_with(&marker) {
            continue;
        }
        let mut word_start = start;
        while word_start > 0 && is_word_char(chars[word_start - 1]) {
            word_start -= 1;
        }
        if word_start == start {
            continue;
        }
        let digit_pos = start + marker.len();
        let output = match chars.get(digit_pos) {
            Some('1') => 1,
            Some('2') => 2,
            _ => continue,
        };
        if chars.get(digit_pos + 1).map_or(false, |&c| is_word_char(c)) {
            continue;
        }
        return Some((chars[word_start..start].iter().collect(), output));
    }
    None
}

fn node_announcement(candidate: &Candidate, prefix: &str) -> Option<(u8, u8)> {
    candidate.frame()?;
    let lowered = candidate.text().to_lowercase();
    if !lowered.starts_with(prefix) {
        return None;
    }
    let chars: Vec<char> = lowered.chars().collect();
    Some((digit_at(&chars, RAY_DIGIT), digit_at(&chars, NODE_DIGIT)))
}

fn match_malformed(candidate: &Candidate) -> Option<IncomingCommand> {
    candidate.frame().is_none().then_some(IncomingCommand::Malformed)
}

fn match_unknown(candidate: &Candidate) -> Option<IncomingCommand> {
    candidate.frame()?;
    Some(IncomingCommand::Unknown(candidate.text().to_string()))
}

fn match_reset(candidate: &Candidate) -> Option<IncomingCommand> {
    candidate.frame()?;
    (candidate.text().trim().to_lowercase() == RESET_PHRASE).then_some(IncomingCommand::Reset)
}

fn match_text_message(candidate: &Candidate) -> Option<IncomingCommand> {
    let frame = candidate.frame()?;
    (frame.flags & FLAG_TEXT_MESSAGE != 0)
        .then(|| IncomingCommand::TextMessage(candidate.text().to_string()))
}

fn match_new_node(candidate: &Candidate) -> Option<IncomingCommand> {
    let (ray, node) = node_announcement(candidate, NEW_NODE_PREFIX)?;
    Some(IncomingCommand::NewNode { ray, node })
}

fn match_node_disconnected(candidate: &Candidate) -> Option<IncomingCommand> {
    let (ray, node) = node_announcement(candidate, NODE_DISCONNECTED_PREFIX)?;
    Some(IncomingCommand::NodeDisconnected { ray, node })
}

fn match_voltage_changed(candidate: &Candidate) -> Option<IncomingCommand> {
    candidate.frame()?;
    let lowered = candidate.text().to_lowercase();
    let (word, output) = find_voltage_switch(lowered.trim())?;
    let on = match word.as_str() {
        VOLTAGE_ON => true,
        VOLTAGE_OFF => false,
        _ => return None,
    };
    Some(IncomingCommand::VoltageChanged { output, on })
}

fn match_sensor_changed(candidate: &Candidate) -> Option<IncomingCommand> {
    let frame = candidate.frame()?;
    let chars: Vec<char> = candidate.text().to_lowercase().chars().collect();
    if !(chars.starts_with(&['l', '=']) && chars.get(4..6) == Some(&['k', '='][..])) {
        return None;
    }
    Some(IncomingCommand::SensorChanged {
        ray: digit_at(&chars, 2),
        node: digit_at(&chars, 6),
        changes: changed_sensors(frame.prev_bits, frame.cur_bits),
    })
}

fn match_info(candidate: &Candidate) -> Option<IncomingCommand> {
    candidate.frame()?;
    let lowered = candidate.text().to_lowercase();
    let message = lowered.trim();
    INFO_PHRASES
        .iter()
        .find(|(phrase, _)| *phrase == message)
        .map(|&(_, code)| IncomingCommand::Info(code))
}
