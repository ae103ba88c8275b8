use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::NaiveDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::core::{DeviceConfig, DeviceStatus, EngineConfig, Error, ErrorCode};
use crate::transport::Transport;
use crate::util::{hex, Cp1251, TextCodec};
use super::codec::{verify, FrameCodec, FrameKind};
use super::incoming::IncomingRegistry;
use super::message::DeviceEvent;
use super::outgoing::{CommandKind, OutgoingCommand};

/// Represents the current state of the request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Listening for unsolicited frames, free to dispatch
    Idle,
    /// A command was written and its acknowledgment is due
    AwaitingResponse,
}

/// What the armed receive deadline is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// The rest of a partially received frame
    Assembly,
    /// The acknowledgment of the command in flight
    Response,
}

/// Protocol state machine for one device
///
/// The engine does no I/O of its own. The owner feeds it received bytes and
/// timer ticks, hands it a transport to write to, and watches the event
/// channel.
pub struct ProtocolEngine {
    /// Device name used in logs
    name: String,
    /// Device address written into every frame
    address: u16,
    /// Port the transport was opened on
    port: String,
    /// Timing and retry configuration
    config: EngineConfig,
    /// Current state
    state: EngineState,
    /// Bytes received but not yet framed
    buffer: BytesMut,
    /// Splits the buffer into frames of the size the state expects
    codec: FrameCodec,
    /// Commands waiting for dispatch
    queue: VecDeque<OutgoingCommand>,
    /// Command awaiting its acknowledgment
    in_flight: Option<OutgoingCommand>,
    /// Whether the device is considered reachable
    present: bool,
    /// Whether the next presence report is the first since open
    first_use: bool,
    /// Open transport, if any
    transport: Option<Box<dyn Transport>>,
    /// Single receive deadline shared by assembly and response waits
    deadline: Option<(Instant, Wait)>,
    /// Classifier for unsolicited frames
    incoming: IncomingRegistry,
    /// Device codepage
    text: Arc<dyn TextCodec>,
    /// Channel for semantic events
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl ProtocolEngine {
    /// Creates a closed engine for `device`
    pub fn new(
        device: DeviceConfig,
        config: EngineConfig,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        ProtocolEngine {
            name: device.name,
            address: device.address,
            port: device.port,
            config,
            state: EngineState::Idle,
            buffer: BytesMut::new(),
            codec: FrameCodec::new(),
            queue: VecDeque::new(),
            in_flight: None,
            present: false,
            first_use: true,
            transport: None,
            deadline: None,
            incoming: IncomingRegistry::new(),
            text: Arc::new(Cp1251),
            events,
        }
    }

    /// Replaces the device codepage
    pub fn with_text_codec(mut self, text: Arc<dyn TextCodec>) -> Self {
        self.text = text;
        self
    }

    /// Takes ownership of an open transport and starts a fresh session
    ///
    /// A clock update stamped `now` is queued right away.
    pub fn open(&mut self, transport: Box<dyn Transport>, now: NaiveDateTime) {
        if self.is_open() {
            self.close();
        }

        self.buffer.clear();
        self.deadline = None;
        self.present = false;
        self.first_use = true;
        self.set_state(EngineState::Idle);
        self.transport = Some(transport);

        info!(device = %self.name, port = %self.port, "transport opened");
        self.emit(DeviceEvent::TransportOpened {
            port: self.port.clone(),
        });
        self.send_time(now);
    }

    /// Reports that the transport could not be opened
    pub fn report_open_failure(&self, err: &Error) {
        warn!(device = %self.name, port = %self.port, error = %err, "failed to open transport");
        self.emit(DeviceEvent::Error(ErrorCode::OpenPort));
    }

    /// Drops the transport and abandons the command in flight
    ///
    /// Queued commands are kept for the next session.
    pub fn close(&mut self) {
        self.deadline = None;
        self.buffer.clear();
        self.set_state(EngineState::Idle);
        if let Some(cmd) = self.in_flight.take() {
            debug!(device = %self.name, command = %cmd.describe(), "abandoning command in flight");
        }

        if self.transport.take().is_some() {
            info!(device = %self.name, port = %self.port, "transport closed");
            self.emit(DeviceEvent::TransportClosed {
                port: self.port.clone(),
            });
        }
    }

    /// Externally visible device status
    pub fn status(&self) -> DeviceStatus {
        match (self.is_open(), self.present) {
            (false, _) => DeviceStatus::Closed,
            (true, true) => DeviceStatus::Present,
            (true, false) => DeviceStatus::Missing,
        }
    }

    /// Sets the attempt count for commands enqueued from now on
    ///
    /// Every command is transmitted at least once, so zero counts as one.
    pub fn set_attempts(&mut self, attempts: u32) {
        self.config.attempts = attempts.max(1);
    }

    /// Queues a command bound to this device and the current attempt count
    pub fn enqueue(&mut self, kind: CommandKind) {
        let cmd = OutgoingCommand::new(self.address, kind, self.config.attempts);
        debug!(device = %self.name, command = %cmd.describe(), "command queued");
        self.queue.push_back(cmd);
    }

    /// Queues a clock update
    pub fn send_time(&mut self, at: NaiveDateTime) {
        self.enqueue(CommandKind::SetClock { at });
    }

    /// Queues a text message
    pub fn send_message(&mut self, text: impl Into<String>) {
        self.enqueue(CommandKind::TextMessage { text: text.into() });
    }

    /// Queues a full device reset
    pub fn reset_device(&mut self) {
        self.enqueue(CommandKind::Reset);
    }

    /// Queues an actuator switch
    pub fn change_relay(&mut self, ray: u8, node: u8, sensor: u8, on: bool, sensor_name: impl Into<String>) {
        self.enqueue(CommandKind::ChangeRelay {
            ray,
            node,
            sensor,
            on,
            sensor_name: sensor_name.into(),
        });
    }

    /// Queues a low-voltage output switch
    pub fn change_voltage(&mut self, output: u8, on: bool) {
        self.enqueue(CommandKind::ChangeVoltage { output, on });
    }

    /// Handles bytes delivered by the transport
    pub fn on_bytes(&mut self, bytes: &[u8], now: Instant) {
        // Any delivery disarms the pending wait
        self.deadline = None;
        self.buffer.extend_from_slice(bytes);
        debug!(device = %self.name, bytes = %hex(bytes), buffered = self.buffer.len(), "bytes received");
        self.process(now);
    }

    /// Handles the periodic dispatch tick
    pub fn on_dispatch_tick(&mut self, now: Instant) {
        if self.state != EngineState::Idle
            || !self.buffer.is_empty()
            || self.in_flight.is_some()
            || !self.is_open()
        {
            return;
        }
        let Some(mut cmd) = self.queue.pop_front() else {
            return;
        };

        if cmd.is_first_attempt() && cmd.requires_start_notification() {
            self.emit(DeviceEvent::StartSending(cmd.describe()));
        }
        self.transmit(&mut cmd);
        self.in_flight = Some(cmd);
        self.set_state(EngineState::AwaitingResponse);
        self.arm(Wait::Response, now);
    }

    /// Handles the periodic clock update
    pub fn on_clock_sync(&mut self, now: NaiveDateTime) {
        self.send_time(now);
    }

    /// Handles expiry of the receive deadline
    ///
    /// Does nothing unless a deadline is armed and `now` has reached it.
    pub fn on_deadline(&mut self, now: Instant) {
        let Some((at, wait)) = self.deadline else {
            return;
        };
        if at > now {
            return;
        }
        self.deadline = None;

        match self.state {
            EngineState::Idle => {
                if !self.buffer.is_empty() {
                    warn!(
                        device = %self.name,
                        discarded = self.buffer.len(),
                        "incomplete frame timed out"
                    );
                    self.buffer.clear();
                    self.emit(DeviceEvent::Error(ErrorCode::DataTimeout));
                }
            }
            EngineState::AwaitingResponse => self.on_response_timeout(wait, now),
        }
    }

    fn on_response_timeout(&mut self, wait: Wait, now: Instant) {
        let code = if self.buffer.is_empty() {
            ErrorCode::DeviceSilent
        } else {
            ErrorCode::ResponseTimeout
        };
        warn!(device = %self.name, ?wait, ?code, "no acknowledgment");
        self.emit(DeviceEvent::Error(code));
        self.present = false;
        self.emit_presence(false);
        self.buffer.clear();

        match self.in_flight.take() {
            Some(mut cmd) if cmd.remaining_attempts() > 0 => {
                debug!(
                    device = %self.name,
                    command = %cmd.describe(),
                    remaining = cmd.remaining_attempts(),
                    "retrying command"
                );
                self.transmit(&mut cmd);
                self.in_flight = Some(cmd);
                self.arm(Wait::Response, now);
            }
            Some(cmd) => {
                warn!(device = %self.name, command = %cmd.describe(), "command failed");
                if cmd.requires_start_notification() {
                    self.emit(DeviceEvent::SendFailed(cmd.describe()));
                }
                self.set_state(EngineState::Idle);
            }
            None => self.set_state(EngineState::Idle),
        }
    }

    fn process(&mut self, now: Instant) {
        if self.state == EngineState::AwaitingResponse {
            match self.next_frame() {
                Some(ack) => self.take_ack(&ack),
                None => {
                    self.arm(Wait::Assembly, now);
                    return;
                }
            }
        }
        self.drain_incoming(now);
    }

    fn take_ack(&mut self, ack: &[u8]) {
        if !verify(ack) {
            warn!(device = %self.name, frame = %hex(ack), "acknowledgment checksum mismatch");
            self.emit(DeviceEvent::Error(ErrorCode::WrongPacket));
        }
        self.set_state(EngineState::Idle);

        if let Some(cmd) = self.in_flight.take() {
            debug!(device = %self.name, command = %cmd.describe(), "command acknowledged");
            if cmd.requires_start_notification() {
                self.emit(DeviceEvent::CommandAccepted(cmd.describe()));
            }
        }
        self.mark_present();
    }

    fn drain_incoming(&mut self, now: Instant) {
        while let Some(frame) = self.next_frame() {
            let Some(command) = self.incoming.classify(&frame, self.text.as_ref()) else {
                debug!(device = %self.name, frame = %hex(&frame), "frame not claimed by any matcher");
                continue;
            };

            if command.is_correct() {
                debug!(device = %self.name, "{}", command.describe());
            } else {
                warn!(device = %self.name, frame = %hex(&frame), "malformed frame");
            }
            for event in command.events() {
                self.emit(event);
            }
            if command.is_correct() {
                self.mark_present();
            }
        }

        if !self.buffer.is_empty() {
            self.arm(Wait::Assembly, now);
        }
    }

    fn next_frame(&mut self) -> Option<BytesMut> {
        // The fixed-size codec only reports "need more data"
        self.codec.decode(&mut self.buffer).ok().flatten()
    }

    fn transmit(&mut self, cmd: &mut OutgoingCommand) {
        let Some(transport) = self.transport.as_mut() else {
            cmd.skip_send();
            return;
        };
        debug!(device = %self.name, command = %cmd.describe(), "sending command");
        if let Err(e) = cmd.send(&mut **transport, self.text.as_ref()) {
            warn!(device = %self.name, error = %e, "failed to write frame");
        }
    }

    fn mark_present(&mut self) {
        if !self.present {
            self.present = true;
            self.emit_presence(true);
        }
    }

    fn emit_presence(&mut self, present: bool) {
        self.emit(DeviceEvent::PresenceChanged {
            present,
            first: self.first_use,
        });
        self.first_use = false;
    }

    fn arm(&mut self, wait: Wait, now: Instant) {
        let timeout = match wait {
            Wait::Assembly => self.config.assembly_timeout,
            Wait::Response => self.config.response_timeout,
        };
        self.deadline = Some((now + timeout, wait));
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!(device = %self.name, from = ?self.state, to = ?state, "state transition");
        }
        self.state = state;
        self.codec.set_kind(match state {
            EngineState::Idle => FrameKind::Incoming,
            EngineState::AwaitingResponse => FrameKind::Ack,
        });
    }

    fn emit(&self, event: DeviceEvent) {
        // Nobody listening is not an engine error
        let _ = self.events.send(event);
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device address
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Serial port name
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Timing and retry configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether a transport is attached
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Number of commands waiting for dispatch
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Command awaiting its acknowledgment
    pub fn in_flight(&self) -> Option<&OutgoingCommand> {
        self.in_flight.as_ref()
    }

    /// Whether the device is considered reachable
    pub fn is_present(&self) -> bool {
        self.present
    }

    /// Number of received bytes not yet framed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Armed receive deadline
    pub fn deadline(&self) -> Option<(Instant, Wait)> {
        self.deadline
    }
}
