//! Async driver for one device
//!
//! A device task owns a [`ProtocolEngine`] and, while open, the connection to
//! the device. Everything that touches the engine runs inside the task's
//! `select!` loop, so byte deliveries and timers never race.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{Local, NaiveDateTime};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::{DeviceConfig, DeviceStatus, EngineConfig, Error, Result};
use crate::protocol::{CommandKind, DeviceEvent, ProtocolEngine};
use crate::transport::Connector;
use crate::util::TextCodec;

/// Capacity of the control channel of a device task
const CONTROL_CHANNEL_CAPACITY: usize = 32;

/// Requests handled by a device task
#[derive(Debug)]
enum Control {
    Open(oneshot::Sender<bool>),
    Close,
    Enqueue(CommandKind),
    SetAttempts(u32),
    Status(oneshot::Sender<DeviceStatus>),
    Shutdown,
}

/// Handle for talking to a device task
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    name: String,
    control_tx: mpsc::Sender<Control>,
}

impl DeviceHandle {
    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opens the transport; true when it is open afterwards
    pub async fn open(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::Open(tx)).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Closes the transport
    pub async fn close(&self) -> Result<()> {
        self.send(Control::Close).await
    }

    /// Queues a clock update
    pub async fn send_time(&self, at: NaiveDateTime) -> Result<()> {
        self.enqueue(CommandKind::SetClock { at }).await
    }

    /// Queues a text message
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.enqueue(CommandKind::TextMessage { text: text.into() }).await
    }

    /// Queues a full device reset
    pub async fn reset(&self) -> Result<()> {
        self.enqueue(CommandKind::Reset).await
    }

    /// Queues an actuator switch
    pub async fn change_relay(
        &self,
        ray: u8,
        node: u8,
        sensor: u8,
        on: bool,
        sensor_name: impl Into<String>,
    ) -> Result<()> {
        self.enqueue(CommandKind::ChangeRelay {
            ray,
            node,
            sensor,
            on,
            sensor_name: sensor_name.into(),
        })
        .await
    }

    /// Queues a low-voltage output switch
    pub async fn change_voltage(&self, output: u8, on: bool) -> Result<()> {
        self.enqueue(CommandKind::ChangeVoltage { output, on }).await
    }

    /// Queues any command
    pub async fn enqueue(&self, kind: CommandKind) -> Result<()> {
        self.send(Control::Enqueue(kind)).await
    }

    /// Sets the attempt count for commands queued from now on
    pub async fn set_attempts(&self, attempts: u32) -> Result<()> {
        self.send(Control::SetAttempts(attempts)).await
    }

    /// Current device status
    pub async fn status(&self) -> Result<DeviceStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Control::Status(tx)).await?;
        rx.await.map_err(|_| self.gone())
    }

    /// Closes the transport and stops the task
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Control::Shutdown).await
    }

    async fn send(&self, control: Control) -> Result<()> {
        self.control_tx.send(control).await.map_err(|_| self.gone())
    }

    fn gone(&self) -> Error {
        Error::channel_closed(format!("device {} is no longer running", self.name))
    }
}

/// Timers and received bytes of an open connection
struct Session {
    incoming: mpsc::Receiver<Bytes>,
    dispatch: Interval,
    clock_sync: Interval,
}

enum Wake {
    Bytes(Option<Bytes>),
    Dispatch,
    ClockSync,
}

impl Session {
    fn new(incoming: mpsc::Receiver<Bytes>, config: &EngineConfig) -> Self {
        let now = Instant::now();
        let mut dispatch = interval_at(now + config.dispatch_interval, config.dispatch_interval);
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut clock_sync = interval_at(now + config.clock_sync_interval, config.clock_sync_interval);
        clock_sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Session {
            incoming,
            dispatch,
            clock_sync,
        }
    }

    async fn next(&mut self) -> Wake {
        tokio::select! {
            biased;

            chunk = self.incoming.recv() => Wake::Bytes(chunk),
            _ = self.dispatch.tick() => Wake::Dispatch,
            _ = self.clock_sync.tick() => Wake::ClockSync,
        }
    }
}

async fn next_wake(session: &mut Option<Session>) -> Wake {
    match session {
        Some(session) => session.next().await,
        None => std::future::pending().await,
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Task owning one protocol engine
pub struct Device {
    engine: ProtocolEngine,
    connector: Arc<dyn Connector>,
    control_rx: mpsc::Receiver<Control>,
    session: Option<Session>,
}

impl Device {
    /// Spawns the task for `device` and returns its handle
    ///
    /// Must be called from within a tokio runtime. Text is exchanged with the
    /// device through `text`; events of the device go to `events`.
    pub fn spawn(
        device: DeviceConfig,
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        text: Arc<dyn TextCodec>,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> DeviceHandle {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let name = device.name.clone();
        let task = Device {
            engine: ProtocolEngine::new(device, config, events).with_text_codec(text),
            connector,
            control_rx,
            session: None,
        };
        tokio::spawn(task.run());

        DeviceHandle { name, control_tx }
    }

    async fn run(mut self) {
        debug!(device = %self.engine.name(), "device task started");
        loop {
            let deadline = self.engine.deadline().map(|(at, _)| at);

            tokio::select! {
                biased;

                control = self.control_rx.recv() => match control {
                    Some(Control::Shutdown) | None => break,
                    Some(control) => self.handle_control(control),
                },

                wake = next_wake(&mut self.session) => self.handle_wake(wake),

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.engine.on_deadline(Instant::now());
                }
            }
        }

        self.close();
        debug!(device = %self.engine.name(), "device task stopped");
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Open(reply) => {
                let opened = self.open();
                let _ = reply.send(opened);
            }
            Control::Close => self.close(),
            Control::Enqueue(kind) => self.engine.enqueue(kind),
            Control::SetAttempts(attempts) => self.engine.set_attempts(attempts),
            Control::Status(reply) => {
                let _ = reply.send(self.engine.status());
            }
            // Handled by the loop
            Control::Shutdown => {}
        }
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Bytes(Some(chunk)) => self.engine.on_bytes(&chunk, Instant::now()),
            Wake::Bytes(None) => {
                warn!(device = %self.engine.name(), "receive stream ended");
                self.close();
            }
            Wake::Dispatch => self.engine.on_dispatch_tick(Instant::now()),
            Wake::ClockSync => self.engine.on_clock_sync(local_now()),
        }
    }

    fn open(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }

        let config = self.engine.config().clone();
        match self.connector.connect(self.engine.port(), &config.serial) {
            Ok(connection) => {
                info!(device = %self.engine.name(), port = %self.engine.port(), "connection established");
                self.engine.open(connection.writer, local_now());
                self.session = Some(Session::new(connection.incoming, &config));
                true
            }
            Err(e) => {
                self.engine.report_open_failure(&e);
                false
            }
        }
    }

    fn close(&mut self) {
        self.session = None;
        self.engine.close();
    }
}
