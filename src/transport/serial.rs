use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::{Error, Result, SerialSettings};
use super::{Connection, Connector, Transport, INCOMING_CHANNEL_CAPACITY};

const READ_CHUNK: usize = 256;

/// Connector for real serial ports
///
/// Each connection reads on a dedicated thread. Closing the connection stops
/// that thread and waits for it, which takes up to `read_poll`; the port is
/// free for reopening once the close returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl SerialConnector {
    /// Creates a serial connector
    pub fn new() -> Self {
        SerialConnector
    }
}

impl Connector for SerialConnector {
    fn connect(&self, port: &str, settings: &SerialSettings) -> Result<Connection> {
        let handle = serialport::new(port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.read_poll)
            .open()
            .map_err(|e| Error::transport(format!("Failed to open serial port {}: {}", port, e)))?;

        let reader = handle.try_clone()?;
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let name = port.to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let reader_stop = stop.clone();

        let thread = thread::Builder::new()
            .name(format!("usk-read-{}", port))
            .spawn(move || read_loop(name, reader, &reader_stop, tx))?;

        Ok(Connection {
            writer: Box::new(SerialWriter {
                port: handle,
                stop,
                reader: Some(thread),
            }),
            incoming: rx,
        })
    }
}

/// Forwards everything read from the port until the line ends, the receiver
/// goes away or `stop` is raised
fn read_loop<R: Read>(port: String, mut reader: R, stop: &AtomicBool, tx: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if tx.is_closed() || stop.load(Ordering::Acquire) {
            debug!(%port, "reader stopped");
            return;
        }
        match reader.read(&mut buf) {
            // Unplugged adapters read as end of file on some platforms
            Ok(0) => {
                warn!(%port, "serial line closed");
                return;
            }
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    debug!(%port, "reader stopped");
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(%port, error = %e, "serial read failed");
                return;
            }
        }
    }
}

struct SerialWriter {
    port: Box<dyn SerialPort>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Drop for SerialWriter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("serial reader thread panicked");
            }
        }
    }
}

impl Transport for SerialWriter {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }
}
