use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::core::{Error, Result, SerialSettings};
use super::{Connection, Connector, Transport, INCOMING_CHANNEL_CAPACITY};

#[derive(Default)]
struct Line {
    /// Sender feeding the open connection
    inject: Option<mpsc::Sender<Bytes>>,
    /// Frames written by the engine, oldest first
    written: Vec<Bytes>,
    /// Number of successful connects
    connects: usize,
}

fn lock(line: &Mutex<Line>) -> MutexGuard<'_, Line> {
    line.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process connector standing in for serial ports
///
/// Only ports attached beforehand can be opened; every attached port comes
/// with a [`MemoryPeer`] that plays the device side of the line.
#[derive(Default)]
pub struct MemoryConnector {
    lines: Mutex<HashMap<String, Arc<Mutex<Line>>>>,
}

impl MemoryConnector {
    /// Creates a connector with no ports
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `port` openable and returns its device side
    pub fn attach(&self, port: &str) -> MemoryPeer {
        let mut lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let line = lines.entry(port.to_string()).or_default().clone();
        MemoryPeer { line }
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, port: &str, _settings: &SerialSettings) -> Result<Connection> {
        let lines = self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let line = lines
            .get(port)
            .cloned()
            .ok_or_else(|| Error::transport(format!("No such port: {}", port)))?;

        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        {
            let mut state = lock(&line);
            state.inject = Some(tx);
            state.connects += 1;
        }

        Ok(Connection {
            writer: Box::new(MemoryWriter { line }),
            incoming: rx,
        })
    }
}

struct MemoryWriter {
    line: Arc<Mutex<Line>>,
}

impl Transport for MemoryWriter {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        lock(&self.line).written.push(Bytes::copy_from_slice(frame));
        Ok(())
    }
}

/// Device side of an in-memory line
#[derive(Clone)]
pub struct MemoryPeer {
    line: Arc<Mutex<Line>>,
}

impl MemoryPeer {
    /// Delivers bytes to the open connection; false when nothing is connected
    pub fn inject(&self, bytes: &[u8]) -> bool {
        match &lock(&self.line).inject {
            Some(tx) => tx.try_send(Bytes::copy_from_slice(bytes)).is_ok(),
            None => false,
        }
    }

    /// Takes every frame written so far
    pub fn take_written(&self) -> Vec<Bytes> {
        std::mem::take(&mut lock(&self.line).written)
    }

    /// Whether a connection is open and still reading
    pub fn is_connected(&self) -> bool {
        lock(&self.line)
            .inject
            .as_ref()
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Ends the received stream as a failing line would
    pub fn hang_up(&self) {
        lock(&self.line).inject = None;
    }

    /// Number of times the port was opened
    pub fn connects(&self) -> usize {
        lock(&self.line).connects
    }
}
