//! Name-keyed collection of device drivers
//!
//! The registry is an actor: one task owns the map of devices and serves
//! requests from any number of [`RegistryHandle`] clones in order. Each
//! device gets a forwarding task that tags its events with the device name
//! and merges them into the single application-facing channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::core::{DeviceConfig, DeviceStatus, EngineConfig, Error, Result};
use crate::device::{Device, DeviceHandle};
use crate::protocol::{CommandKind, DeviceEvent};
use crate::transport::Connector;
use crate::util::{Cp1251, TextCodec};

/// Capacity of the request channel of the registry task
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// Outcome of an add request
    Added {
        /// Device name
        device: String,
        /// False when the name was already taken
        added: bool,
    },

    /// Outcome of a remove request
    Removed {
        /// Device name
        device: String,
        /// False when no such device existed
        removed: bool,
    },

    /// Event raised by one device
    Device {
        /// Device name
        device: String,
        /// The event itself
        event: DeviceEvent,
    },
}

/// Summary of one registered device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Serial port name
    pub port: String,
    /// Device status at the time of the snapshot
    pub status: DeviceStatus,
}

#[derive(Debug)]
enum Request {
    Add {
        device: DeviceConfig,
        reply: oneshot::Sender<bool>,
    },
    Remove {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    RemoveAll {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<DeviceInfo>>,
    },
    Open {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Close {
        name: String,
    },
    Enqueue {
        name: String,
        kind: CommandKind,
    },
}

/// Handle for talking to the registry task
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    request_tx: mpsc::Sender<Request>,
}

impl RegistryHandle {
    /// Registers a device; false if the name is taken
    pub async fn add(&self, name: impl Into<String>, port: impl Into<String>, address: u16) -> Result<bool> {
        let device = DeviceConfig::new(name, port, address);
        self.call(|reply| Request::Add { device, reply }).await
    }

    /// Closes and forgets a device; false if there was none
    pub async fn remove(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.call(|reply| Request::Remove { name, reply }).await
    }

    /// Closes and forgets every device
    pub async fn remove_all(&self) -> Result<()> {
        self.call(|reply| Request::RemoveAll { reply }).await
    }

    /// Lists registered devices sorted by name
    pub async fn snapshot(&self) -> Result<Vec<DeviceInfo>> {
        self.call(|reply| Request::Snapshot { reply }).await
    }

    /// Opens a device; false if it is unknown or could not be opened
    pub async fn open(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.call(|reply| Request::Open { name, reply }).await
    }

    /// Closes a device
    pub async fn close(&self, name: impl Into<String>) -> Result<()> {
        self.send(Request::Close { name: name.into() }).await
    }

    /// Queues a clock update for a device
    pub async fn send_time(&self, name: impl Into<String>, at: NaiveDateTime) -> Result<()> {
        self.enqueue(name, CommandKind::SetClock { at }).await
    }

    /// Queues a text message for a device
    pub async fn send_message(&self, name: impl Into<String>, text: impl Into<String>) -> Result<()> {
        self.enqueue(name, CommandKind::TextMessage { text: text.into() }).await
    }

    /// Queues a full reset of a device
    pub async fn reset(&self, name: impl Into<String>) -> Result<()> {
        self.enqueue(name, CommandKind::Reset).await
    }

    /// Queues an actuator switch on a device
    pub async fn change_relay(
        &self,
        name: impl Into<String>,
        ray: u8,
        node: u8,
        sensor: u8,
        on: bool,
        sensor_name: impl Into<String>,
    ) -> Result<()> {
        let kind = CommandKind::ChangeRelay {
            ray,
            node,
            sensor,
            on,
            sensor_name: sensor_name.into(),
        };
        self.enqueue(name, kind).await
    }

    /// Queues a low-voltage output switch on a device
    pub async fn change_voltage(&self, name: impl Into<String>, output: u8, on: bool) -> Result<()> {
        self.enqueue(name, CommandKind::ChangeVoltage { output, on }).await
    }

    async fn enqueue(&self, name: impl Into<String>, kind: CommandKind) -> Result<()> {
        self.send(Request::Enqueue {
            name: name.into(),
            kind,
        })
        .await
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(request(tx)).await?;
        rx.await
            .map_err(|_| Error::channel_closed("registry dropped the request"))
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::channel_closed("registry is no longer running"))
    }
}

struct Entry {
    handle: DeviceHandle,
    port: String,
}

/// Registry task state
pub struct Registry {
    devices: HashMap<String, Entry>,
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    text: Arc<dyn TextCodec>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
    request_rx: mpsc::Receiver<Request>,
}

impl Registry {
    /// Spawns the registry task
    ///
    /// Returns the handle and the receiver of all device and registry
    /// events. The task stops, shutting every device down, once all handles
    /// are dropped.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: EngineConfig,
    ) -> Result<(RegistryHandle, mpsc::UnboundedReceiver<RegistryEvent>)> {
        Self::spawn_with_text_codec(connector, config, Arc::new(Cp1251))
    }

    /// Spawns the registry task for devices speaking another codepage
    pub fn spawn_with_text_codec(
        connector: Arc<dyn Connector>,
        config: EngineConfig,
        text: Arc<dyn TextCodec>,
    ) -> Result<(RegistryHandle, mpsc::UnboundedReceiver<RegistryEvent>)> {
        config.validate()?;

        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Registry {
            devices: HashMap::new(),
            connector,
            config,
            text,
            events_tx,
            request_rx,
        };
        tokio::spawn(registry.run());

        Ok((RegistryHandle { request_tx }, events_rx))
    }

    async fn run(mut self) {
        while let Some(request) = self.request_rx.recv().await {
            self.handle(request).await;
        }

        debug!("registry handles dropped, shutting devices down");
        self.remove_all(false).await;
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Add { device, reply } => {
                let _ = reply.send(self.add(device));
            }
            Request::Remove { name, reply } => {
                let removed = self.remove(&name).await;
                let _ = reply.send(removed);
            }
            Request::RemoveAll { reply } => {
                self.remove_all(true).await;
                let _ = reply.send(());
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            Request::Open { name, reply } => {
                let opened = match self.lookup(&name) {
                    Some(handle) => handle.open().await.unwrap_or(false),
                    None => false,
                };
                let _ = reply.send(opened);
            }
            Request::Close { name } => {
                if let Some(handle) = self.lookup(&name) {
                    let _ = handle.close().await;
                }
            }
            Request::Enqueue { name, kind } => {
                if let Some(handle) = self.lookup(&name) {
                    let _ = handle.enqueue(kind).await;
                }
            }
        }
    }

    fn add(&mut self, device: DeviceConfig) -> bool {
        let name = device.name.clone();
        let added = !self.devices.contains_key(&name);

        if added {
            let port = device.port.clone();
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = Device::spawn(
                device,
                self.config.clone(),
                self.connector.clone(),
                self.text.clone(),
                tx,
            );
            tokio::spawn(forward(name.clone(), rx, self.events_tx.clone()));
            info!(device = %name, %port, "device registered");
            self.devices.insert(name.clone(), Entry { handle, port });
        } else {
            debug!(device = %name, "device name already registered");
        }

        self.notify(RegistryEvent::Added { device: name, added });
        added
    }

    async fn remove(&mut self, name: &str) -> bool {
        let removed = match self.devices.remove(name) {
            Some(entry) => {
                // Shutdown closes the transport before the task exits
                let _ = entry.handle.shutdown().await;
                info!(device = %name, "device removed");
                true
            }
            None => {
                debug!(device = %name, "no such device to remove");
                false
            }
        };

        self.notify(RegistryEvent::Removed {
            device: name.to_string(),
            removed,
        });
        removed
    }

    async fn remove_all(&mut self, notify: bool) {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        for name in names {
            if notify {
                self.remove(&name).await;
            } else if let Some(entry) = self.devices.remove(&name) {
                let _ = entry.handle.shutdown().await;
            }
        }
    }

    async fn snapshot(&self) -> Vec<DeviceInfo> {
        let entries: Vec<(String, String, DeviceHandle)> = self
            .devices
            .iter()
            .map(|(name, entry)| (name.clone(), entry.port.clone(), entry.handle.clone()))
            .collect();

        let mut infos = Vec::with_capacity(entries.len());
        for (name, port, handle) in entries {
            // A device task that is gone counts as closed
            let status = handle.status().await.unwrap_or(DeviceStatus::Closed);
            infos.push(DeviceInfo { name, port, status });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn lookup(&self, name: &str) -> Option<DeviceHandle> {
        let handle = self.devices.get(name).map(|entry| entry.handle.clone());
        if handle.is_none() {
            debug!(device = %name, "request for unknown device ignored");
        }
        handle
    }

    fn notify(&self, event: RegistryEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Tags events of one device with its name until the device task ends
async fn forward(
    name: String,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
    events_tx: mpsc::UnboundedSender<RegistryEvent>,
) {
    while let Some(event) = rx.recv().await {
        let tagged = RegistryEvent::Device {
            device: name.clone(),
            event,
        };
        if events_tx.send(tagged).is_err() {
            break;
        }
    }
}
