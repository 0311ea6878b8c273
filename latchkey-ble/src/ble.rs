//! `btleplug` implementation of the transport traits
//!
//! Discovery runs a timed scan on the first Bluetooth adapter. A connected
//! [`Peripheral`] is the link; the control channel is one characteristic on
//! it that supports notifications and writes.

use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use latchkey_proto::ble::MAX_WRITE_LEN;

use crate::{Channel, DeviceInfo, DiscoveryFilter, Notifications, Transport, TransportError};

/// How long discovery listens for advertisements
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

/// Largest single characteristic write
pub const DEFAULT_WRITE_CHUNK: usize = MAX_WRITE_LEN;

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

pub struct BleTransport {
    adapter: Adapter,
    scan_window: Duration,
    write_chunk: usize,
}

impl BleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        Ok(Self::with_adapter(get_adapter().await?))
    }

    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter, scan_window: DEFAULT_SCAN_WINDOW, write_chunk: DEFAULT_WRITE_CHUNK }
    }

    pub fn with_scan_window(mut self, scan_window: Duration) -> Self {
        self.scan_window = scan_window;
        self
    }

    /// Split outgoing frames into writes of at most `size` bytes
    pub fn with_write_chunk(mut self, size: usize) -> Self {
        self.write_chunk = size.clamp(1, MAX_WRITE_LEN);
        self
    }

    /// Advertised devices accepted by `filter`; the scan must be running
    async fn collect_devices(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<DeviceInfo>, btleplug::Error> {
        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                let device = DeviceInfo {
                    id: peripheral.address().to_string(),
                    name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                    rssi: props.rssi,
                };
                if filter.accepts(&device) {
                    devices.push(device);
                }
            }
        }
        Ok(devices)
    }

    async fn find_peripheral(&self, id: &str) -> Result<Peripheral, TransportError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::Discovery(e.to_string()))?;

        peripherals
            .into_iter()
            .find(|p| p.address().to_string() == id)
            .ok_or_else(|| TransportError::DeviceNotFound(id.to_string()))
    }
}

impl Transport for BleTransport {
    type Link = Peripheral;
    type Channel = BleChannel;

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Vec<DeviceInfo>, TransportError> {
        let discovery = |e: btleplug::Error| TransportError::Discovery(e.to_string());

        let scan_filter = ScanFilter { services: filter.services.clone() };
        self.adapter.start_scan(scan_filter).await.map_err(discovery)?;
        tokio::time::sleep(self.scan_window).await;

        let collected = self.collect_devices(filter).await;
        let stopped = self.adapter.stop_scan().await;
        let devices = collected.map_err(discovery)?;
        stopped.map_err(discovery)?;
        debug!(count = devices.len(), "discovery finished");
        Ok(devices)
    }

    async fn connect(&self, device: &DeviceInfo) -> Result<Peripheral, TransportError> {
        let connection = |e: btleplug::Error| TransportError::Connection {
            device: device.id.clone(),
            reason: e.to_string(),
        };

        let peripheral = self.find_peripheral(&device.id).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(connection)?;
        }
        peripheral.discover_services().await.map_err(connection)?;

        info!(device = %device.id, name = %device.name, "connected");
        Ok(peripheral)
    }

    async fn open_channel(
        &self,
        link: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<BleChannel, TransportError> {
        let characteristic = link
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| {
                TransportError::Channel(format!(
                    "characteristic {characteristic} not found in service {service}"
                ))
            })?;

        if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
            return Err(TransportError::Channel(format!(
                "characteristic {} does not support notifications",
                characteristic.uuid
            )));
        }

        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else if characteristic.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            return Err(TransportError::Channel(format!(
                "characteristic {} is not writable",
                characteristic.uuid
            )));
        };

        Ok(BleChannel {
            peripheral: link.clone(),
            characteristic,
            write_type,
            write_chunk: self.write_chunk,
        })
    }

    async fn disconnect(&self, link: &Peripheral) -> Result<(), TransportError> {
        if link.is_connected().await.unwrap_or(false) {
            link.disconnect().await?;
            info!(device = %link.address(), "disconnected");
        }
        Ok(())
    }
}

/// Control characteristic on a connected peripheral
pub struct BleChannel {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
    write_chunk: usize,
}

impl Channel for BleChannel {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        for chunk in bytes.chunks(self.write_chunk) {
            self.peripheral
                .write(&self.characteristic, chunk, self.write_type)
                .await
                .map_err(|e| TransportError::Write(e.to_string()))?;
        }
        debug!(len = bytes.len(), "wrote to control channel");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Notifications, TransportError> {
        let channel = |e: btleplug::Error| TransportError::Channel(e.to_string());

        // Take the stream first so nothing sent right after subscribing is missed
        let stream = self.peripheral.notifications().await.map_err(channel)?;
        self.peripheral.subscribe(&self.characteristic).await.map_err(channel)?;

        let uuid = self.characteristic.uuid;
        Ok(stream
            .filter_map(move |n| futures::future::ready((n.uuid == uuid).then_some(n.value)))
            .boxed())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        if let Err(e) = self.peripheral.unsubscribe(&self.characteristic).await {
            warn!(error = %e, "unsubscribe failed");
            return Err(TransportError::Channel(e.to_string()));
        }
        Ok(())
    }
}
