//! Latchkey BLE transport
//!
//! The provisioning engine talks to a lock through the [`Transport`] and
//! [`Channel`] traits. [`ble::BleTransport`] implements them on top of
//! `btleplug`; the `mock` feature adds an in-memory implementation for
//! tests.
//!
//! # Example
//!
//! ```ignore
//! use latchkey_ble::{ble::BleTransport, Channel, DiscoveryFilter, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = BleTransport::new().await?;
//!     let devices = transport.discover(&DiscoveryFilter::default()).await?;
//!     for device in &devices {
//!         println!("{} ({})", device.name, device.id);
//!     }
//!     Ok(())
//! }
//! ```

use std::future::Future;

use futures::stream::BoxStream;
use uuid::Uuid;

pub mod ble;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use latchkey_proto::ble::{CONTROL_CHAR_UUID, CONTROL_SERVICE_UUID, DEVICE_NAME_PREFIX};

/// Raw notification payloads, one item per BLE notification
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    /// Opaque transport identifier (the BLE address)
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

impl DeviceInfo {
    /// Match "Latchkey-xxx" or "nimble [Latchkey-xxx]" style names
    pub fn is_lock(&self) -> bool {
        self.name.starts_with(DEVICE_NAME_PREFIX) || self.name.contains(&format!("[{DEVICE_NAME_PREFIX}"))
    }

    /// True if `target` is part of the name or the identifier
    pub fn matches(&self, target: &str) -> bool {
        self.name.contains(target) || self.id.contains(target)
    }
}

/// Which devices discovery should report
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Only report devices whose name or id contains this
    pub name_contains: Option<String>,
    /// Only report devices advertising one of these services (empty = any)
    pub services: Vec<Uuid>,
}

impl DiscoveryFilter {
    pub fn accepts(&self, device: &DeviceInfo) -> bool {
        match &self.name_contains {
            Some(target) => device.matches(target),
            None => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("device discovery failed: {0}")]
    Discovery(String),
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("could not connect to {device}: {reason}")]
    Connection { device: String, reason: String },
    #[error("control channel unavailable: {0}")]
    Channel(String),
    #[error("write to control channel failed: {0}")]
    Write(String),
    #[error("connection to the device was lost")]
    LinkLost,
    #[error(transparent)]
    Bluetooth(#[from] btleplug::Error),
}

/// Radio stack capability used by the provisioning engine
///
/// `disconnect` must be safe to call more than once and on a link that is
/// already gone.
pub trait Transport {
    /// Handle to one connected device
    type Link;
    type Channel: Channel;

    fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> impl Future<Output = Result<Vec<DeviceInfo>, TransportError>>;

    fn connect(&self, device: &DeviceInfo) -> impl Future<Output = Result<Self::Link, TransportError>>;

    fn open_channel(
        &self,
        link: &Self::Link,
        service: Uuid,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<Self::Channel, TransportError>>;

    fn disconnect(&self, link: &Self::Link) -> impl Future<Output = Result<(), TransportError>>;
}

/// Bidirectional control channel on one characteristic
///
/// `unsubscribe` must be safe to call more than once.
pub trait Channel {
    fn write(&self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>>;

    /// Start notifications; the stream ends when the link goes away
    fn subscribe(&self) -> impl Future<Output = Result<Notifications, TransportError>>;

    fn unsubscribe(&self) -> impl Future<Output = Result<(), TransportError>>;
}
