//! Latchkey wire protocol - messages exchanged with a lock over BLE
//!
//! The client sends [`Command`]s and the lock answers with
//! [`DeviceMessage`]s. Both directions travel as length-prefixed JSON
//! frames, see [`frame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod ble;
pub mod frame;

pub use frame::{FrameDecoder, Frames, MAX_FRAME_LEN, decode_stream, encode};

pub const ACK_OK: &str = "ok";

/// Errors for device input that was framed correctly but is not a usable
/// message. These are logged and dropped, never fatal to a session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[source] serde_json::Error),
}

/// Command sent by the client
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Ask the lock to scan for WiFi networks
    ScanWifi,
    /// Ask the lock to join a WiFi network
    SetWifi { ssid: String, password: String },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::ScanWifi => f.write_str("ScanWifi"),
            Command::SetWifi { ssid, .. } => f
                .debug_struct("SetWifi")
                .field("ssid", ssid)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl Command {
    /// Encode this command as a frame
    pub fn to_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        encode(self)
    }
}

/// One network as reported by the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkReport {
    pub ssid: String,
    /// Signal strength in dBm, absent when the firmware did not measure it
    #[serde(default)]
    pub rssi: Option<i32>,
}

/// Acknowledgment of a `set_wifi` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self { result: ACK_OK.to_string(), message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { result: "error".to_string(), message: Some(message.into()) }
    }

    pub fn is_ok(&self) -> bool {
        self.result == ACK_OK
    }
}

/// Message sent by the lock
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// A batch of networks; a scan may produce any number of these
    ScanResult(Vec<NetworkReport>),
    /// The lock finished scanning
    ScanFinished,
    /// Response to `set_wifi`
    Ack(Ack),
    /// Well-formed JSON of a type this client does not know
    Unknown(Value),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Known {
    ScanResult { networks: Vec<NetworkReport> },
    ScanFinished,
    Ack(Ack),
}

impl DeviceMessage {
    /// Classify a decoded frame payload.
    ///
    /// Objects with an unrecognised (or missing) `type` become
    /// [`DeviceMessage::Unknown`]; a recognised type with the wrong shape is
    /// a [`ProtocolError`].
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind @ ("scan_result" | "scan_finished" | "ack")) => kind.to_string(),
            _ => return Ok(DeviceMessage::Unknown(value)),
        };

        let known = serde_json::from_value::<Known>(value)
            .map_err(|source| ProtocolError::Malformed { kind, source })?;

        Ok(match known {
            Known::ScanResult { networks } => DeviceMessage::ScanResult(networks),
            Known::ScanFinished => DeviceMessage::ScanFinished,
            Known::Ack(ack) => DeviceMessage::Ack(ack),
        })
    }

    /// Parse a raw JSON payload (without framing)
    pub fn from_slice(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value = serde_json::from_slice(payload).map_err(ProtocolError::InvalidJson)?;
        Self::from_value(value)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceMessage::ScanResult(_) => "scan_result",
            DeviceMessage::ScanFinished => "scan_finished",
            DeviceMessage::Ack(_) => "ack",
            DeviceMessage::Unknown(_) => "unknown",
        }
    }
}
