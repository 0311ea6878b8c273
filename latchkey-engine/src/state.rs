//! Session data: states, the control link, the draft and snapshots

use std::fmt;

use serde::Serialize;

use latchkey_ble::DeviceInfo;

use crate::scan::NetworkObservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Disconnected,
    Discovered,
    Connecting,
    Connected,
    ScanRequested,
    AwaitingAck,
}

impl ProvisioningState {
    /// True while a control channel is open
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ProvisioningState::Connected
                | ProvisioningState::ScanRequested
                | ProvisioningState::AwaitingAck
        )
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProvisioningState::Disconnected => "disconnected",
            ProvisioningState::Discovered => "a device is selected",
            ProvisioningState::Connecting => "connecting",
            ProvisioningState::Connected => "connected",
            ProvisioningState::ScanRequested => "scanning",
            ProvisioningState::AwaitingAck => "waiting for an acknowledgment",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// The device the session is (or is about to be) talking to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlLink {
    pub device_id: String,
    pub display_name: String,
    pub connection_state: ConnectionState,
}

impl ControlLink {
    pub fn new(device: &DeviceInfo) -> Self {
        Self {
            device_id: device.id.clone(),
            display_name: device.name.clone(),
            connection_state: ConnectionState::Disconnected,
        }
    }
}

/// Network configuration being edited by the operator
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConfigDraft {
    pub ssid: String,
    pub password: String,
    pub radio_name: Option<String>,
}

impl fmt::Debug for ConfigDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigDraft")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("radio_name", &self.radio_name)
            .finish()
    }
}

/// Observable view of a session, published after every transition
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub state: ProvisioningState,
    pub link: Option<ControlLink>,
    pub devices: Vec<DeviceInfo>,
    pub networks: Vec<NetworkObservation>,
    /// The last scan finished or timed out
    pub scan_complete: bool,
    pub draft_ssid: String,
    pub radio_name: Option<String>,
    /// The device accepted a configuration the remote store has not saved
    pub unsaved: bool,
    pub status_message: String,
    pub error: Option<String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ProvisioningState::Disconnected,
            link: None,
            devices: Vec::new(),
            networks: Vec::new(),
            scan_complete: false,
            draft_ssid: String::new(),
            radio_name: None,
            unsaved: false,
            status_message: "idle".to_string(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_debug_hides_password() {
        let draft = ConfigDraft {
            ssid: "Home".into(),
            password: "hunter2".into(),
            radio_name: None,
        };
        let out = format!("{draft:?}");
        assert!(out.contains("Home"));
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn connected_states() {
        assert!(ProvisioningState::AwaitingAck.is_connected());
        assert!(ProvisioningState::ScanRequested.is_connected());
        assert!(!ProvisioningState::Connecting.is_connected());
        assert!(!ProvisioningState::Discovered.is_connected());
    }
}
