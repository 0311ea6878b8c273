use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use latchkey_ble::{CONTROL_CHAR_UUID, CONTROL_SERVICE_UUID, DiscoveryFilter};

use crate::ProvisioningError;

/// How long the lock gets to report networks
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(20);
/// How long the lock gets to acknowledge credentials
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

/// Session tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub scan_timeout: Duration,
    pub ack_timeout: Duration,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub discovery: DiscoveryFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            service_uuid: Uuid::from_u128(CONTROL_SERVICE_UUID),
            characteristic_uuid: Uuid::from_u128(CONTROL_CHAR_UUID),
            discovery: DiscoveryFilter::default(),
        }
    }
}

/// Durable identifier of a lock in the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockId(Uuid);

impl LockId {
    pub fn parse(s: &str) -> Result<Self, ProvisioningError> {
        s.trim()
            .parse::<Uuid>()
            .map(LockId)
            .map_err(|_| ProvisioningError::InvalidLockId(s.to_string()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for LockId {
    type Err = ProvisioningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl From<Uuid> for LockId {
    fn from(uuid: Uuid) -> Self {
        LockId(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.scan_timeout, Duration::from_secs(20));
        assert_eq!(config.ack_timeout, Duration::from_secs(15));
        assert_eq!(
            config.service_uuid.to_string(),
            "0000ffe0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            config.characteristic_uuid.to_string(),
            "0000ffe1-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn lock_id_must_be_a_uuid() {
        let id = LockId::parse(" 6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11 ").unwrap();
        assert_eq!(id.to_string(), "6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11");

        for bad in ["", "lock-7", "6f1c1a52"] {
            assert!(matches!(
                LockId::parse(bad),
                Err(ProvisioningError::InvalidLockId(_))
            ));
        }
    }
}
