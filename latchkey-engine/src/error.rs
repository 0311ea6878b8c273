use std::time::Duration;

use latchkey_ble::TransportError;

use crate::state::ProvisioningState;

/// Failure reported by a [`RemoteStore`](crate::RemoteStore)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Create raced with another writer and the config now exists
    #[error("a network config for this lock already exists")]
    Conflict,
    #[error("not authorized: {0}")]
    Unauthorized(String),
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no acknowledgment from the device within {}s", .0.as_secs())]
    ExchangeTimeout(Duration),

    #[error("device rejected the configuration: {0}")]
    DeviceRejected(String),

    #[error("device configured, but server save failed: {0}")]
    Persistence(#[source] StoreError),

    #[error("invalid lock id {0:?}")]
    InvalidLockId(String),

    #[error("another operation is in progress")]
    Busy,

    #[error("a credential exchange is already waiting for an acknowledgment")]
    ExchangeInProgress,

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ProvisioningState,
    },

    #[error("device {0} was not found by discovery")]
    UnknownDevice(String),

    #[error("network {0:?} was not reported by the last scan")]
    UnknownNetwork(String),

    #[error("network name must not be empty")]
    EmptySsid,

    #[error("no acknowledged configuration is waiting to be saved")]
    NothingToSave,

    #[error("operation cancelled by teardown")]
    Cancelled,

    #[error("provisioning session has ended")]
    SessionClosed,

    #[error("could not encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProvisioningError {
    /// False only for conditions a retry in the same session cannot fix
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ProvisioningError::InvalidLockId(_) | ProvisioningError::SessionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_id_and_closed_session_are_fatal() {
        assert!(!ProvisioningError::InvalidLockId("x".into()).is_recoverable());
        assert!(!ProvisioningError::SessionClosed.is_recoverable());
        assert!(ProvisioningError::Transport(TransportError::LinkLost).is_recoverable());
        assert!(ProvisioningError::ExchangeTimeout(Duration::from_secs(15)).is_recoverable());
        assert!(ProvisioningError::Persistence(StoreError::Conflict).is_recoverable());
    }

    #[test]
    fn persistence_error_reads_as_partial_success() {
        let err = ProvisioningError::Persistence(StoreError::Unavailable("503".into()));
        assert_eq!(
            err.to_string(),
            "device configured, but server save failed: remote store unavailable: 503"
        );
    }
}
