//! Latchkey provisioning engine
//!
//! Drives one lock from discovery to a saved WiFi configuration:
//!
//! 1. discover and connect over a [`Transport`](latchkey_ble::Transport)
//! 2. ask the lock to scan and collect its reports ([`ScanAggregator`])
//! 3. push credentials and wait for the acknowledgment
//!    ([`ExchangeCoordinator`])
//! 4. only then persist the configuration through a [`RemoteStore`]
//!
//! The UI talks to a running session through a [`SessionHandle`].

mod config;
mod error;
mod exchange;
mod reconcile;
mod scan;
mod session;
mod state;

pub use config::{DEFAULT_ACK_TIMEOUT, DEFAULT_SCAN_TIMEOUT, EngineConfig, LockId};
pub use error::{ProvisioningError, StoreError};
pub use exchange::{ExchangeCoordinator, ExchangeId, Resolution};
pub use reconcile::{RemoteConfig, RemoteStore, SaveOutcome, reconcile};
pub use scan::{NetworkObservation, ScanAggregator};
pub use session::{SessionDriver, SessionHandle, start_session};
pub use state::{ConfigDraft, ConnectionState, ControlLink, ProvisioningState, Snapshot};
