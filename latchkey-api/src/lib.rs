//! Latchkey REST API client
//!
//! [`ApiClient`] attaches bearer tokens, refreshes them on a 401 and
//! implements the engine's [`RemoteStore`] over the lock network config
//! endpoints.

mod client;
mod error;

pub use client::{ApiClient, Tokens};
pub use error::ApiError;

use latchkey_engine::{LockId, RemoteConfig, RemoteStore, StoreError};

impl RemoteStore for ApiClient {
    async fn get(&self, lock: &LockId) -> Result<Option<RemoteConfig>, StoreError> {
        Ok(self.get_network_config(lock).await?)
    }

    async fn create(&self, lock: &LockId, config: &RemoteConfig) -> Result<(), StoreError> {
        Ok(self.create_network_config(lock, config).await?)
    }

    async fn update(&self, lock: &LockId, config: &RemoteConfig) -> Result<(), StoreError> {
        Ok(self.update_network_config(lock, config).await?)
    }
}
