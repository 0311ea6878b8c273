//! Remote Reconciler - persists an acknowledged configuration

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{ConfigDraft, LockId, StoreError};

/// Network configuration as the remote store keeps it
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "bluetooth_name", default, skip_serializing_if = "Option::is_none")]
    pub radio_name: Option<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("radio_name", &self.radio_name)
            .finish()
    }
}

impl From<&ConfigDraft> for RemoteConfig {
    fn from(draft: &ConfigDraft) -> Self {
        Self {
            ssid: draft.ssid.clone(),
            password: draft.password.clone(),
            radio_name: draft.radio_name.clone(),
        }
    }
}

/// Where lock network configs are persisted
pub trait RemoteStore {
    /// `None` when the lock has no config yet
    fn get(&self, lock: &LockId) -> impl Future<Output = Result<Option<RemoteConfig>, StoreError>>;

    fn create(&self, lock: &LockId, config: &RemoteConfig) -> impl Future<Output = Result<(), StoreError>>;

    fn update(&self, lock: &LockId, config: &RemoteConfig) -> impl Future<Output = Result<(), StoreError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    Created,
    Updated,
}

/// Fetch the current config, then create or update it with `draft`.
///
/// A create that loses a race with another writer is retried once as an
/// update.
pub async fn reconcile<S: RemoteStore>(
    store: &S,
    lock: &LockId,
    draft: &ConfigDraft,
) -> Result<SaveOutcome, StoreError> {
    let config = RemoteConfig::from(draft);

    if store.get(lock).await?.is_some() {
        store.update(lock, &config).await?;
        info!(%lock, ssid = %config.ssid, "network config updated");
        return Ok(SaveOutcome::Updated);
    }

    match store.create(lock, &config).await {
        Ok(()) => {
            info!(%lock, ssid = %config.ssid, "network config created");
            Ok(SaveOutcome::Created)
        }
        Err(StoreError::Conflict) => {
            warn!(%lock, "network config appeared concurrently, updating instead");
            store.update(lock, &config).await?;
            Ok(SaveOutcome::Updated)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Get,
        Create,
        Update,
    }

    #[derive(Default)]
    struct Inner {
        configs: HashMap<LockId, RemoteConfig>,
        calls: Vec<Call>,
        fail_next: Vec<StoreError>,
        conflict_on_create: bool,
    }

    /// In-memory store that records every call
    #[derive(Clone, Default)]
    pub struct MemoryStore {
        inner: Rc<RefCell<Inner>>,
    }

    impl MemoryStore {
        pub fn with_config(lock: LockId, config: RemoteConfig) -> Self {
            let store = Self::default();
            store.inner.borrow_mut().configs.insert(lock, config);
            store
        }

        pub fn calls(&self) -> Vec<Call> {
            self.inner.borrow().calls.clone()
        }

        pub fn config(&self, lock: &LockId) -> Option<RemoteConfig> {
            self.inner.borrow().configs.get(lock).cloned()
        }

        /// Fail the next call with `err`
        pub fn fail_next(&self, err: StoreError) {
            self.inner.borrow_mut().fail_next.push(err);
        }

        pub fn conflict_on_create(&self) {
            self.inner.borrow_mut().conflict_on_create = true;
        }

        fn record(&self, call: Call) -> Result<(), StoreError> {
            let mut inner = self.inner.borrow_mut();
            inner.calls.push(call);
            match inner.fail_next.pop() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    impl RemoteStore for MemoryStore {
        async fn get(&self, lock: &LockId) -> Result<Option<RemoteConfig>, StoreError> {
            self.record(Call::Get)?;
            Ok(self.config(lock))
        }

        async fn create(&self, lock: &LockId, config: &RemoteConfig) -> Result<(), StoreError> {
            self.record(Call::Create)?;
            let mut inner = self.inner.borrow_mut();
            if inner.conflict_on_create || inner.configs.contains_key(lock) {
                return Err(StoreError::Conflict);
            }
            inner.configs.insert(*lock, config.clone());
            Ok(())
        }

        async fn update(&self, lock: &LockId, config: &RemoteConfig) -> Result<(), StoreError> {
            self.record(Call::Update)?;
            self.inner.borrow_mut().configs.insert(*lock, config.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{Call, MemoryStore};
    use super::*;
    use serde_json::json;

    fn lock() -> LockId {
        LockId::parse("6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11").unwrap()
    }

    fn draft(ssid: &str) -> ConfigDraft {
        ConfigDraft { ssid: ssid.into(), password: "pw".into(), radio_name: Some("Front door".into()) }
    }

    #[tokio::test]
    async fn creates_when_absent() {
        let store = MemoryStore::default();
        let outcome = reconcile(&store, &lock(), &draft("Home")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Created);
        assert_eq!(store.calls(), vec![Call::Get, Call::Create]);
        assert_eq!(store.config(&lock()).unwrap().ssid, "Home");
    }

    #[tokio::test]
    async fn updates_when_present() {
        let existing = RemoteConfig { ssid: "Old".into(), ..Default::default() };
        let store = MemoryStore::with_config(lock(), existing);
        let outcome = reconcile(&store, &lock(), &draft("Home")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Updated);
        assert_eq!(store.calls(), vec![Call::Get, Call::Update]);
        assert_eq!(store.config(&lock()).unwrap().radio_name.as_deref(), Some("Front door"));
    }

    #[tokio::test]
    async fn create_conflict_retries_as_update() {
        let store = MemoryStore::default();
        store.conflict_on_create();
        let outcome = reconcile(&store, &lock(), &draft("Home")).await.unwrap();

        assert_eq!(outcome, SaveOutcome::Updated);
        assert_eq!(store.calls(), vec![Call::Get, Call::Create, Call::Update]);
    }

    #[tokio::test]
    async fn get_failure_writes_nothing() {
        let store = MemoryStore::default();
        store.fail_next(StoreError::Unavailable("offline".into()));
        let err = reconcile(&store, &lock(), &draft("Home")).await.unwrap_err();

        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.calls(), vec![Call::Get]);
    }

    #[test]
    fn remote_payload_uses_bluetooth_name() {
        let config = RemoteConfig::from(&draft("Home"));
        assert_eq!(
            serde_json::to_value(&config).unwrap(),
            json!({"ssid": "Home", "password": "pw", "bluetooth_name": "Front door"})
        );
        assert!(!format!("{config:?}").contains("\"pw\""));
    }
}
