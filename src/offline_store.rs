use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, instrument, warn};

use crate::capabilities::{ChangeNotifier, NoopNotifier};
use crate::model::{OfflinePatientRecord, PatientUuid, UserId};

const LOCAL_FEED_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[cfg(not(target_arch = "wasm32"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupted record {patient_uuid}: {reason}")]
    Corrupted { patient_uuid: String, reason: String },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("lock acquisition failed")]
    LockFailed,
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// A write that happened to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreChange {
    Upserted(PatientUuid),
    Deleted(PatientUuid),
}

impl StoreChange {
    pub fn patient_uuid(&self) -> &PatientUuid {
        match self {
            StoreChange::Upserted(id) | StoreChange::Deleted(id) => id,
        }
    }
}

/// Durable backend for offline patient records, keyed by patient uuid.
///
/// Writes are last-writer-wins per key; there is no merge.
#[async_trait]
pub trait PatientStorage: Send + Sync {
    async fn load_all(&self) -> Result<Vec<OfflinePatientRecord>, StoreError>;
    async fn get(&self, patient: &PatientUuid) -> Result<Option<OfflinePatientRecord>, StoreError>;
    async fn upsert(&self, record: &OfflinePatientRecord) -> Result<(), StoreError>;
    /// Returns whether a record was removed.
    async fn delete(&self, patient: &PatientUuid) -> Result<bool, StoreError>;
}

/// In-memory backend. Clones share the same map, which is how tests model
/// several contexts over one store.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    records: Arc<RwLock<BTreeMap<PatientUuid, OfflinePatientRecord>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatientStorage for MemoryStorage {
    async fn load_all(&self) -> Result<Vec<OfflinePatientRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn get(&self, patient: &PatientUuid) -> Result<Option<OfflinePatientRecord>, StoreError> {
        Ok(self.records.read().await.get(patient).cloned())
    }

    async fn upsert(&self, record: &OfflinePatientRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.patient_uuid.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, patient: &PatientUuid) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(patient).is_some())
    }
}

/// The persistent store as seen by the rest of the crate: a backend plus the
/// local change feed and the cross-context notifier.
pub struct OfflinePatientStore<S: PatientStorage> {
    storage: Arc<S>,
    notifier: Arc<dyn ChangeNotifier>,
    local: broadcast::Sender<StoreChange>,
}

impl<S: PatientStorage> OfflinePatientStore<S> {
    pub fn new(storage: Arc<S>, notifier: Arc<dyn ChangeNotifier>) -> Self {
        let (local, _) = broadcast::channel(LOCAL_FEED_CAPACITY);
        Self {
            storage,
            notifier,
            local,
        }
    }

    /// A store that never talks to other contexts.
    pub fn local_only(storage: Arc<S>) -> Self {
        Self::new(storage, Arc::new(NoopNotifier))
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn notifier(&self) -> &Arc<dyn ChangeNotifier> {
        &self.notifier
    }

    /// Records `user` is interested in. An unavailable backend yields an
    /// empty list.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn get_all(&self, user: &UserId) -> Vec<OfflinePatientRecord> {
        match self.storage.load_all().await {
            Ok(records) => records
                .into_iter()
                .filter(|record| record.is_interested(user))
                .collect(),
            Err(e) => {
                warn!(error = %e, "offline store unavailable, serving empty view");
                Vec::new()
            }
        }
    }

    pub async fn get(&self, patient: &PatientUuid) -> Result<Option<OfflinePatientRecord>, StoreError> {
        self.storage.get(patient).await
    }

    #[instrument(skip_all, fields(patient = %record.patient_uuid))]
    pub async fn upsert(&self, record: &OfflinePatientRecord) -> Result<(), StoreError> {
        self.storage.upsert(record).await?;
        self.announce(StoreChange::Upserted(record.patient_uuid.clone()));
        Ok(())
    }

    #[instrument(skip_all, fields(patient = %patient))]
    pub async fn delete(&self, patient: &PatientUuid) -> Result<bool, StoreError> {
        let removed = self.storage.delete(patient).await?;
        if removed {
            self.announce(StoreChange::Deleted(patient.clone()));
        }
        Ok(removed)
    }

    /// Feed of writes made through this store. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe_local(&self) -> broadcast::Receiver<StoreChange> {
        self.local.subscribe()
    }

    fn announce(&self, change: StoreChange) {
        self.notifier.publish(&change);
        let patient = change.patient_uuid().clone();
        let listeners = self.local.send(change).unwrap_or_default();
        debug!(patient = %patient, listeners, "store change announced");
    }
}
