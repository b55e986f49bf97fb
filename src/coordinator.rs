//! Orchestration of offline patient sync.
//!
//! The coordinator ties store mutations to handler calls:
//!
//! * `add_patient` marks every registered handler `Loading`/`Reloading`,
//!   persists the record, then starts one load task per handler.
//! * each task reports back through `apply_outcome`, which moves that
//!   handler's state along the transition table in [`LoadState::resolve`](crate::model::LoadState::resolve).
//! * `remove_patient` drops a user's interest and, for the last user,
//!   tells every handler to clean up and deletes the record.
//!
//! Read-modify-write cycles on a record are serialized inside one
//! coordinator. Other contexts writing the same store race with
//! last-writer-wins semantics.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{Clock, SessionError, SessionProvider};
use crate::config::{ConfigError, SyncConfig};
use crate::hub::{Subscription, SubscriptionHub};
use crate::model::{
    validate_display_name, HandlerId, LoadOutcome, LoadState, OfflinePatientRecord, PatientUuid,
    Release, UserId, ValidationError,
};
use crate::offline_store::{OfflinePatientStore, PatientStorage, StoreError};
use crate::registry::HandlerRegistry;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Handler loads started by one `add_patient` or `reload_all` call.
///
/// Dropping this leaves the loads running in the background.
#[derive(Debug, Default)]
#[must_use = "await `settled()` or drop to let loads finish in the background"]
pub struct PendingLoads {
    tasks: Vec<JoinHandle<()>>,
}

impl PendingLoads {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn extend(&mut self, other: PendingLoads) {
        self.tasks.extend(other.tasks);
    }

    /// Waits until every load has reported and its outcome was applied.
    pub async fn settled(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "handler load task did not complete");
            }
        }
    }
}

struct Inner<S: PatientStorage> {
    store: Arc<OfflinePatientStore<S>>,
    registry: Arc<HandlerRegistry>,
    hub: SubscriptionHub<S>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    write_lock: Mutex<()>,
}

pub struct SyncCoordinator<S: PatientStorage> {
    inner: Arc<Inner<S>>,
}

impl<S: PatientStorage> Clone for SyncCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PatientStorage + 'static> SyncCoordinator<S> {
    pub fn new(
        store: Arc<OfflinePatientStore<S>>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let hub = SubscriptionHub::new(Arc::clone(&store));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry,
                hub,
                clock,
                config,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn store(&self) -> &Arc<OfflinePatientStore<S>> {
        &self.inner.store
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Keeps `patient` available offline for `user` and (re)loads it through
    /// every registered handler.
    ///
    /// Returns once the in-progress record is persisted; the loads continue
    /// in the background. Fails only if the record could not be written.
    #[instrument(skip_all, fields(patient = %patient, user = %user))]
    pub async fn add_patient(
        &self,
        patient: &PatientUuid,
        display_name: &str,
        user: &UserId,
    ) -> Result<PendingLoads, SyncError> {
        let display_name =
            validate_display_name(display_name, self.inner.config.max_display_name_len)?;
        let handlers = self.inner.registry.entries().await;
        let handler_ids: Vec<HandlerId> = handlers.iter().map(|(id, _)| id.clone()).collect();

        {
            let _guard = self.inner.write_lock.lock().await;
            let existing = self.inner.store.get(patient).await?;
            let is_reload = existing.is_some();
            let mut record = existing
                .unwrap_or_else(|| OfflinePatientRecord::new(patient.clone(), display_name.clone()));
            let newly_interested = record.begin_sync(user, &display_name, &handler_ids);
            self.inner.store.upsert(&record).await?;
            info!(
                is_reload,
                newly_interested,
                handlers = handler_ids.len(),
                "offline sync started"
            );
        }

        let tasks = handlers
            .into_iter()
            .map(|(handler_id, handler)| {
                let coordinator = self.clone();
                let patient = patient.clone();
                tokio::spawn(async move {
                    let outcome = match handler.load_patient(&patient).await {
                        Ok(()) => LoadOutcome::Succeeded,
                        Err(e) => {
                            warn!(patient = %patient, handler = %handler_id, error = %e, "handler load failed");
                            LoadOutcome::Failed(e.message().to_string())
                        }
                    };
                    coordinator.apply_outcome(&patient, &handler_id, outcome).await;
                })
            })
            .collect();

        Ok(PendingLoads { tasks })
    }

    /// Releases `user`'s interest in `patient`. Returns `false` if the user
    /// was not interested (or the record does not exist).
    #[instrument(skip_all, fields(patient = %patient, user = %user))]
    pub async fn remove_patient(&self, patient: &PatientUuid, user: &UserId) -> Result<bool, SyncError> {
        let _guard = self.inner.write_lock.lock().await;
        let Some(mut record) = self.inner.store.get(patient).await? else {
            debug!("no offline record to release");
            return Ok(false);
        };

        match record.release(user) {
            Release::NotInterested => {
                debug!("user was not interested in this patient");
                Ok(false)
            }
            Release::Released => {
                self.inner.store.upsert(&record).await?;
                info!(remaining = record.interested_users.len(), "released offline patient");
                Ok(true)
            }
            Release::LastUserReleased => {
                // Handler cleanup runs only after the delete went through.
                self.inner.store.delete(patient).await?;
                for (handler_id, handler) in self.inner.registry.entries().await {
                    debug!(handler = %handler_id, "removing handler data");
                    handler.remove_patient(patient);
                }
                info!("deleted offline patient");
                Ok(true)
            }
        }
    }

    /// Re-runs `add_patient` for every patient `user` keeps offline.
    #[instrument(skip_all, fields(user = %user))]
    pub async fn reload_all(&self, user: &UserId) -> Result<PendingLoads, SyncError> {
        let mut pending = PendingLoads::default();
        for record in self.inner.store.get_all(user).await {
            pending.extend(
                self.add_patient(&record.patient_uuid, &record.display_name, user)
                    .await?,
            );
        }
        Ok(pending)
    }

    pub async fn snapshot(&self, user: &UserId) -> Vec<OfflinePatientRecord> {
        self.inner.store.get_all(user).await
    }

    pub fn subscribe<F>(&self, user: &UserId, callback: F) -> Subscription
    where
        F: Fn(Vec<OfflinePatientRecord>) + Send + Sync + 'static,
    {
        self.inner.hub.subscribe(user.clone(), callback)
    }

    pub fn for_user(&self, user: UserId) -> UserScope<S> {
        UserScope {
            coordinator: self.clone(),
            user,
        }
    }

    pub async fn for_session(&self, session: &dyn SessionProvider) -> Result<UserScope<S>, SyncError> {
        let user = session.current_user().await?;
        Ok(self.for_user(user))
    }

    /// Applies one handler outcome. Outcomes for records that are gone, or
    /// for handlers no longer awaiting a load, are dropped.
    async fn apply_outcome(&self, patient: &PatientUuid, handler: &HandlerId, outcome: LoadOutcome) {
        let _guard = self.inner.write_lock.lock().await;
        let mut record = match self.inner.store.get(patient).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(patient = %patient, handler = %handler, "outcome for released patient ignored");
                return;
            }
            Err(e) => {
                warn!(patient = %patient, handler = %handler, error = %e, "could not read record to apply outcome");
                return;
            }
        };

        let now = self.inner.clock.now();
        if !record.apply_outcome(handler, &outcome, now) {
            debug!(
                patient = %patient,
                handler = %handler,
                state = record.per_handler_state.get(handler).map_or("absent", LoadState::state_name),
                "handler was not awaiting a load"
            );
            return;
        }

        if let Err(e) = self.inner.store.upsert(&record).await {
            warn!(patient = %patient, handler = %handler, error = %e, "dropping handler outcome, store write failed");
            return;
        }
        debug!(
            patient = %patient,
            handler = %handler,
            state = record.per_handler_state.get(handler).map_or("absent", LoadState::state_name),
            "handler outcome applied"
        );
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl SyncCoordinator<crate::sqlite_store::SqliteStorage> {
    /// Composition root for native hosts: opens the SQLite store named by
    /// `config`, picks a notifier for `bus`, and wires everything together.
    pub fn open(
        config: SyncConfig,
        registry: Arc<HandlerRegistry>,
        bus: Option<&crate::capabilities::BroadcastBus>,
    ) -> Result<Self, SyncError> {
        use crate::sqlite_store::SqliteStorage;

        config.validate()?;
        let storage = match &config.database_path {
            Some(path) => SqliteStorage::open(path)?,
            None => SqliteStorage::open_in_memory()?,
        };
        let notifier = crate::capabilities::select_notifier(&config, bus);
        let store = Arc::new(OfflinePatientStore::new(Arc::new(storage), notifier));
        Self::new(
            store,
            registry,
            Arc::new(crate::capabilities::SystemClock),
            config,
        )
    }
}

/// The coordinator bound to one signed-in user.
pub struct UserScope<S: PatientStorage> {
    coordinator: SyncCoordinator<S>,
    user: UserId,
}

impl<S: PatientStorage + 'static> UserScope<S> {
    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub async fn add_patient(&self, patient: &PatientUuid, display_name: &str) -> Result<PendingLoads, SyncError> {
        self.coordinator
            .add_patient(patient, display_name, &self.user)
            .await
    }

    pub async fn remove_patient(&self, patient: &PatientUuid) -> Result<bool, SyncError> {
        self.coordinator.remove_patient(patient, &self.user).await
    }

    pub async fn reload_all(&self) -> Result<PendingLoads, SyncError> {
        self.coordinator.reload_all(&self.user).await
    }

    pub async fn snapshot(&self) -> Vec<OfflinePatientRecord> {
        self.coordinator.snapshot(&self.user).await
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Vec<OfflinePatientRecord>) + Send + Sync + 'static,
    {
        self.coordinator.subscribe(&self.user, callback)
    }
}
