//! Registry of data-sync handlers.
//!
//! Each feature that keeps patient data offline (vitals, forms, orders, ...)
//! registers one [`SyncHandler`] at startup. The registry lives only as long
//! as the process; it is rebuilt on every start and never persisted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::model::{HandlerId, PatientUuid};

/// Failure reported by a handler for one load call. Only the message is
/// kept; it ends up in the handler's `LoadState`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Keeps one domain of patient data available offline.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Fetches and caches this handler's data for `patient`.
    ///
    /// May be called again for the same patient while an earlier call is
    /// still running; de-duplication is up to the handler.
    async fn load_patient(&self, patient: &PatientUuid) -> Result<(), HandlerError>;

    /// Drops cached data once no user on this device wants `patient`.
    /// Long cleanups should be spawned rather than done inline.
    fn remove_patient(&self, patient: &PatientUuid);
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<HandlerId, Arc<dyn SyncHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `id`, replacing any previous handler with
    /// the same id.
    pub async fn register(&self, id: HandlerId, handler: Arc<dyn SyncHandler>) {
        let replaced = self.handlers.write().await.insert(id.clone(), handler);
        if replaced.is_some() {
            info!(handler = %id, "replaced sync handler");
        } else {
            debug!(handler = %id, "registered sync handler");
        }
    }

    pub async fn list_ids(&self) -> Vec<HandlerId> {
        self.handlers.read().await.keys().cloned().collect()
    }

    pub async fn get(&self, id: &HandlerId) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.read().await.get(id).cloned()
    }

    /// Snapshot of every registered handler, in id order.
    pub async fn entries(&self) -> Vec<(HandlerId, Arc<dyn SyncHandler>)> {
        self.handlers
            .read()
            .await
            .iter()
            .map(|(id, handler)| (id.clone(), Arc::clone(handler)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<String> = self
            .handlers
            .try_read()
            .map(|handlers| handlers.keys().map(ToString::to_string).collect())
            .unwrap_or_default();
        f.debug_struct("HandlerRegistry").field("handlers", &ids).finish()
    }
}
