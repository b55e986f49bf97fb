//! Fan-out of per-user snapshots to subscribers.
//!
//! Every subscriber gets its own task. The task delivers the current
//! snapshot straight away, then waits for a local write or a remote change
//! signal, drains whatever else queued up meanwhile, re-reads the store and
//! delivers again. Bursts of writes may collapse into one delivery, but the
//! delivery always happens after the last write it covers.

use std::sync::Arc;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::capabilities::{RemoteChange, RemoteChanges};
use crate::model::{OfflinePatientRecord, UserId};
use crate::offline_store::{OfflinePatientStore, PatientStorage};

/// Active subscription. Dropping it, or calling [`Subscription::unsubscribe`],
/// stops delivery.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Wake {
    Changed,
    RemoteClosed,
    Closed,
}

pub struct SubscriptionHub<S: PatientStorage> {
    store: Arc<OfflinePatientStore<S>>,
}

impl<S: PatientStorage> Clone for SubscriptionHub<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: PatientStorage + 'static> SubscriptionHub<S> {
    pub fn new(store: Arc<OfflinePatientStore<S>>) -> Self {
        Self { store }
    }

    /// Calls `callback` with `user`'s snapshot now and after every change.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, user: UserId, callback: F) -> Subscription
    where
        F: Fn(Vec<OfflinePatientRecord>) + Send + Sync + 'static,
    {
        // Subscribe before the first read so no write can slip in between.
        let mut local = self.store.subscribe_local();
        let mut remote = self.store.notifier().subscribe();
        let store = Arc::clone(&self.store);

        let task = tokio::spawn(async move {
            callback(store.get_all(&user).await);

            loop {
                let wake = tokio::select! {
                    msg = local.recv() => match msg {
                        Ok(_) | Err(RecvError::Lagged(_)) => Wake::Changed,
                        Err(RecvError::Closed) => Wake::Closed,
                    },
                    msg = next_remote(&mut remote) => match msg {
                        Some(change) => {
                            trace!(?change, "remote store change");
                            Wake::Changed
                        }
                        None => Wake::RemoteClosed,
                    },
                };

                match wake {
                    Wake::Closed => break,
                    Wake::RemoteClosed => {
                        debug!("change channel closed; continuing with local changes only");
                        remote = None;
                        continue;
                    }
                    Wake::Changed => {}
                }

                loop {
                    match local.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }

                callback(store.get_all(&user).await);
            }
        });

        Subscription { task }
    }
}

async fn next_remote(remote: &mut Option<RemoteChanges>) -> Option<RemoteChange> {
    match remote {
        Some(changes) => changes.recv().await,
        None => std::future::pending().await,
    }
}
