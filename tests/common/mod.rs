#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offline_patients::capabilities::ManualClock;
use offline_patients::{
    HandlerError, HandlerId, HandlerRegistry, MemoryStorage, OfflinePatientRecord,
    OfflinePatientStore, PatientUuid, SyncConfig, SyncCoordinator, SyncHandler, UnixTimeMs, UserId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// One outstanding `load_patient` call, resolved by the test.
pub struct LoadRequest {
    pub patient: PatientUuid,
    reply: oneshot::Sender<Result<(), HandlerError>>,
}

impl LoadRequest {
    pub fn succeed(self) {
        let _ = self.reply.send(Ok(()));
    }

    pub fn fail(self, message: &str) {
        let _ = self.reply.send(Err(HandlerError::new(message)));
    }
}

/// Handler whose loads stay pending until the test answers them.
pub struct ScriptedHandler {
    requests: mpsc::UnboundedSender<LoadRequest>,
    loads: AtomicUsize,
    removed: Mutex<Vec<PatientUuid>>,
}

impl ScriptedHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LoadRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Self {
            requests,
            loads: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
        });
        (handler, rx)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<PatientUuid> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncHandler for ScriptedHandler {
    async fn load_patient(&self, patient: &PatientUuid) -> Result<(), HandlerError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let (reply, answer) = oneshot::channel();
        self.requests
            .send(LoadRequest {
                patient: patient.clone(),
                reply,
            })
            .map_err(|_| HandlerError::new("test harness gone"))?;
        answer
            .await
            .unwrap_or_else(|_| Err(HandlerError::new("request dropped")))
    }

    fn remove_patient(&self, patient: &PatientUuid) {
        self.removed.lock().unwrap().push(patient.clone());
    }
}

pub fn patient(id: &str) -> PatientUuid {
    PatientUuid::new(id).unwrap()
}

pub fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

pub fn handler_id(id: &str) -> HandlerId {
    HandlerId::new(id).unwrap()
}

pub struct Harness {
    pub coordinator: SyncCoordinator<MemoryStorage>,
    pub registry: Arc<HandlerRegistry>,
    pub clock: Arc<ManualClock>,
}

pub fn harness() -> Harness {
    let registry = Arc::new(HandlerRegistry::new());
    let clock = Arc::new(ManualClock::new(UnixTimeMs(1_000)));
    let store = Arc::new(OfflinePatientStore::local_only(Arc::new(MemoryStorage::new())));
    let coordinator =
        SyncCoordinator::new(store, Arc::clone(&registry), clock.clone(), SyncConfig::default())
            .unwrap();
    Harness {
        coordinator,
        registry,
        clock,
    }
}

pub async fn next_request(rx: &mut mpsc::UnboundedReceiver<LoadRequest>) -> LoadRequest {
    timeout(WAIT, rx.recv())
        .await
        .expect("handler was asked to load")
        .expect("handler alive")
}

/// Waits for a snapshot satisfying `pred`.
pub async fn wait_for<F>(
    rx: &mut mpsc::UnboundedReceiver<Vec<OfflinePatientRecord>>,
    pred: F,
) -> Vec<OfflinePatientRecord>
where
    F: Fn(&[OfflinePatientRecord]) -> bool,
{
    timeout(WAIT, async {
        loop {
            let snapshot = rx.recv().await.expect("subscription alive");
            if pred(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
    .expect("expected snapshot in time")
}
