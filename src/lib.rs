//! Offline patient synchronization.
//!
//! Keeps a device-local set of patients available offline. Users on the
//! device mark patients they care about; a [`SyncCoordinator`] then drives
//! every registered [`SyncHandler`] to fetch its slice of that patient's
//! data and records per-handler progress as a [`LoadState`]. The resulting
//! [`OfflinePatientRecord`]s live in a persistent store shared by every
//! context on the device and are pushed to subscribers as they change.
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_patients::{HandlerRegistry, PatientUuid, SyncConfig, SyncCoordinator, UserId};
//!
//! # async fn run() -> Result<(), offline_patients::SyncError> {
//! let registry = Arc::new(HandlerRegistry::new());
//! let coordinator = SyncCoordinator::open(SyncConfig::default(), registry, None)?;
//! let user = UserId::new("user-1")?;
//!
//! let loads = coordinator
//!     .add_patient(&PatientUuid::new("patient-1")?, "Jane Doe", &user)
//!     .await?;
//! loads.settled().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod coordinator;
pub mod hub;
pub mod model;
pub mod offline_store;
pub mod registry;

#[cfg(not(target_arch = "wasm32"))]
pub mod sqlite_store;

pub use capabilities::{
    BroadcastBus, ChangeNotifier, ChannelNotifier, Clock, NoopNotifier, SessionError,
    SessionProvider, SystemClock,
};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{PendingLoads, SyncCoordinator, SyncError, UserScope};
pub use hub::Subscription;
pub use model::{
    HandlerId, HandlerStatus, LoadState, OfflinePatientRecord, PatientUuid, SyncStatus,
    UnixTimeMs, UserId, ValidationError,
};
pub use offline_store::{
    MemoryStorage, OfflinePatientStore, PatientStorage, StoreChange, StoreError,
};
pub use registry::{HandlerError, HandlerRegistry, SyncHandler};

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite_store::SqliteStorage;
