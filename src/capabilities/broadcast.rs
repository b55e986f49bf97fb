//! Cross-context change notification.
//!
//! Several contexts (browser tabs, windows, worker processes) can share one
//! persistent store. After a local write a context publishes a
//! [`StoreChange`] on a named [`BroadcastBus`]; every *other* member of the
//! bus re-reads the store. Delivery is best effort. When no bus is available
//! [`NoopNotifier`] keeps a single context fully functional.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::offline_store::StoreChange;

/// Message carried on the bus. `origin` identifies the publishing context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSignal {
    pub origin: Uuid,
    pub change: StoreChange,
}

/// What a listener learns from the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteChange {
    Changed(StoreChange),
    /// The listener fell behind and `n` signals were lost; re-read everything.
    Missed(u64),
}

pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, change: &StoreChange);

    /// `None` when this notifier cannot receive remote signals.
    fn subscribe(&self) -> Option<RemoteChanges>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn publish(&self, _change: &StoreChange) {}

    fn subscribe(&self) -> Option<RemoteChanges> {
        None
    }
}

/// A named channel shared by every context using the same store.
#[derive(Clone)]
pub struct BroadcastBus {
    name: Arc<str>,
    sender: broadcast::Sender<ChangeSignal>,
}

impl BroadcastBus {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: Arc::from(name.into()),
            sender,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.channel_name.clone(), config.channel_capacity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for BroadcastBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastBus")
            .field("name", &self.name)
            .field("listener_count", &self.listener_count())
            .finish()
    }
}

/// One context's membership in a [`BroadcastBus`].
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    origin: Uuid,
    bus: BroadcastBus,
}

impl ChannelNotifier {
    pub fn join(bus: &BroadcastBus) -> Self {
        let origin = Uuid::new_v4();
        debug!(channel = bus.name(), %origin, "joined change channel");
        Self {
            origin,
            bus: bus.clone(),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }
}

impl ChangeNotifier for ChannelNotifier {
    fn publish(&self, change: &StoreChange) {
        let signal = ChangeSignal {
            origin: self.origin,
            change: change.clone(),
        };
        // No listeners is not an error.
        let delivered = self.bus.sender.send(signal).unwrap_or_default();
        trace!(channel = self.bus.name(), delivered, ?change, "published store change");
    }

    fn subscribe(&self) -> Option<RemoteChanges> {
        Some(RemoteChanges {
            origin: self.origin,
            receiver: self.bus.sender.subscribe(),
        })
    }
}

/// Receiving half of a [`ChannelNotifier`]; skips the owner's own signals.
#[derive(Debug)]
pub struct RemoteChanges {
    origin: Uuid,
    receiver: broadcast::Receiver<ChangeSignal>,
}

impl RemoteChanges {
    /// Waits for the next signal from another context. `None` once the bus
    /// is gone.
    pub async fn recv(&mut self) -> Option<RemoteChange> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) if signal.origin == self.origin => continue,
                Ok(signal) => return Some(RemoteChange::Changed(signal.change)),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "change listener lagged behind");
                    return Some(RemoteChange::Missed(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Picks the notifier for this environment: a channel member when cross-tab
/// propagation is enabled and a bus exists, otherwise a no-op.
pub fn select_notifier(config: &SyncConfig, bus: Option<&BroadcastBus>) -> Arc<dyn ChangeNotifier> {
    match bus {
        Some(bus) if config.cross_tab_enabled => Arc::new(ChannelNotifier::join(bus)),
        Some(_) => {
            debug!("cross-tab propagation disabled by configuration");
            Arc::new(NoopNotifier)
        }
        None => {
            debug!("no change channel available; running single-context");
            Arc::new(NoopNotifier)
        }
    }
}
