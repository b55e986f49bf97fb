//! Environment capabilities injected at the composition root.
//!
//! Everything the sync core needs from its host that may or may not exist
//! (a cross-context channel, a signed-in session, wall-clock time) sits
//! behind a trait here so hosts and tests can swap implementations.

mod broadcast;
mod clock;
mod session;

pub use self::broadcast::{
    select_notifier, BroadcastBus, ChangeNotifier, ChangeSignal, ChannelNotifier, NoopNotifier,
    RemoteChange, RemoteChanges,
};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::session::{SessionError, SessionProvider, StaticSession};
