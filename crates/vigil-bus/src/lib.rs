//! vigil bus - publish/subscribe coordination between kernel components
//!
//! Components publish typed events without knowing who listens. Each
//! subscriber gets its own bounded inbox and delivery task; the bus also
//! keeps a bounded history for replay and audit.

pub mod bus;
pub mod event;

pub use bus::{BusConfig, BusStats, EventBus, EventHandler, SubscriptionHandle};
pub use event::{
    Decision, DecisionDetail, Event, EventFilter, EventKind, EventPayload, Priority,
    QuarantineAction,
};
