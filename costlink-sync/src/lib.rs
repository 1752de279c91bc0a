//! costlink-sync library
//!
//! Client-side synchronization with the costlink backend: one shared
//! WebSocket connection, correlated requests over it, dispatch of pushed
//! model quantities into an in-memory store, and spreadsheet-to-model code
//! matching on top of that store.
//!
//! [`SyncHub`] wires everything together; the individual services are also
//! public so they can be composed differently or tested in isolation.

pub mod api;
pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod hub;
pub mod matching;
pub mod reconcile;
pub mod router;
pub mod store;

pub use api::BackendApi;
pub use connection::{ConnectionManager, Consumer};
pub use correlator::RequestCorrelator;
pub use dispatcher::{EventDispatcher, Subscription};
pub use hub::SyncHub;
pub use matching::{MatchRecord, MatchTier, MatchingEngine};
pub use store::{QuantityRecord, QuantityStore};
