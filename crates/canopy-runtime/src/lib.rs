//! Canopy Runtime - nodes, their event loop and ambient plumbing
//!
//! A host program creates a `Node`, provisions its `KeyStore`, starts it on
//! UDP or an in-process `MemoryNetwork`, then links, subscribes and
//! publishes. Every node runs one event loop task:
//! 1. Apply handle commands (subscribe, publish, link, ...)
//! 2. Authenticate and dispatch incoming frames
//! 3. Route publications: dedup, deliver locally, forward by interest
//! 4. On each tick, expire handshakes, resend unacknowledged interest and
//!    age out the dedup cache

mod actor;
pub mod config;
pub mod event;
pub mod logging;
pub mod node;

pub use config::*;
pub use event::*;
pub use logging::*;
pub use node::*;

pub use canopy_core::{
    AckInfo, CanopyError, CanopyResult, KeyId, NodeId, PubId, PublicationId, PublicationMeta,
    SubscriptionId, Topic, TopicPattern,
};
pub use canopy_crypto::KeyStore;
pub use canopy_routing::{LinkDirection, LinkId, LinkState};
pub use canopy_transport::MemoryNetwork;
