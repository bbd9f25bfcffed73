//! Canopy Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout the Canopy overlay:
//! - Identifiers (NodeId, PubId, KeyId, SubscriptionId)
//! - Topics, subscription patterns and the topic matcher
//! - Publication metadata
//! - The error taxonomy shared by every layer

pub mod error;
pub mod id;
pub mod publication;
pub mod topic;

pub use error::*;
pub use id::*;
pub use publication::*;
pub use topic::*;
