//! Canopy Wire Protocol - Binary frame format
//!
//! This crate implements the wire format for Canopy frames:
//! - Fixed header (36 bytes)
//! - Message body (handshake, interest, teardown, publication, acks)
//! - Auth tag under the network key

pub mod flags;
pub mod frame;
pub mod header;
pub mod message;

pub use flags::*;
pub use frame::*;
pub use header::*;
pub use message::*;
