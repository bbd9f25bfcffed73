//! Canopy Test Harness - multi-node scenarios over an in-process network
//!
//! This crate provides:
//! - `MeshHarness`: real nodes on a shared `MemoryNetwork`, addressed by port
//! - `RawPeer`: a frame-level endpoint for driving handshakes by hand
//! - Polling helpers for asserting on eventually-consistent state

pub mod mesh;
pub mod raw;

#[cfg(test)]
mod scenarios;

pub use mesh::*;
pub use raw::*;
