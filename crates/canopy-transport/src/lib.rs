//! Canopy Transport Layer - datagram delivery beneath links
//!
//! This crate provides:
//! - UDP transport with a background receive loop
//! - In-process memory transport for single-process meshes and tests
//! - A `Transport` enum the node runtime sends through

pub mod memory;
pub mod udp;

pub use memory::*;
pub use udp::*;

use std::net::SocketAddr;

use tokio::sync::mpsc;

use canopy_core::CanopyResult;

/// Packet receiver channel
pub type PacketReceiver = mpsc::Receiver<(Vec<u8>, SocketAddr)>;

/// Packet sender channel
pub type PacketSender = mpsc::Sender<(Vec<u8>, SocketAddr)>;

/// Sending half of whichever transport a node was started on
pub enum Transport {
    Udp(UdpTransport),
    Memory(MemoryTransport),
}

impl Transport {
    /// Address peers reach this node at
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Transport::Udp(t) => t.local_addr(),
            Transport::Memory(t) => t.local_addr(),
        }
    }

    /// Send one datagram
    pub async fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> CanopyResult<()> {
        match self {
            Transport::Udp(t) => t.send_bytes_to(bytes, dest).await,
            Transport::Memory(t) => t.send_to(bytes, dest),
        }
    }
}

impl From<UdpTransport> for Transport {
    fn from(t: UdpTransport) -> Self {
        Transport::Udp(t)
    }
}

impl From<MemoryTransport> for Transport {
    fn from(t: MemoryTransport) -> Self {
        Transport::Memory(t)
    }
}
