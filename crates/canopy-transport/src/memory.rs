//! In-process datagram transport
//!
//! A `MemoryNetwork` is a hub of endpoints keyed by socket address. Delivery
//! keeps per-sender order and, like UDP, silently drops datagrams to unbound
//! addresses or full receivers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use canopy_core::{CanopyError, CanopyResult};

use crate::{PacketReceiver, PacketSender};

/// First port handed out for port-0 binds
pub const EPHEMERAL_PORT_START: u16 = 49152;

struct NetworkInner {
    endpoints: HashMap<SocketAddr, PacketSender>,
    next_port: u16,
    delivered: u64,
    dropped: u64,
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        MemoryNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                endpoints: HashMap::new(),
                next_port: EPHEMERAL_PORT_START,
                delivered: 0,
                dropped: 0,
            })),
        }
    }

    /// Bind an endpoint. Port 0 picks a free ephemeral port.
    pub fn bind(
        &self,
        addr: SocketAddr,
        buffer_size: usize,
    ) -> CanopyResult<(MemoryTransport, PacketReceiver)> {
        let mut inner = self.inner.lock();
        let addr = if addr.port() == 0 {
            Self::allocate(&mut inner, addr.ip())?
        } else {
            addr
        };
        if inner.endpoints.contains_key(&addr) {
            return Err(CanopyError::Transport(format!(
                "address {} already in use",
                addr
            )));
        }

        let (tx, rx) = mpsc::channel(buffer_size);
        inner.endpoints.insert(addr, tx);
        tracing::trace!(%addr, "memory endpoint bound");

        let transport = MemoryTransport {
            network: self.clone(),
            local_addr: addr,
        };
        Ok((transport, rx))
    }

    /// Bind `127.0.0.1:port`
    pub fn bind_port(
        &self,
        port: u16,
        buffer_size: usize,
    ) -> CanopyResult<(MemoryTransport, PacketReceiver)> {
        self.bind(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            buffer_size,
        )
    }

    fn allocate(inner: &mut NetworkInner, ip: IpAddr) -> CanopyResult<SocketAddr> {
        for _ in 0..=(u16::MAX - EPHEMERAL_PORT_START) {
            let port = inner.next_port;
            inner.next_port = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            let candidate = SocketAddr::new(ip, port);
            if !inner.endpoints.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(CanopyError::Transport("no free ephemeral port".into()))
    }

    fn unbind(&self, addr: &SocketAddr) {
        self.inner.lock().endpoints.remove(addr);
        tracing::trace!(%addr, "memory endpoint released");
    }

    fn deliver(&self, from: SocketAddr, bytes: &[u8], dest: SocketAddr) {
        let mut inner = self.inner.lock();
        let sent = match inner.endpoints.get(&dest) {
            Some(tx) => tx.try_send((bytes.to_vec(), from)).is_ok(),
            None => false,
        };
        if sent {
            inner.delivered += 1;
        } else {
            inner.dropped += 1;
            tracing::trace!(%from, %dest, "memory datagram dropped");
        }
    }

    /// Whether an endpoint is currently bound at `addr`
    pub fn is_bound(&self, addr: &SocketAddr) -> bool {
        self.inner.lock().endpoints.contains_key(addr)
    }

    /// (delivered, dropped) datagram counters
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.delivered, inner.dropped)
    }
}

/// Sending half of a memory endpoint. Dropping it releases the address.
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram; never blocks
    pub fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> CanopyResult<()> {
        self.network.deliver(self.local_addr, bytes, dest);
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(&self.local_addr);
    }
}
