//! UDP datagrams for links between processes

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use canopy_core::{CanopyError, CanopyResult};
use canopy_wire::MAX_FRAME_SIZE;

use crate::PacketReceiver;

/// UDP transport for Canopy
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> CanopyResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| CanopyError::Transport(e.to_string()))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| CanopyError::Transport(e.to_string()))?;

        Ok(UdpTransport {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Bind and start the background receive loop in one step
    pub async fn bind_with_receiver(
        addr: SocketAddr,
        buffer_size: usize,
    ) -> CanopyResult<(Self, PacketReceiver)> {
        let transport = Self::bind(addr).await?;
        let rx = start_receive_loop(transport.socket(), buffer_size);
        Ok((transport, rx))
    }

    /// Address actually bound, with the chosen port when 0 was asked
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send_bytes_to(&self, bytes: &[u8], dest: SocketAddr) -> CanopyResult<()> {
        self.socket
            .send_to(bytes, dest)
            .await
            .map_err(|e| CanopyError::Transport(e.to_string()))?;
        Ok(())
    }

    /// Shared socket handle, for the receive loop
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

/// Start a background receive loop.
///
/// The loop ends when the receiver is dropped, releasing its socket handle.
pub fn start_receive_loop(socket: Arc<UdpSocket>, buffer_size: usize) -> PacketReceiver {
    let (tx, rx) = mpsc::channel(buffer_size);

    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => {
                        let packet = buf[..len].to_vec();
                        if tx.send((packet, addr)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "udp receive failed");
                    }
                },
            }
        }
        tracing::debug!("UDP receive loop stopped");
    });

    rx
}
