//! Datagram transport used by the session actors.
//!
//! Sessions are written against [`Transport`] so the actor never names a
//! socket type; the engine itself always uses [`UdpTransport`].

use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::net::SocketAddr;
use tokio::net::UdpSocket;

/// Marker trait for address types used by [`Transport`] implementations.
pub trait Addr: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + Debug + Display + 'static> Addr for T {}

/// Async datagram transport.
pub trait Transport: Send + Sync + 'static {
    type Addr: Addr;

    /// Send `buf` to `target`, returning the number of bytes written.
    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: &'a Self::Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    /// Receive a datagram into `buf`, returning `(bytes_read, source_address)`.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, Self::Addr)>> + Send + 'a;

    fn local_addr(&self) -> io::Result<Self::Addr>;
}

/// [`Transport`] backed by a `tokio::net::UdpSocket`.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Bind an ephemeral port on the wildcard address of `remote`'s family.
    pub async fn bind_for(remote: &SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        Self::bind(local).await
    }
}

impl Transport for UdpTransport {
    type Addr = SocketAddr;

    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
