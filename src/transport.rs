//! Datagram transport used by the client and server.
//!
//! The protocol code only needs two primitives: send a datagram to an
//! address and receive the next datagram with its source. [`Transport`]
//! captures that contract and [`UdpTransport`] implements it over a tokio
//! UDP socket.

use std::future::Future;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};
use crate::message::MESSAGE_SIZE;

/// Connectionless datagram send/receive.
///
/// Delivery may be lost, duplicated or reordered; callers correlate replies
/// themselves.
pub trait Transport: Send + Sync {
    fn send(&self, bytes: &[u8], destination: SocketAddr) -> impl Future<Output = Result<()>> + Send;

    /// Waits for the next datagram. At most [`MESSAGE_SIZE`] bytes are
    /// returned.
    fn receive(&self) -> impl Future<Output = Result<(Vec<u8>, SocketAddr)>> + Send;
}

/// A UDP socket with `SO_REUSEADDR` and `SO_BROADCAST` set.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds a socket to `address`. Must be called inside a tokio runtime.
    pub fn bind(address: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        socket.bind(&address.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", address, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    async fn send(&self, bytes: &[u8], destination: SocketAddr) -> Result<()> {
        self.socket.send_to(bytes, destination).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<(Vec<u8>, SocketAddr)> {
        let mut buffer = [0u8; MESSAGE_SIZE];
        let (size, source) = self.socket.recv_from(&mut buffer).await?;
        Ok((buffer[..size].to_vec(), source))
    }
}
