//! Datagram transport for replies.
//!
//! The server hands every reply to a [`Transport`]. [`UdpTransport`] is the
//! production implementation: a non-blocking UDP socket on port 67 set up
//! with `socket2` and driven by tokio.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::DHCP_SERVER_PORT;
use crate::packet::DhcpPacket;

pub const RECV_BUFFER_SIZE: usize = 1500;

/// Sink for outbound DHCP packets.
pub trait Transport: Send + Sync {
    /// Sends `packet` to `destination` without blocking.
    fn send(&self, packet: &DhcpPacket, destination: SocketAddr) -> Result<()>;
}

/// UDP socket bound to `0.0.0.0:67`.
///
/// Datagrams are received through tokio; replies go out through a
/// duplicate of the same socket so that `send` never waits on the reactor.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    sender: Socket,
}

impl UdpTransport {
    /// Creates the server socket. Must be called inside a tokio runtime.
    pub fn bind(config: &Config) -> Result<Self> {
        Self::bind_to(
            config,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT),
        )
    }

    /// Creates a socket bound to `address` with the server's socket options.
    pub fn bind_to(config: &Config, address: SocketAddrV4) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
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

        bind_interface(&socket, config);

        let sender = socket
            .try_clone()
            .map_err(|error| Error::Socket(format!("Failed to duplicate socket: {}", error)))?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        Ok(Self { socket, sender })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Waits for the next inbound datagram.
    pub async fn recv_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buffer).await?)
    }
}

impl Transport for UdpTransport {
    fn send(&self, packet: &DhcpPacket, destination: SocketAddr) -> Result<()> {
        let encoded = packet.encode();
        let sent = self.sender.send_to(&encoded, &destination.into())?;
        debug!("Sent {} bytes to {}", sent, destination);
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_interface(socket: &Socket, config: &Config) {
    let Some(name) = config.interface_name.as_deref() else {
        debug!(
            "No interface_name configured, listening on all interfaces (index {})",
            config.interface_index
        );
        return;
    };

    if let Err(error) = socket.bind_device(Some(name.as_bytes())) {
        warn!("Failed to bind to interface {}: {}", name, error);
    }
}

#[cfg(windows)]
fn bind_interface(socket: &Socket, config: &Config) {
    use std::os::windows::io::AsRawSocket;

    if let Err(error) = set_interface_index(socket.as_raw_socket(), config.interface_index) {
        warn!(
            "Failed to set interface index {}: {}",
            config.interface_index, error
        );
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "fuchsia",
    windows
)))]
fn bind_interface(_socket: &Socket, config: &Config) {
    warn!(
        "Interface binding is not supported on this platform, index {} ignored",
        config.interface_index
    );
}

#[cfg(windows)]
fn set_interface_index(raw_socket: std::os::windows::io::RawSocket, index: u32) -> Result<()> {
    use windows_sys::Win32::Networking::WinSock::{IPPROTO_IP, SOCKET, setsockopt};

    const IP_UNICAST_IF: i32 = 31;

    let index_bytes = index.to_be_bytes();
    let result = unsafe {
        setsockopt(
            raw_socket as SOCKET,
            IPPROTO_IP,
            IP_UNICAST_IF,
            index_bytes.as_ptr(),
            std::mem::size_of::<u32>() as i32,
        )
    };

    if result != 0 {
        return Err(Error::Socket(format!(
            "setsockopt IP_UNICAST_IF failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}
