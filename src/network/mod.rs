//! Interface discovery and device-bound UDP sockets.
//!
//! A socket bound with `SO_BINDTODEVICE` only sees traffic from its own
//! interface, so the daemon learns a datagram's ingress interface from the
//! socket it arrived on.

use std::{fmt, io, net::Ipv4Addr, net::UdpSocket as StdUdpSocket};
use thiserror::Error;
use tokio::net::UdpSocket as TokioUdpSocket;

/// Defines all possible errors for socket operations.
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("Failed to create a new socket")]
    CreateSocket(#[source] io::Error),

    #[error("Failed to enable broadcast on socket")]
    SetBroadcast(#[source] io::Error),

    #[error("Failed to set SO_BINDTODEVICE on interface '{interface}'")]
    BindToDevice {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind socket to port {port}")]
    BindSocket {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Failed to set SO_REUSEADDR on socket")]
    SetReuseAddress(#[source] io::Error),

    #[error("Failed to set socket to non-blocking mode")]
    SetNonBlocking(#[source] io::Error),

    #[error("Failed to convert socket to TokioUdpSocket")]
    ConvertToTokio(#[source] io::Error),

    #[error("Failed to enumerate network interfaces")]
    Enumerate(#[source] io::Error),

    #[allow(dead_code)]
    #[error("This operation is not implemented on the current platform")]
    NotImplemented,
}

/// Kernel index of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub u32);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if#{}", self.0)
    }
}

/// One IPv4 address configured on a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub id: InterfaceId,
    pub name: String,
    pub address: Ipv4Addr,
    pub mask: Ipv4Addr,
}

impl LocalInterface {
    /// Whether the interface's address lies in `network/mask`.
    pub fn is_in_prefix(&self, network: Ipv4Addr, mask: Ipv4Addr) -> bool {
        network_of(self.address, mask) == network_of(network, mask)
    }
}

/// Applies `mask` to `address`.
pub fn network_of(address: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) & u32::from(mask))
}

/// First interface with an address inside `network/mask`.
pub fn find_for_prefix(
    interfaces: &[LocalInterface],
    network: Ipv4Addr,
    mask: Ipv4Addr,
) -> Option<&LocalInterface> {
    interfaces
        .iter()
        .find(|iface| iface.is_in_prefix(network, mask))
}

/// First IPv4 address configured on the interface called `name`.
pub fn find_by_name<'a>(
    interfaces: &'a [LocalInterface],
    name: &str,
) -> Option<&'a LocalInterface> {
    interfaces.iter().find(|iface| iface.name == name)
}

/// Lists every IPv4 address configured on this host.
#[cfg(target_os = "linux")]
pub fn local_interfaces() -> Result<Vec<LocalInterface>, SocketError> {
    use std::ffi::CStr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // Safe: getifaddrs only writes the list head, which is freed below.
    if unsafe { libc::getifaddrs(&mut head) } < 0 {
        return Err(SocketError::Enumerate(io::Error::last_os_error()));
    }

    let mut interfaces = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // Safe: cursor walks the list returned by getifaddrs until NULL.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_netmask.is_null() {
            continue;
        }
        if i32::from(unsafe { (*entry.ifa_addr).sa_family }) != libc::AF_INET {
            continue;
        }

        // Safe: AF_INET entries carry sockaddr_in for both address and netmask.
        let (address, mask) = unsafe {
            let addr = &*(entry.ifa_addr as *const libc::sockaddr_in);
            let mask = &*(entry.ifa_netmask as *const libc::sockaddr_in);
            (
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                Ipv4Addr::from(u32::from_be(mask.sin_addr.s_addr)),
            )
        };
        let index = unsafe { libc::if_nametoindex(entry.ifa_name) };
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();

        interfaces.push(LocalInterface {
            id: InterfaceId(index),
            name,
            address,
            mask,
        });
    }

    unsafe { libc::freeifaddrs(head) };
    Ok(interfaces)
}

#[cfg(not(target_os = "linux"))]
pub fn local_interfaces() -> Result<Vec<LocalInterface>, SocketError> {
    Err(SocketError::NotImplemented)
}

/// Creates a new `tokio::net::UdpSocket` bound to a specific network device and port.
///
/// The socket can send broadcasts and shares its port with the other
/// per-device sockets of the daemon.
///
/// # Arguments
/// * `interface` - The name of the network interface (e.g., "eth0").
/// * `port` - The port number to bind the socket to.
#[cfg(target_os = "linux")]
pub fn new_tokio_socket_bound_to_device(
    interface: &str,
    port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    use socket2::{Domain, Socket, Type};
    use std::{
        net::{SocketAddr, SocketAddrV4},
        os::fd::AsRawFd,
    };

    let socket2 =
        Socket::new(Domain::IPV4, Type::DGRAM, None).map_err(SocketError::CreateSocket)?;

    socket2
        .set_broadcast(true)
        .map_err(SocketError::SetBroadcast)?;

    // Several devices listen on the same port.
    socket2
        .set_reuse_address(true)
        .map_err(SocketError::SetReuseAddress)?;

    // Safe: valid descriptor, and the option value is the interface name buffer.
    let ret = unsafe {
        libc::setsockopt(
            socket2.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            interface.as_ptr() as *const libc::c_void,
            interface.len() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(SocketError::BindToDevice {
            interface: interface.to_string(),
            source: io::Error::last_os_error(),
        });
    }

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket2
        .bind(&addr.into())
        .map_err(|source| SocketError::BindSocket { port, source })?;

    let std_socket: StdUdpSocket = socket2.into();
    std_socket
        .set_nonblocking(true)
        .map_err(SocketError::SetNonBlocking)?;
    TokioUdpSocket::from_std(std_socket).map_err(SocketError::ConvertToTokio)
}

/// Fallback for non-Linux systems where `SO_BINDTODEVICE` is not available.
#[cfg(not(target_os = "linux"))]
pub fn new_tokio_socket_bound_to_device(
    _interface: &str,
    _port: u16,
) -> Result<TokioUdpSocket, SocketError> {
    Err(SocketError::NotImplemented)
}
