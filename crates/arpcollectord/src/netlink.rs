//! rtnetlink socket delivering IPv4 neighbor events
//!
//! Async receive via tokio `AsyncFd`, with a blocking-free dump request for
//! the initial neighbor table.

use arp_types::MacAddress;
use std::net::Ipv4Addr;

/// Kernel NUD_* neighbor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    NoArp,
    Permanent,
    Unknown,
}

impl NeighborState {
    /// Create from kernel NUD_* value
    pub fn from_kernel(state: u16) -> Self {
        match state {
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            0x40 => Self::NoArp,
            0x80 => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// The kernel holds a usable MAC for the address
    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            Self::Reachable | Self::Stale | Self::Delay | Self::Probe | Self::Permanent
        )
    }

    /// Resolution failed or has not completed
    #[inline]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Incomplete | Self::Failed)
    }
}

/// Kind of neighbor message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborEventKind {
    /// RTM_NEWNEIGH, also used for dump replies
    New,
    /// RTM_DELNEIGH
    Delete,
}

/// One IPv4 neighbor message from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEvent {
    pub kind: NeighborEventKind,
    pub ifindex: u32,
    pub ip: Ipv4Addr,
    /// Zero when the kernel sent no link-layer address
    pub mac: MacAddress,
    pub state: NeighborState,
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{NeighborEvent, NeighborEventKind, NeighborState};
    use crate::error::{CollectorError, Result};
    use arp_types::MacAddress;
    use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
    use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, instrument, trace, warn};

    /// Netlink group for neighbor notifications (RTNLGRP_NEIGH = 3)
    const RTNLGRP_NEIGH: u32 = 3;

    /// Socket receive buffer size, large enough for a full table dump
    const SOCKET_RECV_BUFFER_SIZE: usize = 1024 * 1024;

    /// Netlink socket subscribed to neighbor events
    pub struct NetlinkSocket {
        socket: Socket,
        /// Receive buffer reused across calls
        buffer: Vec<u8>,
    }

    impl NetlinkSocket {
        /// Create and bind a new netlink socket for neighbor events
        ///
        /// Needs no privileges beyond a netlink socket; fails early in
        /// restricted sandboxes.
        #[instrument]
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| CollectorError::Netlink(format!("Failed to create socket: {}", e)))?;

            let groups = 1 << (RTNLGRP_NEIGH - 1);
            let addr = SocketAddr::new(0, groups);
            socket
                .bind(&addr)
                .map_err(|e| CollectorError::Netlink(format!("Failed to bind socket: {}", e)))?;

            debug!("Netlink socket bound to RTNLGRP_NEIGH");

            let nl_socket = Self {
                socket,
                buffer: vec![0u8; 65536],
            };
            nl_socket.tune_socket();

            Ok(nl_socket)
        }

        fn set_nonblocking(&self) -> Result<()> {
            let fd = self.socket.as_raw_fd();
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 {
                    return Err(CollectorError::Netlink("Failed to get socket flags".into()));
                }
                if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(CollectorError::Netlink(
                        "Failed to set non-blocking mode".into(),
                    ));
                }
            }
            Ok(())
        }

        /// Enlarge the receive buffer and ignore ENOBUFS under event storms
        fn tune_socket(&self) {
            let fd = self.socket.as_raw_fd();

            unsafe {
                let size = SOCKET_RECV_BUFFER_SIZE as libc::c_int;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set SO_RCVBUF, using default buffer size");
                }

                let enable: libc::c_int = 1;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_NETLINK,
                    libc::NETLINK_NO_ENOBUFS,
                    &enable as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set NETLINK_NO_ENOBUFS");
                }
            }
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.socket.as_raw_fd()
        }

        /// Request a dump of the IPv4 neighbor table
        #[instrument(skip(self))]
        pub fn request_dump(&mut self) -> Result<()> {
            use netlink_packet_core::{NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader};

            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;

            let mut msg = NeighbourMessage::default();
            msg.header.family = AddressFamily::Inet;
            let payload = RouteNetlinkMessage::GetNeighbour(msg);
            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket.send(&buf, 0).map_err(|e| {
                CollectorError::Netlink(format!("Failed to send dump request: {}", e))
            })?;

            trace!("Requested neighbor table dump");
            Ok(())
        }

        /// Receive without blocking
        ///
        /// Returns Ok(None) if no data available (EAGAIN/EWOULDBLOCK)
        pub fn try_receive_events(&mut self) -> Result<Option<Vec<NeighborEvent>>> {
            match self.socket.recv(&mut &mut self.buffer[..], libc::MSG_DONTWAIT) {
                Ok(len) => Ok(Some(self.parse_buffer(len))),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(CollectorError::Netlink(format!("Failed to receive: {}", e))),
            }
        }

        fn parse_buffer(&self, len: usize) -> Vec<NeighborEvent> {
            let mut events = Vec::new();
            let mut offset = 0;

            while offset < len {
                let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(
                    &self.buffer[offset..len],
                ) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "Failed to parse netlink message");
                        break;
                    }
                };

                let length = msg.header.length as usize;
                if length == 0 {
                    break;
                }
                // Netlink messages are 4-byte aligned
                offset = (offset + length + 3) & !3;

                if let Some(event) = parse_neighbor_message(&msg) {
                    events.push(event);
                }
            }

            trace!(count = events.len(), "Received neighbor events");
            events
        }
    }

    fn parse_neighbor_message(msg: &NetlinkMessage<RouteNetlinkMessage>) -> Option<NeighborEvent> {
        let (kind, neigh_msg) = match &msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(n)) => {
                (NeighborEventKind::New, n)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelNeighbour(n)) => {
                (NeighborEventKind::Delete, n)
            }
            _ => return None,
        };

        if neigh_msg.header.family != AddressFamily::Inet {
            return None;
        }

        let mut ip = None;
        let mut mac = MacAddress::ZERO;
        for attr in &neigh_msg.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => ip = Some(*addr),
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    if let Some(parsed) = MacAddress::from_slice(bytes) {
                        mac = parsed;
                    }
                }
                _ => {}
            }
        }

        Some(NeighborEvent {
            kind,
            ifindex: neigh_msg.header.ifindex,
            ip: ip?,
            mac,
            state: NeighborState::from_kernel(u16::from(neigh_msg.header.state)),
        })
    }

    /// Async netlink socket using tokio's epoll integration
    pub struct AsyncNetlinkSocket {
        inner: AsyncFd<OwnedFd>,
        socket: NetlinkSocket,
    }

    impl AsyncNetlinkSocket {
        /// Must be called within a tokio runtime
        #[instrument]
        pub fn new() -> Result<Self> {
            let socket = NetlinkSocket::new()?;
            socket.set_nonblocking()?;

            // Dup the fd so Socket retains ownership of its own
            let owned_fd = unsafe {
                let new_fd = libc::dup(socket.as_raw_fd());
                if new_fd < 0 {
                    return Err(CollectorError::Netlink("Failed to dup fd".into()));
                }
                OwnedFd::from_raw_fd(new_fd)
            };

            // SAFETY: the OwnedFd is moved into the AsyncFd and stays open for
            // as long as it is registered.
            let inner = unsafe { AsyncFd::register_with_interest(owned_fd, Interest::READABLE) }
                .map_err(|e| CollectorError::Netlink(format!("Failed to create AsyncFd: {}", e)))?;

            Ok(Self { inner, socket })
        }

        /// Waits for the next batch of neighbor events
        ///
        /// Cancel safe: no data is consumed until the socket is readable.
        pub async fn recv_events(&mut self) -> Result<Vec<NeighborEvent>> {
            loop {
                let mut guard = self.inner.readable().await.map_err(|e| {
                    CollectorError::Netlink(format!("AsyncFd readable error: {}", e))
                })?;

                match guard.try_io(|_| {
                    self.socket
                        .try_receive_events()
                        .map_err(std::io::Error::other)
                }) {
                    Ok(Ok(Some(events))) => return Ok(events),
                    Ok(Ok(None)) => {
                        guard.clear_ready();
                        continue;
                    }
                    Ok(Err(e)) => {
                        return Err(CollectorError::Netlink(format!("Receive error: {}", e)));
                    }
                    Err(_would_block) => continue,
                }
            }
        }

        pub fn request_dump(&mut self) -> Result<()> {
            self.socket.request_dump()
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Stand-in for non-Linux platforms; construction always fails
#[cfg(not(target_os = "linux"))]
mod mock {
    use super::NeighborEvent;
    use crate::error::{CollectorError, Result};

    pub struct AsyncNetlinkSocket;

    impl AsyncNetlinkSocket {
        pub fn new() -> Result<Self> {
            Err(CollectorError::Netlink(
                "rtnetlink is only available on Linux".to_string(),
            ))
        }

        pub async fn recv_events(&mut self) -> Result<Vec<NeighborEvent>> {
            std::future::pending().await
        }

        pub fn request_dump(&mut self) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
