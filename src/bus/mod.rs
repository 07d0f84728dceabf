#[cfg(test)]
mod bus_test;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::SockAddr;
use tokio::net::UdpSocket;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::Message;

const INBOUND_BUFFER_SIZE: usize = 65535;

/// Operations a bus message can be dispatched to. The table below maps
/// paths to these; the device drives the actual handling.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Handler {
    Who,
    Registered,
    Logout,
    Sync,
    PortProbe,
    PortRegistered,
    NameProbe,
    NameRegistered,
    Link,
    LinkTo,
    Linked,
    Unlink,
    Unlinked,
    Map,
    MapTo,
    Mapped,
    MapModify,
    Unmap,
    Unmapped,
    SignalInfo,
    SignalRemoved,
    Subscribe,
    Unsubscribe,
    InfoGet,
    NamespaceGet,
    SignalsGet,
    LinksGet,
    MapsGet,
}

/// The multicast control bus plus the unicast mesh socket used for
/// targeted replies. All control traffic for a mapping network shares one
/// multicast group; the mesh socket exists so a reply can reach exactly
/// one process on a host where every bus socket shares the same port.
pub struct Bus {
    socket: UdpSocket,
    mesh: UdpSocket,
    group: SocketAddr,
    interface_name: String,
    interface_ip: Ipv4Addr,
    handlers: Vec<(String, Handler)>,
}

impl Bus {
    /// Opens the bus on the first configured interface carrying an IPv4
    /// address. Fails when no interface is usable or the multicast group
    /// cannot be joined; the caller propagates this out of construction.
    pub fn open(config: &Config) -> Result<Self> {
        let (interface_name, interface_ip) = find_interface(&config.interfaces)?;

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        #[cfg(feature = "reuse_port")]
        #[cfg(target_family = "unix")]
        socket.set_reuse_port(true)?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddr::new(
            Ipv4Addr::UNSPECIFIED.into(),
            config.bus_port,
        )))?;

        if let Err(e) = socket.join_multicast_v4(&config.bus_group, &interface_ip) {
            log::error!(
                "error joining {} on {}: {:?}",
                config.bus_group,
                interface_name,
                e
            );
            return Err(Error::ErrJoiningMulticastGroup);
        }
        socket.set_multicast_if_v4(&interface_ip)?;
        // TTL 1: control traffic stays on the local subnet
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(true)?;

        let socket = UdpSocket::from_std(socket.into())?;

        let mesh = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        mesh.set_nonblocking(true)?;
        mesh.bind(&SockAddr::from(SocketAddr::new(
            Ipv4Addr::UNSPECIFIED.into(),
            0,
        )))?;
        mesh.set_multicast_if_v4(&interface_ip)?;
        mesh.set_multicast_ttl_v4(1)?;
        mesh.set_multicast_loop_v4(true)?;
        let mesh = UdpSocket::from_std(mesh.into())?;

        log::info!(
            "bus open on {} ({}), group {}:{}",
            interface_name,
            interface_ip,
            config.bus_group,
            config.bus_port
        );

        Ok(Bus {
            socket,
            mesh,
            group: SocketAddr::V4(SocketAddrV4::new(config.bus_group, config.bus_port)),
            interface_name,
            interface_ip,
            handlers: Vec::new(),
        })
    }

    pub fn interface_ip(&self) -> Ipv4Addr {
        self.interface_ip
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn mesh_addr(&self) -> Result<SocketAddr> {
        Ok(self.mesh.local_addr()?)
    }

    /// Registers a path in the dispatch table. Later registrations win so
    /// a device can rebind a path after its name is locked.
    pub fn add_handler(&mut self, path: impl Into<String>, handler: Handler) {
        let path = path.into();
        self.handlers.retain(|(p, _)| *p != path);
        self.handlers.push((path, handler));
    }

    pub fn remove_handler(&mut self, path: &str) {
        self.handlers.retain(|(p, _)| p != path);
    }

    /// Resolves a path to its handler: exact matches first, then the
    /// announcement suffixes that may arrive under any device's prefix.
    pub fn route(&self, path: &str) -> Option<Handler> {
        route_path(&self.handlers, path)
    }

    /// Broadcasts a control message on the bus.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        let buf = msg.pack()?;
        self.socket.send_to(&buf, self.group).await?;
        Ok(())
    }

    /// Broadcasts from the mesh socket; used for requests whose replies
    /// must come back to this process alone (e.g. `/subscribe`).
    pub async fn send_from_mesh(&self, msg: &Message) -> Result<()> {
        let buf = msg.pack()?;
        self.mesh.send_to(&buf, self.group).await?;
        Ok(())
    }

    /// Sends a targeted reply over the mesh socket.
    pub async fn send_to(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        let buf = msg.pack()?;
        self.mesh.send_to(&buf, addr).await?;
        Ok(())
    }

    /// Non-blocking receive across both sockets. Undecodable datagrams
    /// are dropped with a trace log and never reach a handler.
    pub fn try_recv(&self) -> Option<(Message, SocketAddr)> {
        let mut buf = vec![0u8; INBOUND_BUFFER_SIZE];
        for socket in [&self.socket, &self.mesh] {
            loop {
                match socket.try_recv_from(&mut buf) {
                    Ok((n, src)) => match Message::unpack(&buf[..n]) {
                        Ok(msg) => return Some((msg, src)),
                        Err(e) => {
                            log::trace!("dropping malformed datagram from {}: {}", src, e);
                        }
                    },
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::error!("error receiving from bus socket: {:?}", e);
                        break;
                    }
                }
            }
        }
        None
    }
}

fn route_path(handlers: &[(String, Handler)], path: &str) -> Option<Handler> {
    if let Some((_, h)) = handlers.iter().find(|(p, _)| p == path) {
        return Some(*h);
    }
    if path.ends_with("/signal/removed") {
        return Some(Handler::SignalRemoved);
    }
    if path.ends_with("/signal") {
        return Some(Handler::SignalInfo);
    }
    None
}

/// Tries the candidate interface names in order and returns the first
/// carrying an IPv4 address.
fn find_interface(names: &[String]) -> Result<(String, Ipv4Addr)> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            log::error!("error listing interfaces: {:?}", e);
            return Err(Error::ErrNoInterface);
        }
    };

    for name in names {
        for iface in &interfaces {
            if &iface.name != name {
                continue;
            }
            if let get_if_addrs::IfAddr::V4(ref v4) = iface.addr {
                return Ok((iface.name.clone(), v4.ip));
            }
        }
    }
    Err(Error::ErrNoInterface)
}
