// net.rs — network drivers
//
// A driver moves raw datagrams; sequencing and reliability live in
// net_chan.rs. Two drivers are provided: an in-process loopback hub for a
// listen server and tests, and a non-blocking UDP socket.

use crate::common::com_printf;
use crate::qcommon::{SizeBuf, MAX_PACKETLEN};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetAdr {
    /// In-process endpoint, identified by a port number.
    Loopback(u16),
    Ip(SocketAddr),
}

impl fmt::Display for NetAdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAdr::Loopback(port) => write!(f, "loopback:{}", port),
            NetAdr::Ip(addr) => write!(f, "{}", addr),
        }
    }
}

/// Why a packet could not be handed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Sent,
    /// The socket would block; try again next frame.
    NotReady,
    /// Unreachable or unknown destination; the packet is gone.
    Dropped,
}

/// Datagram transport.
pub trait NetDriver {
    /// Next pending packet, copied into `msg`. Never blocks.
    fn get_packet(&mut self, msg: &mut SizeBuf) -> Option<NetAdr>;

    fn send_packet(&mut self, data: &[u8], to: &NetAdr) -> SendStatus;

    fn local_address(&self) -> NetAdr;
}

fn fill_message(msg: &mut SizeBuf, data: &[u8]) -> bool {
    if data.len() > msg.maxsize {
        com_printf(&format!("Oversize packet ({} bytes)\n", data.len()));
        return false;
    }
    msg.data[..data.len()].copy_from_slice(data);
    msg.cursize = data.len();
    msg.readcount = 0;
    msg.badread = false;
    true
}

// ============================================================
// Loopback
// ============================================================

type Mailbox = VecDeque<(NetAdr, Vec<u8>)>;

/// Shared set of loopback mailboxes. Every driver made from the same hub
/// can reach every other one by its `Loopback` address.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    boxes: Arc<Mutex<HashMap<u16, Mailbox>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the endpoint `port`, replacing any previous one.
    pub fn driver(&self, port: u16) -> LoopbackDriver {
        self.boxes.lock().insert(port, VecDeque::new());
        LoopbackDriver { hub: self.clone(), port }
    }
}

pub struct LoopbackDriver {
    hub: LoopbackHub,
    port: u16,
}

impl NetDriver for LoopbackDriver {
    fn get_packet(&mut self, msg: &mut SizeBuf) -> Option<NetAdr> {
        loop {
            let (from, data) = self.hub.boxes.lock().get_mut(&self.port)?.pop_front()?;
            if fill_message(msg, &data) {
                return Some(from);
            }
        }
    }

    fn send_packet(&mut self, data: &[u8], to: &NetAdr) -> SendStatus {
        let NetAdr::Loopback(port) = to else {
            return SendStatus::Dropped;
        };
        let mut boxes = self.hub.boxes.lock();
        match boxes.get_mut(port) {
            Some(mailbox) => {
                mailbox.push_back((NetAdr::Loopback(self.port), data.to_vec()));
                SendStatus::Sent
            }
            None => SendStatus::Dropped,
        }
    }

    fn local_address(&self) -> NetAdr {
        NetAdr::Loopback(self.port)
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.hub.boxes.lock().remove(&self.port);
    }
}

// ============================================================
// UDP
// ============================================================

pub struct UdpDriver {
    socket: UdpSocket,
    local: NetAdr,
    buf: Vec<u8>,
}

impl UdpDriver {
    /// Open a non-blocking IPv4 socket on `interface:port`. Port 0 picks any.
    pub fn open(interface: &str, port: u16) -> io::Result<Self> {
        let bind_addr = if interface.is_empty() || interface == "localhost" {
            "0.0.0.0"
        } else {
            interface
        };
        let addr: SocketAddrV4 = format!("{}:{}", bind_addr, port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&socket2::SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;
        if let Err(e) = socket.set_broadcast(true) {
            com_printf(&format!("WARNING: UDP_OpenSocket: set_broadcast: {}\n", e));
        }

        let socket: UdpSocket = socket.into();
        let local = NetAdr::Ip(socket.local_addr()?);
        log::info!("UDP initialized on {}", local);
        Ok(Self { socket, local, buf: vec![0u8; MAX_PACKETLEN] })
    }
}

impl NetDriver for UdpDriver {
    fn get_packet(&mut self, msg: &mut SizeBuf) -> Option<NetAdr> {
        loop {
            match self.socket.recv_from(&mut self.buf) {
                Ok((len, from)) => {
                    if fill_message(msg, &self.buf[..len]) {
                        return Some(NetAdr::Ip(from));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    log::warn!("NET_GetPacket: {}", e);
                    return None;
                }
            }
        }
    }

    fn send_packet(&mut self, data: &[u8], to: &NetAdr) -> SendStatus {
        let NetAdr::Ip(addr) = to else {
            return SendStatus::Dropped;
        };
        match self.socket.send_to(data, addr) {
            Ok(_) => SendStatus::Sent,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => SendStatus::NotReady,
            Err(e) => {
                log::warn!("NET_SendPacket: {} to {}", e, addr);
                SendStatus::Dropped
            }
        }
    }

    fn local_address(&self) -> NetAdr {
        self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_delivers_in_order() {
        let hub = LoopbackHub::new();
        let mut server = hub.driver(0);
        let mut client = hub.driver(1);

        assert_eq!(client.send_packet(b"one", &server.local_address()), SendStatus::Sent);
        assert_eq!(client.send_packet(b"two", &NetAdr::Loopback(0)), SendStatus::Sent);

        let mut msg = SizeBuf::new(MAX_PACKETLEN);
        assert_eq!(server.get_packet(&mut msg), Some(NetAdr::Loopback(1)));
        assert_eq!(msg.as_slice(), b"one");
        assert_eq!(server.get_packet(&mut msg), Some(NetAdr::Loopback(1)));
        assert_eq!(msg.as_slice(), b"two");
        assert_eq!(server.get_packet(&mut msg), None);
    }

    #[test]
    fn test_loopback_unknown_destination_drops() {
        let hub = LoopbackHub::new();
        let mut a = hub.driver(5);
        assert_eq!(a.send_packet(b"x", &NetAdr::Loopback(9)), SendStatus::Dropped);
        let b = hub.driver(9);
        drop(b);
        assert_eq!(a.send_packet(b"x", &NetAdr::Loopback(9)), SendStatus::Dropped);
    }

    #[test]
    fn test_udp_local_roundtrip() {
        let Ok(mut a) = UdpDriver::open("127.0.0.1", 0) else {
            return; // no network in this environment
        };
        let Ok(mut b) = UdpDriver::open("127.0.0.1", 0) else {
            return;
        };
        assert_eq!(a.send_packet(b"ping", &b.local_address()), SendStatus::Sent);

        let mut msg = SizeBuf::new(MAX_PACKETLEN);
        let mut from = None;
        for _ in 0..100 {
            from = b.get_packet(&mut msg);
            if from.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(from, Some(a.local_address()));
        assert_eq!(msg.as_slice(), b"ping");
    }
}
