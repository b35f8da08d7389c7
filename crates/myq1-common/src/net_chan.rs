// net_chan.rs — sequenced packet channel
//
// Every packet starts with two 32-bit words:
//
//   31 sequence, 1 bit "contains reliable data"
//   31 acknowledged sequence, 1 bit reliable toggle of the last reliable
//      message received
//
// Clients follow the header with a 16-bit qport so a server can keep
// talking to a client whose NAT port changed.
//
// Only one reliable message is in flight at a time. It is resent in every
// packet from the point the remote side is known to have missed it until
// its toggle bit is acknowledged. Anything queued meanwhile waits in
// `message`. A sequence of -1 marks a connectionless (out of band) packet.

use crate::common::{
    bytes_string, com_dprintf, msg_begin_reading, msg_read_long, msg_read_short, msg_write_long,
    msg_write_short, string_bytes,
};
use crate::net::{NetAdr, NetDriver, SendStatus};
use crate::qcommon::{ProtocolError, SizeBuf, MAX_MSGLEN, MAX_PACKETLEN};

/// Which end of the connection a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSrc {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct NetChan {
    pub sock: NetSrc,
    pub remote_address: NetAdr,
    pub qport: i32,

    pub dropped: i32, // between last packet and previous
    pub last_received: f64,
    pub last_sent: f64,

    pub incoming_sequence: i32,
    pub incoming_acknowledged: i32,
    pub incoming_reliable_acknowledged: i32, // single bit
    pub incoming_reliable_sequence: i32,     // single bit, maintained local

    pub outgoing_sequence: i32,
    pub reliable_sequence: i32,      // single bit
    pub last_reliable_sequence: i32, // sequence number of last send

    /// Reliable data waiting for the in-flight message to be acknowledged.
    pub message: SizeBuf,

    reliable_buf: Vec<u8>,
}

impl NetChan {
    pub fn new(sock: NetSrc, remote_address: NetAdr, qport: i32, now: f64) -> Self {
        let mut message = SizeBuf::new(MAX_MSGLEN - 16);
        message.allow_overflow = true;
        Self {
            sock,
            remote_address,
            qport,
            dropped: 0,
            last_received: now,
            last_sent: now,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            incoming_reliable_acknowledged: 0,
            incoming_reliable_sequence: 0,
            outgoing_sequence: 1,
            reliable_sequence: 0,
            last_reliable_sequence: 0,
            message,
            reliable_buf: Vec::new(),
        }
    }

    /// True once the last reliable message has been acknowledged.
    pub fn can_reliable(&self) -> bool {
        self.reliable_buf.is_empty()
    }

    pub fn need_reliable(&self) -> bool {
        // the remote side dropped the last reliable message
        if self.incoming_acknowledged > self.last_reliable_sequence
            && self.incoming_reliable_acknowledged != self.reliable_sequence
        {
            return true;
        }
        // nothing in flight and something queued
        self.reliable_buf.is_empty() && self.message.cursize > 0
    }

    /// Send one packet: the pending reliable message if it is due, then
    /// `data` as the unreliable part if it fits.
    ///
    /// Returns `NotReady` if the driver could not take the packet; the
    /// reliable message stays pending and goes out with a later packet.
    pub fn transmit(
        &mut self,
        driver: &mut dyn NetDriver,
        data: &[u8],
        now: f64,
    ) -> Result<SendStatus, ProtocolError> {
        if self.message.overflowed {
            log::warn!("{}: outgoing message overflow", self.remote_address);
            return Err(ProtocolError::Overflow("reliable channel message"));
        }

        let send_reliable = self.need_reliable();

        if self.reliable_buf.is_empty() && self.message.cursize > 0 {
            self.reliable_buf.extend_from_slice(self.message.as_slice());
            self.message.clear();
            self.reliable_sequence ^= 1;
        }

        let mut send = SizeBuf::new(MAX_PACKETLEN);

        let w1 = ((self.outgoing_sequence as u32) & !(1u32 << 31)) | ((send_reliable as u32) << 31);
        let w2 = ((self.incoming_sequence as u32) & !(1u32 << 31))
            | ((self.incoming_reliable_sequence as u32) << 31);

        self.outgoing_sequence += 1;
        self.last_sent = now;

        msg_write_long(&mut send, w1 as i32);
        msg_write_long(&mut send, w2 as i32);

        if self.sock == NetSrc::Client {
            msg_write_short(&mut send, self.qport);
        }

        if send_reliable {
            send.write(&self.reliable_buf);
            self.last_reliable_sequence = self.outgoing_sequence;
        }

        if send.remaining() >= data.len() {
            send.write(data);
        } else {
            com_dprintf("Netchan_Transmit: dumped unreliable\n");
        }

        Ok(driver.send_packet(send.as_slice(), &self.remote_address))
    }

    /// Check the header of a packet received from the remote side and
    /// update the sequence state. Leaves `msg` positioned at the payload.
    /// Returns false for stale or duplicated packets, which must be ignored.
    pub fn process(&mut self, msg: &mut SizeBuf, now: f64) -> bool {
        msg_begin_reading(msg);
        let sequence = msg_read_long(msg) as u32;
        let sequence_ack = msg_read_long(msg) as u32;

        if self.sock == NetSrc::Server {
            let _qport = msg_read_short(msg);
        }
        if msg.badread {
            return false;
        }

        let reliable_message = sequence >> 31;
        let reliable_ack = (sequence_ack >> 31) as i32;

        let sequence = (sequence & !(1u32 << 31)) as i32;
        let sequence_ack = (sequence_ack & !(1u32 << 31)) as i32;

        if sequence <= self.incoming_sequence {
            com_dprintf(&format!(
                "{}: out of order packet {} at {}\n",
                self.remote_address, sequence, self.incoming_sequence
            ));
            return false;
        }

        self.dropped = sequence - (self.incoming_sequence + 1);
        if self.dropped > 0 {
            com_dprintf(&format!(
                "{}: dropped {} packets at {}\n",
                self.remote_address, self.dropped, sequence
            ));
        }

        // the in-flight reliable message got through
        if reliable_ack == self.reliable_sequence {
            self.reliable_buf.clear();
        }

        self.incoming_sequence = sequence;
        self.incoming_acknowledged = sequence_ack;
        self.incoming_reliable_acknowledged = reliable_ack;
        if reliable_message != 0 {
            self.incoming_reliable_sequence ^= 1;
        }

        self.last_received = now;
        true
    }
}

/// True if the packet in `msg` is connectionless.
pub fn is_out_of_band(msg: &SizeBuf) -> bool {
    msg.cursize >= 4 && msg.data[..4] == [0xff; 4]
}

/// Send a connectionless packet.
pub fn out_of_band(driver: &mut dyn NetDriver, adr: &NetAdr, data: &[u8]) -> SendStatus {
    let mut send = SizeBuf::new(MAX_PACKETLEN);
    msg_write_long(&mut send, -1);
    send.write(data);
    driver.send_packet(send.as_slice(), adr)
}

/// Send a connectionless text command.
pub fn out_of_band_print(driver: &mut dyn NetDriver, adr: &NetAdr, text: &str) -> SendStatus {
    out_of_band(driver, adr, &string_bytes(text))
}

/// Text of a connectionless packet after the -1 header.
pub fn out_of_band_text(msg: &SizeBuf) -> String {
    bytes_string(&msg.as_slice()[4..])
        .trim_end_matches('\0')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{msg_read_byte, msg_write_byte};
    use crate::net::LoopbackHub;

    struct Pair {
        client_drv: crate::net::LoopbackDriver,
        server_drv: crate::net::LoopbackDriver,
        client: NetChan,
        server: NetChan,
    }

    fn pair() -> Pair {
        let hub = LoopbackHub::new();
        let client_drv = hub.driver(1);
        let server_drv = hub.driver(0);
        Pair {
            client: NetChan::new(NetSrc::Client, NetAdr::Loopback(0), 1234, 0.0),
            server: NetChan::new(NetSrc::Server, NetAdr::Loopback(1), 1234, 0.0),
            client_drv,
            server_drv,
        }
    }

    fn recv(drv: &mut dyn NetDriver, chan: &mut NetChan) -> Option<SizeBuf> {
        let mut msg = SizeBuf::new(MAX_PACKETLEN);
        drv.get_packet(&mut msg)?;
        chan.process(&mut msg, 1.0).then_some(msg)
    }

    #[test]
    fn test_out_of_band_header() {
        let hub = LoopbackHub::new();
        let mut a = hub.driver(0);
        let mut b = hub.driver(1);
        out_of_band_print(&mut a, &NetAdr::Loopback(1), "connect 15 1234");
        let mut msg = SizeBuf::new(MAX_PACKETLEN);
        b.get_packet(&mut msg);
        assert!(is_out_of_band(&msg));
        assert_eq!(out_of_band_text(&msg), "connect 15 1234");
    }

    #[test]
    fn test_reliable_delivered_once_and_acked() {
        let mut p = pair();
        msg_write_byte(&mut p.server.message, 42);
        p.server.transmit(&mut p.server_drv, &[], 0.0).unwrap();
        assert!(!p.server.can_reliable());

        let mut msg = recv(&mut p.client_drv, &mut p.client).expect("packet");
        assert_eq!(msg_read_byte(&mut msg), 42);

        // the client's next packet acknowledges it
        p.client.transmit(&mut p.client_drv, &[], 0.0).unwrap();
        recv(&mut p.server_drv, &mut p.server).expect("ack packet");
        assert!(p.server.can_reliable());
        assert!(!p.server.need_reliable());
    }

    #[test]
    fn test_lost_reliable_is_resent() {
        let mut p = pair();
        msg_write_byte(&mut p.server.message, 7);
        p.server.transmit(&mut p.server_drv, &[], 0.0).unwrap();

        // lose it
        let mut lost = SizeBuf::new(MAX_PACKETLEN);
        p.client_drv.get_packet(&mut lost);

        // later unreliable packets get through
        p.server.transmit(&mut p.server_drv, &[], 0.0).unwrap();
        p.server.transmit(&mut p.server_drv, &[], 0.0).unwrap();
        recv(&mut p.client_drv, &mut p.client).expect("seq 2");
        recv(&mut p.client_drv, &mut p.client).expect("seq 3");
        assert_eq!(p.client.dropped, 0);

        // client acknowledges them without the reliable toggle flipping
        p.client.transmit(&mut p.client_drv, &[], 0.0).unwrap();
        recv(&mut p.server_drv, &mut p.server).expect("client packet");
        assert!(p.server.need_reliable());

        p.server.transmit(&mut p.server_drv, &[99], 0.0).unwrap();
        let mut msg = recv(&mut p.client_drv, &mut p.client).expect("resend");
        assert_eq!(msg_read_byte(&mut msg), 7);
        assert_eq!(msg_read_byte(&mut msg), 99);
    }

    #[test]
    fn test_duplicate_packets_are_ignored() {
        let mut p = pair();
        p.server.transmit(&mut p.server_drv, &[1], 0.0).unwrap();
        let mut first = SizeBuf::new(MAX_PACKETLEN);
        p.client_drv.get_packet(&mut first);
        let mut again = first.clone();
        assert!(p.client.process(&mut first, 0.5));
        assert!(!p.client.process(&mut again, 0.6));
    }

    #[test]
    fn test_queued_reliable_waits_for_ack() {
        let mut p = pair();
        msg_write_byte(&mut p.server.message, 1);
        p.server.transmit(&mut p.server_drv, &[], 0.0).unwrap();
        msg_write_byte(&mut p.server.message, 2);
        assert!(!p.server.can_reliable());
        assert_eq!(p.server.message.cursize, 1, "second message stays queued");
    }

    #[test]
    fn test_overflowed_message_is_an_error() {
        let mut p = pair();
        p.server.message.overflowed = true;
        assert_eq!(
            p.server.transmit(&mut p.server_drv, &[], 0.0),
            Err(ProtocolError::Overflow("reliable channel message"))
        );
    }
}
