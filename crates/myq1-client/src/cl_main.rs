// cl_main.rs — client connection and frame
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::net::{NetAdr, NetDriver, SendStatus};
use myq1_common::net_chan::{is_out_of_band, out_of_band_print, out_of_band_text, NetChan, NetSrc};
use myq1_common::qcommon::*;

use crate::cl_input::InputButtons;
use crate::client::*;

impl ClientContext {
    /// Attach the network driver used for every connection.
    pub fn set_driver(&mut self, driver: Box<dyn NetDriver>) {
        self.cls.driver = Some(driver);
    }

    // ============================================================
    // Connection
    // ============================================================

    /// Start connecting to `server`. Requests are resent until the server
    /// answers.
    pub fn connect(&mut self, server: NetAdr) {
        self.disconnect();
        self.cls.servername = Some(server);
        self.cls.state = ConnState::Connecting;
        self.cls.connect_time = -99999.0; // fire immediately
        self.cls.disconnect_reason = None;
    }

    /// Resend a connect message if the last one has timed out.
    pub fn check_for_resend(&mut self) {
        if self.cls.state != ConnState::Connecting {
            return;
        }
        if self.realtime - self.cls.connect_time < CONNECT_RESEND {
            return;
        }
        let (Some(server), Some(driver)) = (self.cls.servername, self.cls.driver.as_deref_mut()) else {
            return;
        };
        self.cls.connect_time = self.realtime; // for retransmit requests

        com_printf(&format!("Connecting to {}...\n", server));
        let text = format!("connect {} {}", PROTOCOL_VERSION, self.cls.qport);
        if out_of_band_print(driver, &server, &text) != SendStatus::Sent {
            com_dprintf("connect request not sent\n");
        }
    }

    /// Sends a disconnect message to the server and forgets the level.
    pub fn disconnect(&mut self) {
        if self.cls.state == ConnState::Connected {
            com_dprintf("Sending clc_disconnect\n");
            let now = self.realtime;
            if let (Some(driver), Some(chan)) = (self.cls.driver.as_deref_mut(), self.cls.netchan.as_mut()) {
                // the disconnect is unreliable, so send it a few times
                let final_msg = [CLC_DISCONNECT];
                for _ in 0..3 {
                    if let Err(err) = chan.transmit(driver, &final_msg, now) {
                        log::warn!("disconnect: {}", err);
                        break;
                    }
                }
            }
        }

        self.cls.state = ConnState::Disconnected;
        self.cls.signon = 0;
        self.cls.netchan = None;
        self.clear_state();
    }

    /// Drop the connection because of `err`, keeping the reason for
    /// display.
    pub fn host_error(&mut self, err: &ClientError) {
        log::error!("Host_Error: {}", err);
        self.disconnect();
        self.cls.disconnect_reason = Some(err.to_string());
    }

    fn connectionless_packet(&mut self, from: NetAdr, msg: &SizeBuf) {
        let text = out_of_band_text(msg);
        let mut args = text.splitn(2, char::is_whitespace);
        let cmd = args.next().unwrap_or("");
        com_dprintf(&format!("{}: {}\n", from, cmd));

        if Some(from) != self.cls.servername {
            com_dprintf("connectionless packet from a stranger\n");
            return;
        }

        match cmd {
            // server connection
            "accept" => {
                if self.cls.state == ConnState::Connected {
                    com_printf("Dup connect received.  Ignored.\n");
                    return;
                }
                if self.cls.state != ConnState::Connecting {
                    return;
                }
                self.cls.netchan = Some(NetChan::new(NetSrc::Client, from, self.cls.qport, self.realtime));
                self.cls.state = ConnState::Connected;
                self.cls.signon = 0;
                log::info!("connected to {}", from);
            }
            "reject" => {
                let reason = args.next().unwrap_or("").trim().to_string();
                com_printf(&format!("Connection rejected: {}\n", reason));
                self.disconnect();
                self.cls.disconnect_reason = Some(reason);
            }
            "print" => com_printf(args.next().unwrap_or("")),
            _ => com_printf(&format!("Unknown command from {}: {}\n", from, cmd)),
        }
    }

    /// Queue a console command for the server on the reliable stream.
    pub fn forward_to_server(&mut self, text: &str) {
        let Some(chan) = self.cls.netchan.as_mut() else {
            com_printf("Can't send commands, not connected\n");
            return;
        };
        msg_write_byte(&mut chan.message, CLC_STRINGCMD as i32);
        msg_write_string(&mut chan.message, text);
    }

    /// An svc_signonnum has been received, perform a client side setup.
    pub fn signon_reply(&mut self) {
        com_dprintf(&format!("CL_SignonReply: {}\n", self.cls.signon));

        match self.cls.signon {
            1 => self.forward_to_server("prespawn"),
            2 => {
                let name = self.cvars.variable_string("_cl_name").to_string();
                let color = self.cvar("_cl_color") as i32;
                self.forward_to_server(&format!("name \"{}\"\n", name));
                self.forward_to_server(&format!("color {} {}\n", color >> 4, color & 15));
                self.forward_to_server("spawn");
            }
            3 => self.forward_to_server("begin"),
            4 => log::info!("entered {}", self.cl.levelname),
            _ => {}
        }
    }

    // ============================================================
    // Frame
    // ============================================================

    /// Read every waiting packet. Sequenced packets from the server are
    /// parsed immediately.
    pub fn read_packets(&mut self) -> Result<(), ClientError> {
        let mut packets = Vec::new();
        if let Some(driver) = self.cls.driver.as_deref_mut() {
            let mut msg = SizeBuf::new(MAX_PACKETLEN);
            while let Some(from) = driver.get_packet(&mut msg) {
                packets.push((from, msg.clone()));
            }
        }

        for (from, mut msg) in packets {
            // remote command packet
            if is_out_of_band(&msg) {
                self.connectionless_packet(from, &msg);
                continue;
            }

            if self.cls.state != ConnState::Connected {
                continue; // dump it if not connected
            }
            let realtime = self.realtime;
            let Some(chan) = self.cls.netchan.as_mut() else {
                continue;
            };
            if from != chan.remote_address {
                com_dprintf(&format!("{}: sequenced packet without connection\n", from));
                continue;
            }
            if !chan.process(&mut msg, realtime) {
                continue; // wasn't accepted for some reason
            }

            self.cl.last_received_message = realtime;
            self.parse_server_message(&mut msg)?;
            if self.cls.state != ConnState::Connected {
                break;
            }
        }

        // check timeout
        if let Some(chan) = self.cls.netchan.as_ref() {
            if self.realtime - chan.last_received > self.cvar("cl_timeout") as f64 {
                return Err(ClientError::Timeout);
            }
        }
        Ok(())
    }

    /// Read all incoming data from the server and move the entity mirror
    /// to the current client time.
    pub fn read_from_server(&mut self) -> Result<(), ClientError> {
        self.cl.oldtime = self.cl.time;
        self.cl.time += self.host_frametime;

        self.read_packets()?;

        self.relink_entities();
        self.expire_effects();
        Ok(())
    }

    /// Build this frame's move and send it with any pending reliable
    /// commands.
    pub fn send_cmd(&mut self, buttons: &mut InputButtons) -> Result<(), ClientError> {
        if self.cls.state != ConnState::Connected {
            return Ok(());
        }

        let mut data = Vec::new();
        if self.cls.signon == SIGNONS {
            // get basic movement from keyboard
            let cmd = self.base_move(buttons);
            if let Some(buf) = self.send_move(&cmd, buttons) {
                data.extend_from_slice(buf.as_slice());
            }
        }

        let now = self.realtime;
        let (Some(driver), Some(chan)) = (self.cls.driver.as_deref_mut(), self.cls.netchan.as_mut()) else {
            return Ok(());
        };
        if chan.transmit(driver, &data, now)? == SendStatus::NotReady {
            com_dprintf("CL_SendCmd: socket not ready, retrying next frame\n");
        }
        Ok(())
    }

    /// One client frame. Connection-ending errors disconnect.
    pub fn frame(&mut self, frametime: f64, buttons: &mut InputButtons) {
        self.realtime += frametime;
        self.host_frametime = frametime;

        self.check_for_resend();

        let result = self.read_from_server().and_then(|_| self.send_cmd(buttons));
        if let Err(err) = result {
            self.host_error(&err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use myq1_common::net::{LoopbackDriver, LoopbackHub};
    use myq1_common::net_chan::out_of_band;

    const SERVER: NetAdr = NetAdr::Loopback(1);

    struct FakeServer {
        driver: LoopbackDriver,
        chan: Option<NetChan>,
    }

    impl FakeServer {
        fn new(hub: &LoopbackHub) -> Self {
            Self { driver: hub.driver(1), chan: None }
        }

        fn recv(&mut self) -> Option<(NetAdr, SizeBuf)> {
            let mut msg = SizeBuf::new(MAX_PACKETLEN);
            self.driver.get_packet(&mut msg).map(|from| (from, msg))
        }

        fn accept(&mut self) -> String {
            let (from, msg) = self.recv().expect("connect request");
            assert!(is_out_of_band(&msg));
            out_of_band(&mut self.driver, &from, b"accept");
            self.chan = Some(NetChan::new(NetSrc::Server, from, 0, 0.0));
            out_of_band_text(&msg)
        }

        fn send_reliable(&mut self, build: impl FnOnce(&mut SizeBuf)) {
            let chan = self.chan.as_mut().unwrap();
            build(&mut chan.message);
            chan.transmit(&mut self.driver, &[], 0.0).unwrap();
        }

        /// Reliable string commands in every packet waiting from the client.
        fn string_cmds(&mut self) -> Vec<String> {
            let mut cmds = Vec::new();
            while let Some((_, mut msg)) = self.recv() {
                if !self.chan.as_mut().unwrap().process(&mut msg, 0.0) {
                    continue;
                }
                loop {
                    match msg_read_byte(&mut msg) {
                        -1 => break,
                        c if c == CLC_STRINGCMD as i32 => cmds.push(msg_read_string(&mut msg)),
                        c if c == CLC_NOP as i32 => {}
                        c => panic!("unexpected clc {}", c),
                    }
                }
            }
            cmds
        }
    }

    fn client(hub: &LoopbackHub) -> ClientContext {
        let mut ctx = ClientContext::new();
        ctx.set_driver(Box::new(hub.driver(2)));
        ctx
    }

    #[test]
    fn test_connect_handshake() {
        let hub = LoopbackHub::new();
        let mut server = FakeServer::new(&hub);
        let mut ctx = client(&hub);
        let mut buttons = InputButtons::default();

        ctx.connect(SERVER);
        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.state, ConnState::Connecting);
        assert_eq!(server.accept(), format!("connect 15 {}", ctx.cls.qport));

        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.state, ConnState::Connected);
        assert_eq!(ctx.cls.signon, 0);
    }

    #[test]
    fn test_connect_is_resent() {
        let hub = LoopbackHub::new();
        let mut server = FakeServer::new(&hub);
        let mut ctx = client(&hub);
        let mut buttons = InputButtons::default();

        ctx.connect(SERVER);
        ctx.frame(0.1, &mut buttons);
        assert!(server.recv().is_some());
        ctx.frame(1.0, &mut buttons);
        assert!(server.recv().is_none(), "too soon to resend");
        ctx.frame(2.5, &mut buttons);
        assert!(server.recv().is_some());
    }

    #[test]
    fn test_reject() {
        let hub = LoopbackHub::new();
        let mut server = FakeServer::new(&hub);
        let mut ctx = client(&hub);
        let mut buttons = InputButtons::default();

        ctx.connect(SERVER);
        ctx.frame(0.1, &mut buttons);
        let (from, _) = server.recv().unwrap();
        out_of_band(&mut server.driver, &from, b"reject Server is full.\n");
        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.state, ConnState::Disconnected);
        assert_eq!(ctx.cls.disconnect_reason.as_deref(), Some("Server is full."));
    }

    #[test]
    fn test_signon_sequence() {
        let hub = LoopbackHub::new();
        let mut server = FakeServer::new(&hub);
        let mut ctx = client(&hub);
        let mut buttons = InputButtons::default();
        ctx.cvars.set("_cl_name", "ranger");
        ctx.cvars.set("_cl_color", "77");

        ctx.connect(SERVER);
        ctx.frame(0.1, &mut buttons);
        server.accept();
        ctx.frame(0.1, &mut buttons);

        server.send_reliable(|m| {
            msg_write_byte(m, SVC_SERVERINFO as i32);
            msg_write_long(m, PROTOCOL_VERSION);
            msg_write_byte(m, 1);
            msg_write_byte(m, GAME_COOP);
            msg_write_string(m, "start");
            msg_write_string(m, "maps/start.bsp");
            msg_write_byte(m, 0);
            msg_write_byte(m, 0);
            msg_write_byte(m, SVC_SIGNONNUM as i32);
            msg_write_byte(m, 1);
        });
        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.signon, 1);
        assert_eq!(ctx.cl.levelname, "start");
        assert_eq!(server.string_cmds(), vec!["prespawn".to_string()]);

        server.send_reliable(|m| {
            msg_write_byte(m, SVC_SIGNONNUM as i32);
            msg_write_byte(m, 2);
        });
        ctx.frame(0.1, &mut buttons);
        assert_eq!(
            server.string_cmds(),
            vec!["name \"ranger\"\n".to_string(), "color 4 13\n".to_string(), "spawn".to_string()]
        );

        server.send_reliable(|m| {
            msg_write_byte(m, SVC_SIGNONNUM as i32);
            msg_write_byte(m, 3);
        });
        ctx.frame(0.1, &mut buttons);
        assert_eq!(server.string_cmds(), vec!["begin".to_string()]);

        // the first entity update completes the signon
        server.send_reliable(|m| {
            msg_write_byte(m, SVC_TIME as i32);
            msg_write_float(m, 1.0);
            msg_write_byte(m, U_SIGNAL);
            msg_write_byte(m, 1);
        });
        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.signon, SIGNONS);
    }

    #[test]
    fn test_server_disconnect_and_timeout() {
        let hub = LoopbackHub::new();
        let mut server = FakeServer::new(&hub);
        let mut ctx = client(&hub);
        let mut buttons = InputButtons::default();

        ctx.connect(SERVER);
        ctx.frame(0.1, &mut buttons);
        server.accept();
        ctx.frame(0.1, &mut buttons);
        server.send_reliable(|m| msg_write_byte(m, SVC_DISCONNECT as i32));
        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.state, ConnState::Disconnected);
        assert_eq!(ctx.cls.disconnect_reason.as_deref(), Some("Server disconnected"));

        while server.recv().is_some() {}
        ctx.connect(SERVER);
        ctx.frame(0.1, &mut buttons);
        server.accept();
        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.state, ConnState::Connected);
        ctx.frame(61.0, &mut buttons);
        assert_eq!(ctx.cls.state, ConnState::Disconnected);
        assert_eq!(ctx.cls.disconnect_reason.as_deref(), Some("lost server connection"));
    }

    #[test]
    fn test_disconnect_tells_the_server() {
        let hub = LoopbackHub::new();
        let mut server = FakeServer::new(&hub);
        let mut ctx = client(&hub);
        let mut buttons = InputButtons::default();

        ctx.connect(SERVER);
        ctx.frame(0.1, &mut buttons);
        server.accept();
        ctx.frame(0.1, &mut buttons);
        while server.recv().is_some() {}

        ctx.disconnect();
        let mut seen = 0;
        while let Some((_, mut msg)) = server.recv() {
            if server.chan.as_mut().unwrap().process(&mut msg, 0.0) {
                assert_eq!(msg_read_byte(&mut msg), CLC_DISCONNECT as i32);
                seen += 1;
            }
        }
        assert_eq!(seen, 3);
        assert!(ctx.cls.netchan.is_none());
    }

    #[test]
    fn test_stranger_packets_are_ignored() {
        let hub = LoopbackHub::new();
        let _server = FakeServer::new(&hub);
        let mut stranger = hub.driver(9);
        let mut ctx = client(&hub);
        let mut buttons = InputButtons::default();

        ctx.connect(SERVER);
        out_of_band(&mut stranger, &NetAdr::Loopback(2), b"accept");
        ctx.frame(0.1, &mut buttons);
        assert_eq!(ctx.cls.state, ConnState::Connecting);
    }
}
