// sv_main.rs — connections and the host frame
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::net::NetAdr;
use myq1_common::net_chan::{is_out_of_band, out_of_band_print, out_of_band_text, NetChan, NetSrc};
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::progs::gv;
use crate::server::*;
use crate::sv_ccmds::{split_commands, CmdArgs};

use std::time::{Duration, Instant};

/// Frames never run faster than this.
const MAX_FPS: f64 = 72.0;

/// How long shutdown waits for reliable data to drain.
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(3);

/// Same machine and client port, even if a router changed the UDP port.
fn same_host(a: &NetAdr, b: &NetAdr) -> bool {
    match (a, b) {
        (NetAdr::Ip(a), NetAdr::Ip(b)) => a.ip() == b.ip(),
        _ => a == b,
    }
}

impl ServerContext {
    fn send_out_of_band(&mut self, adr: &NetAdr, text: &str) {
        if let Some(driver) = self.svs.driver.as_deref_mut() {
            out_of_band_print(driver, adr, text);
        }
    }

    /// Called when the player is getting totally kicked off the host.
    /// With `crash` set no more messages are sent to the client and the
    /// progs don't hear about the disconnect.
    pub fn drop_client(&mut self, slot: usize, crash: bool) -> Result<(), HostError> {
        let Some(cl) = self.svs.client(slot) else {
            return Ok(());
        };
        let (name, spawned, edict) = (cl.name.clone(), cl.spawned, cl.edict);

        if !crash {
            // send any final messages (don't check for errors)
            if let Err(err) = self.transmit_to(slot, &[SVC_DISCONNECT]) {
                log::debug!("client {}: {}", slot, err);
            }

            if spawned {
                // call the prog function for removing a client
                // this will set the body to a dead frame, among other things
                let save_self = self.pr.g_edict(gv::SELF);
                self.pr.set_g_edict(gv::SELF, edict);
                let func = self.pr.g_int(gv::CLIENT_DISCONNECT);
                let result = self.execute_program(func);
                self.pr.set_g_edict(gv::SELF, save_self);
                self.contain_fault(result)?;
            }

            com_printf(&format!("Client {} removed\n", name));
        }

        // free the client (the body stays around)
        self.svs.clients[slot] = None;
        if self.host_client == Some(slot) {
            self.host_client = None;
        }

        // send notification to all clients
        for cl in self.svs.clients.iter_mut().flatten() {
            if !cl.active {
                continue;
            }
            msg_write_byte(&mut cl.message, SVC_UPDATENAME as i32);
            msg_write_byte(&mut cl.message, slot as i32);
            msg_write_string(&mut cl.message, "");
            msg_write_byte(&mut cl.message, SVC_UPDATEFRAGS as i32);
            msg_write_byte(&mut cl.message, slot as i32);
            msg_write_short(&mut cl.message, 0);
            msg_write_byte(&mut cl.message, SVC_UPDATECOLORS as i32);
            msg_write_byte(&mut cl.message, slot as i32);
            msg_write_byte(&mut cl.message, 0);
        }
        Ok(())
    }

    /// Initializes a client slot for a new net connection. This will only
    /// be called once for a player each game, not once for each level
    /// change.
    fn connect_client(&mut self, slot: usize) -> Result<(), HostError> {
        // call the progs to get default spawn parms for the new client
        let func = self.pr.g_int(gv::SET_NEW_PARMS);
        let result = self.execute_program(func);
        self.contain_fault(result)?;

        let mut parms = [0.0; NUM_SPAWN_PARMS];
        self.pr.spawn_parms(&mut parms);
        if let Some(cl) = self.svs.client_mut(slot) {
            cl.spawn_parms = parms;
        }

        self.send_server_info(slot);
        Ok(())
    }

    /// `connect <protocol> <qport>`
    fn direct_connect(&mut self, from: NetAdr, cmd: &CmdArgs) -> Result<(), HostError> {
        com_dprintf("SVC_DirectConnect ()\n");

        let version = crate::sv_edict::atof(cmd.argv(1)) as i32;
        if version != PROTOCOL_VERSION {
            self.send_out_of_band(
                &from,
                &format!("reject Server is version {:4.2}.\n", VERSION),
            );
            com_dprintf(&format!("    rejected connect from version {}\n", version));
            return Ok(());
        }
        let qport = crate::sv_edict::atof(cmd.argv(2)) as i32;

        let adr = from.to_string();
        let ip = match from {
            NetAdr::Ip(a) => a.ip().to_string(),
            NetAdr::Loopback(_) => adr.clone(),
        };
        if self.svs.banned.iter().any(|b| *b == adr || *b == ip) {
            self.send_out_of_band(&from, "reject You have been banned.\n");
            return Ok(());
        }

        if !self.sv.active {
            self.send_out_of_band(&from, "reject Server is not running.\n");
            return Ok(());
        }

        // if there is already a slot for this address, reuse it
        let existing = self.svs.active_clients().find(|&i| {
            self.svs.client(i).map_or(false, |cl| {
                same_host(&from, &cl.netchan.remote_address) && cl.netchan.qport == qport
            })
        });
        if let Some(slot) = existing {
            let connecttime = self.svs.client(slot).map_or(0.0, |cl| cl.connecttime);
            if self.realtime - connecttime < 2.0 {
                // our accept was probably lost
                self.send_out_of_band(&from, "accept");
                return Ok(());
            }
            // it's somebody coming back in from a crash
            com_printf(&format!("{}:reconnect\n", from));
            self.drop_client(slot, true)?;
        }

        // find a free client slot
        let Some(slot) = (0..self.svs.maxclients).find(|&i| self.svs.client(i).is_none()) else {
            self.send_out_of_band(&from, "reject Server is full.\n");
            com_dprintf("Rejected a connection.\n");
            return Ok(());
        };

        // this is the only place a client is ever initialized
        let netchan = NetChan::new(NetSrc::Server, from, qport, self.realtime);
        let mut cl = Client::new(netchan, ServerContext::client_edict(slot));
        cl.connecttime = self.realtime;
        cl.last_message = self.realtime;
        self.svs.clients[slot] = Some(cl);

        self.send_out_of_band(&from, "accept");
        log::info!("{} connected in slot {}", from, slot);
        self.connect_client(slot)
    }

    fn connectionless_packet(&mut self, from: NetAdr, msg: &SizeBuf) -> Result<(), HostError> {
        let text = out_of_band_text(msg);
        let cmd = CmdArgs::tokenize(&text);
        com_dprintf(&format!("Packet {} : {}\n", from, cmd.argv(0)));

        match cmd.argv(0) {
            "connect" => self.direct_connect(from, &cmd)?,
            "ping" => self.send_out_of_band(&from, "ack"),
            "status" => {
                let players = self.svs.active_clients().count();
                let reply = format!(
                    "print\n{} {} {}/{}\n",
                    self.cvars.variable_string("hostname"),
                    self.sv.name,
                    players,
                    self.svs.maxclients
                );
                self.send_out_of_band(&from, &reply);
            }
            _ => com_printf(&format!("bad connectionless packet from {}:\n{}\n", from, text)),
        }
        Ok(())
    }

    /// Pull everything off the network. Connection requests are handled
    /// now; sequenced packets are queued for their client.
    pub fn read_packets(&mut self) -> Result<(), HostError> {
        let mut packets = Vec::new();
        if let Some(driver) = self.svs.driver.as_deref_mut() {
            let mut msg = SizeBuf::new(MAX_PACKETLEN);
            while let Some(from) = driver.get_packet(&mut msg) {
                packets.push((from, msg.clone()));
            }
        }

        for (from, mut msg) in packets {
            // check for connectionless packet (0xffffffff) first
            if is_out_of_band(&msg) {
                self.connectionless_packet(from, &msg)?;
                continue;
            }

            // read the qport out of the message so we can fix up
            // stupid address translating routers
            if msg.cursize < 10 {
                continue;
            }
            let qport = i16::from_le_bytes([msg.data[8], msg.data[9]]) as i32 & 0xffff;

            let realtime = self.realtime;
            let slot = self.svs.active_clients().find(|&i| {
                self.svs.client(i).map_or(false, |cl| {
                    same_host(&from, &cl.netchan.remote_address)
                        && cl.netchan.qport & 0xffff == qport
                })
            });
            let Some(cl) = slot.and_then(|i| self.svs.client_mut(i)) else {
                com_dprintf(&format!("{}: sequenced packet without connection\n", from));
                continue;
            };
            if cl.netchan.remote_address != from {
                com_printf("SV_ReadPackets: fixing up a translated port\n");
                cl.netchan.remote_address = from;
            }
            if cl.netchan.process(&mut msg, realtime) {
                // this is a valid, sequenced packet, so process it
                cl.incoming.push(msg);
            }
        }
        Ok(())
    }

    /// Drop clients that have been silent longer than the `timeout`
    /// variable allows.
    pub fn check_timeouts(&mut self) -> Result<(), HostError> {
        let droppoint = self.realtime - self.cvar("timeout") as f64;
        let timed_out: Vec<usize> = self
            .svs
            .active_clients()
            .filter(|&i| {
                self.svs
                    .client(i)
                    .map_or(false, |cl| cl.netchan.last_received < droppoint)
            })
            .collect();

        for slot in timed_out {
            if let Some(cl) = self.svs.client(slot) {
                com_printf(&format!("{} timed out\n", cl.name));
            }
            self.drop_client(slot, false)?;
        }
        Ok(())
    }

    /// Advance `realtime`. Returns false if not enough time has passed
    /// for another frame.
    pub fn filter_time(&mut self, time: f64) -> bool {
        self.realtime += time;

        if self.realtime - self.oldrealtime < 1.0 / MAX_FPS {
            return false; // framerate is too high
        }

        self.host_frametime = self.realtime - self.oldrealtime;
        self.oldrealtime = self.realtime;

        let framerate = self.cvar("host_framerate") as f64;
        if framerate > 0.0 {
            self.host_frametime = framerate;
        } else {
            // don't allow really long or short frames
            self.host_frametime = self.host_frametime.clamp(0.001, 0.1);
        }
        true
    }

    /// One server tick. The order of the steps matters.
    pub fn server_frame(&mut self) -> Result<(), HostError> {
        // run the world state
        self.pr.set_g_float(gv::FRAMETIME, self.host_frametime as f32);

        // set the time and clear the general datagram
        self.sv.datagram.clear();

        // check for new clients
        self.read_packets()?;
        self.check_timeouts()?;

        // read client messages
        self.run_clients()?;

        // move things around and think
        if !self.sv.paused {
            self.physics()?;
        }

        // send all messages to the clients
        self.send_client_messages()
    }

    fn run_host_frame(&mut self) -> Result<(), HostError> {
        // process console commands
        for text in std::mem::take(&mut self.cbuf) {
            for line in split_commands(&text) {
                self.host_command(line)?;
            }
        }

        let notices = self.cvars.take_server_notices();
        if !self.sv.active {
            return Ok(());
        }
        for notice in notices {
            self.broadcast_printf(&notice);
        }

        self.server_frame()
    }

    /// Runs all active servers. A fatal error shuts the server down and
    /// the host keeps going.
    pub fn host_frame(&mut self, time: f64) {
        // decide the simulation time
        if !self.filter_time(time) {
            return; // don't run too fast, or packets will flood out
        }

        if let Err(err) = self.run_host_frame() {
            self.host_error(&err);
        }
        self.host_framecount += 1;
    }

    /// Abort the current session. Clients are told before the sockets
    /// go quiet.
    pub fn host_error(&mut self, err: &HostError) {
        log::error!("Host_Error: {}", err);
        com_printf(&format!("Host_Error: {}\n", err));
        self.shutdown_server(false);
        self.cbuf.clear();
    }

    /// Flush what the clients are owed, tell them the server is going
    /// away and drop them all. Only returns once every client's pending
    /// data went out or the flush time ran out.
    pub fn shutdown_server(&mut self, crash: bool) {
        if !self.sv.active {
            return;
        }
        self.sv.active = false;

        // flush any pending messages - like the score!!!
        let start = Instant::now();
        loop {
            let mut count = 0;
            for slot in self.svs.active_clients().collect::<Vec<_>>() {
                let Some(cl) = self.svs.client_mut(slot) else {
                    continue;
                };
                if cl.message.is_empty() {
                    continue;
                }
                Self::queue_reliable(cl);
                if !cl.message.is_empty() {
                    count += 1;
                    continue;
                }
                if let Err(err) = self.transmit_to(slot, &[]) {
                    log::warn!("client {}: {}", slot, err);
                }
            }
            if count == 0 || start.elapsed() >= SHUTDOWN_FLUSH {
                break;
            }
            // take acks so the in-flight messages can clear
            if let Err(err) = self.read_packets() {
                log::warn!("shutdown: {}", err);
            }
            std::thread::yield_now();
        }

        // make sure all the clients know we're disconnecting
        for slot in self.svs.active_clients().collect::<Vec<_>>() {
            if crash {
                if let Err(err) = self.transmit_to(slot, &[SVC_DISCONNECT]) {
                    log::debug!("client {}: {}", slot, err);
                }
            }
            if let Err(err) = self.drop_client(slot, crash) {
                log::warn!("dropping client {}: {}", slot, err);
                self.svs.clients[slot] = None;
            }
        }

        // clear structures
        self.sv = Server::default();
        for cl in self.svs.clients.iter_mut() {
            *cl = None;
        }
        log::info!("server shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use crate::progs::{ev, Opcode};
    use assert_approx_eq::assert_approx_eq;
    use myq1_common::cmodel::BrushModel;
    use myq1_common::net::{LoopbackHub, NetDriver};
    use myq1_common::net_chan::out_of_band;

    fn running_server(hub: &LoopbackHub) -> ServerContext {
        let mut b = ProgsBuilder::new();
        b.builtin_field("classname", 1, ev::CLASSNAME);
        b.function("worldspawn", 0, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        let mut assets = MemoryAssets::new(b.build());
        let mut room = BrushModel::room("maps/start.bsp", &[-256.0; 3], &[256.0; 3]);
        room.entities = "{ \"classname\" \"worldspawn\" }".to_string();
        assets.add_brush(room);

        let mut ctx = ServerContext::new(Box::new(assets));
        ctx.set_maxclients(2);
        ctx.svs.driver = Some(Box::new(hub.driver(1)));
        ctx.spawn_server("start").unwrap();
        ctx
    }

    fn reply(remote: &mut dyn NetDriver) -> String {
        let mut msg = SizeBuf::new(MAX_PACKETLEN);
        assert_eq!(remote.get_packet(&mut msg), Some(NetAdr::Loopback(1)));
        assert!(is_out_of_band(&msg));
        out_of_band_text(&msg)
    }

    fn connect(remote: &mut dyn NetDriver, text: &str) {
        out_of_band(remote, &NetAdr::Loopback(1), text.as_bytes());
    }

    #[test]
    fn test_connect_is_accepted() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut remote = hub.driver(2);

        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();

        assert_eq!(reply(&mut remote), "accept");
        let cl = ctx.svs.client(0).expect("slot 0");
        assert_eq!(cl.edict, 1);
        assert_eq!(cl.netchan.qport, 7);
        assert_eq!(cl.netchan.remote_address, NetAdr::Loopback(2));
        assert_eq!(cl.message.as_slice()[0], SVC_PRINT, "serverinfo is queued");
    }

    #[test]
    fn test_connect_rejections() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut remote = hub.driver(2);

        connect(&mut remote, "connect 14 7");
        ctx.read_packets().unwrap();
        assert!(reply(&mut remote).starts_with("reject Server is version"));

        ctx.svs.banned.push("loopback:2".into());
        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();
        assert_eq!(reply(&mut remote), "reject You have been banned.\n");
        ctx.svs.banned.clear();

        let mut a = hub.driver(3);
        let mut b = hub.driver(4);
        connect(&mut a, "connect 15 1");
        connect(&mut b, "connect 15 2");
        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();
        assert_eq!(reply(&mut a), "accept");
        assert_eq!(reply(&mut b), "accept");
        assert_eq!(reply(&mut remote), "reject Server is full.\n");
    }

    #[test]
    fn test_repeated_connect_reuses_slot() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut remote = hub.driver(2);

        connect(&mut remote, "connect 15 7");
        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();
        assert_eq!(reply(&mut remote), "accept");
        assert_eq!(reply(&mut remote), "accept");
        assert_eq!(ctx.svs.active_clients().count(), 1);
    }

    #[test]
    fn test_sequenced_packets_are_queued() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut remote = hub.driver(2);
        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();

        let mut chan = NetChan::new(NetSrc::Client, NetAdr::Loopback(1), 7, 0.0);
        chan.transmit(&mut remote, &[CLC_NOP], 0.0).unwrap();
        ctx.read_packets().unwrap();
        let cl = ctx.svs.client(0).unwrap();
        assert_eq!(cl.incoming.len(), 1);
        assert_eq!(cl.incoming[0].as_slice()[cl.incoming[0].readcount], CLC_NOP);

        // wrong qport is somebody else
        let mut other = NetChan::new(NetSrc::Client, NetAdr::Loopback(1), 8, 0.0);
        other.transmit(&mut remote, &[CLC_NOP], 0.0).unwrap();
        ctx.read_packets().unwrap();
        assert_eq!(ctx.svs.client(0).unwrap().incoming.len(), 1);
    }

    #[test]
    fn test_drop_client_notifies_the_others() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut a = hub.driver(3);
        let mut b = hub.driver(4);
        connect(&mut a, "connect 15 1");
        connect(&mut b, "connect 15 2");
        ctx.read_packets().unwrap();
        ctx.svs.client_mut(1).unwrap().message.clear();

        ctx.drop_client(0, false).unwrap();
        assert!(ctx.svs.client(0).is_none());
        let msg = ctx.svs.client(1).unwrap().message.as_slice().to_vec();
        assert_eq!(
            msg,
            vec![SVC_UPDATENAME, 0, 0, SVC_UPDATEFRAGS, 0, 0, 0, SVC_UPDATECOLORS, 0, 0]
        );
    }

    #[test]
    fn test_silent_clients_time_out() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut remote = hub.driver(2);
        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();

        ctx.realtime = 30.0;
        ctx.check_timeouts().unwrap();
        assert!(ctx.svs.client(0).is_some());

        ctx.realtime = 61.0;
        ctx.check_timeouts().unwrap();
        assert!(ctx.svs.client(0).is_none());
    }

    #[test]
    fn test_filter_time() {
        let mut ctx = context_with(&ProgsBuilder::new());
        assert!(!ctx.filter_time(0.005), "over 72 fps");
        assert!(ctx.filter_time(0.01));
        assert_approx_eq!(ctx.host_frametime, 0.015, 1e-9);

        assert!(ctx.filter_time(2.0));
        assert_approx_eq!(ctx.host_frametime, 0.1, 1e-9);

        ctx.cvars.set("host_framerate", "0.05");
        assert!(ctx.filter_time(0.5));
        assert_approx_eq!(ctx.host_frametime, 0.05, 1e-9);
    }

    #[test]
    fn test_host_frame_runs_queued_commands() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        ctx.shutdown_server(false);
        assert!(!ctx.sv.active);

        ctx.cbuf.push("skill 2; map start".into());
        ctx.host_frame(0.1);
        assert!(ctx.sv.active);
        assert_eq!(ctx.cvar("skill"), 2.0);
        assert_eq!(ctx.host_framecount, 1);
        // spawn settles two frames, then the first tick
        assert_approx_eq!(ctx.sv.time, 1.3, 1e-6);
    }

    #[test]
    fn test_server_cvar_changes_are_announced() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut remote = hub.driver(2);
        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();
        assert_eq!(reply(&mut remote), "accept");
        let cl = ctx.svs.client_mut(0).unwrap();
        cl.message.clear();
        cl.spawned = true;

        ctx.cbuf.push("sv_gravity 100".into());
        ctx.run_host_frame().unwrap();
        assert_eq!(ctx.cvar("sv_gravity"), 100.0);
        // the print went out on the reliable channel
        let mut msg = SizeBuf::new(MAX_PACKETLEN);
        assert!(remote.get_packet(&mut msg).is_some());
        assert!(String::from_utf8_lossy(msg.as_slice()).contains("\"sv_gravity\" changed to \"100\""));
    }

    #[test]
    fn test_shutdown_tells_clients() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        let mut remote = hub.driver(2);
        connect(&mut remote, "connect 15 7");
        ctx.read_packets().unwrap();
        assert_eq!(reply(&mut remote), "accept");
        ctx.svs.client_mut(0).unwrap().message.clear();

        ctx.shutdown_server(false);
        assert!(!ctx.sv.active);
        assert_eq!(ctx.svs.active_clients().count(), 0);

        let mut msg = SizeBuf::new(MAX_PACKETLEN);
        assert!(remote.get_packet(&mut msg).is_some());
        let mut chan = NetChan::new(NetSrc::Client, NetAdr::Loopback(1), 7, 0.0);
        assert!(chan.process(&mut msg, 0.0));
        assert_eq!(msg_read_byte(&mut msg), SVC_DISCONNECT as i32);
    }

    #[test]
    fn test_host_error_shuts_down() {
        let hub = LoopbackHub::new();
        let mut ctx = running_server(&hub);
        ctx.cbuf.push("map start".into());
        ctx.host_error(&HostError::Fatal("bad things".into()));
        assert!(!ctx.sv.active);
        assert!(ctx.cbuf.is_empty());
    }
}
