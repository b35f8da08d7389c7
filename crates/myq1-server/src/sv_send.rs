// sv_send.rs — event messages, signon data and per-frame client updates
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::net::SendStatus;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::pr_exec::{VmError, VmFault};
use crate::progs::{ev, gv};
use crate::server::*;

// ============================================================
// EVENT MESSAGES
// ============================================================

impl ServerContext {
    /// Send text to one client's console.
    pub fn client_printf(&mut self, client: usize, s: &str) {
        if let Some(cl) = self.svs.client_mut(client) {
            msg_write_byte(&mut cl.message, SVC_PRINT as i32);
            msg_write_string(&mut cl.message, s);
        }
    }

    /// Send text to every spawned client and echo it to the log.
    pub fn broadcast_printf(&mut self, s: &str) {
        for cl in self.svs.clients.iter_mut().flatten() {
            if cl.active && cl.spawned {
                msg_write_byte(&mut cl.message, SVC_PRINT as i32);
                msg_write_string(&mut cl.message, s);
            }
        }
        com_printf(s);
    }

    /// Make sure the event gets sent to all clients.
    pub fn start_particle(&mut self, org: &Vec3, dir: &Vec3, color: i32, count: i32) {
        let msg = &mut self.sv.datagram;
        if msg.cursize > MAX_DATAGRAM - 16 {
            return;
        }
        msg_write_byte(msg, SVC_PARTICLE as i32);
        msg_write_pos(msg, org);
        for d in dir {
            let v = ((d * 16.0) as i32).clamp(-128, 127);
            msg_write_char(msg, v);
        }
        msg_write_byte(msg, count);
        msg_write_byte(msg, color);
    }

    /// Each entity can have eight independent sound sources, like voice,
    /// weapon, feet, etc.
    ///
    /// Channel 0 is an auto-allocate channel, the others override anything
    /// already running on that entity/channel pair. An attenuation of 0
    /// will play full volume everywhere in the level; larger attenuations
    /// drop off faster.
    pub fn start_sound(
        &mut self,
        e: usize,
        channel: i32,
        sample: &str,
        volume: i32,
        attenuation: f32,
    ) -> Result<(), VmError> {
        if !(0..=255).contains(&volume) {
            return Err(self.run_error(VmFault::Script(format!("SV_StartSound: volume = {}", volume))));
        }
        if !(0.0..=4.0).contains(&attenuation) {
            return Err(self.run_error(VmFault::Script(format!(
                "SV_StartSound: attenuation = {}",
                attenuation
            ))));
        }
        if !(0..=7).contains(&channel) {
            return Err(self.run_error(VmFault::Script(format!("SV_StartSound: channel = {}", channel))));
        }

        if self.sv.datagram.cursize > MAX_DATAGRAM - 16 {
            return Ok(());
        }

        // find precache number for sound
        let sound_num = match self.sv.sound_precache.iter().skip(1).position(|s| s == sample) {
            Some(i) => i + 1,
            None => {
                com_printf(&format!("SV_StartSound: {} not precacheed\n", sample));
                return Ok(());
            }
        };

        let ed = self.edict(e);
        let origin = ed.origin();
        let mins = ed.vector(ev::MINS);
        let maxs = ed.vector(ev::MAXS);
        let channel = ((e as i32) << 3) | channel;

        let mut field_mask = 0;
        if volume != DEFAULT_SOUND_PACKET_VOLUME {
            field_mask |= SND_VOLUME;
        }
        if attenuation != DEFAULT_SOUND_PACKET_ATTENUATION {
            field_mask |= SND_ATTENUATION;
        }

        let msg = &mut self.sv.datagram;
        msg_write_byte(msg, SVC_SOUND as i32);
        msg_write_byte(msg, field_mask);
        if field_mask & SND_VOLUME != 0 {
            msg_write_byte(msg, volume);
        }
        if field_mask & SND_ATTENUATION != 0 {
            msg_write_byte(msg, (attenuation * 64.0) as i32);
        }
        msg_write_short(msg, channel);
        msg_write_byte(msg, sound_num as i32);
        for i in 0..3 {
            msg_write_coord(msg, origin[i] + 0.5 * (mins[i] + maxs[i]));
        }
        Ok(())
    }

    // ============================================================
    // CLIENT SPAWNING
    // ============================================================

    /// Sends the first message from the server to a connected client.
    /// This will be sent on the initial connection and upon each server
    /// load.
    pub fn send_server_info(&mut self, client: usize) {
        let maxclients = self.svs.maxclients;
        let gametype = if self.cvar("coop") == 0.0 && self.cvar("deathmatch") != 0.0 {
            GAME_DEATHMATCH
        } else {
            GAME_COOP
        };
        let world = self.edict(0);
        let levelname = self.pr.get_string(world.string(ev::MESSAGE)).into_owned();
        let cdtrack = world.float(ev::SOUNDS) as i32;
        let banner = format!("\u{2}\nVERSION {:4.2} SERVER ({} CRC)", VERSION, self.pr.dat.crc);

        let models = &self.sv.model_precache;
        let sounds = &self.sv.sound_precache;
        let Some(cl) = self.svs.clients.get_mut(client).and_then(|c| c.as_mut()) else {
            return;
        };
        let msg = &mut cl.message;

        msg_write_byte(msg, SVC_PRINT as i32);
        msg_write_string(msg, &banner);

        msg_write_byte(msg, SVC_SERVERINFO as i32);
        msg_write_long(msg, PROTOCOL_VERSION);
        msg_write_byte(msg, maxclients as i32);
        msg_write_byte(msg, gametype);
        msg_write_string(msg, &levelname);

        for m in models.iter().skip(1) {
            msg_write_string(msg, m);
        }
        msg_write_byte(msg, 0);

        for s in sounds.iter().skip(1) {
            msg_write_string(msg, s);
        }
        msg_write_byte(msg, 0);

        // send music
        msg_write_byte(msg, SVC_CDTRACK as i32);
        msg_write_byte(msg, cdtrack);
        msg_write_byte(msg, cdtrack);

        // set view
        msg_write_byte(msg, SVC_SETVIEW as i32);
        msg_write_short(msg, ServerContext::client_edict(client) as i32);

        msg_write_byte(msg, SVC_SIGNONNUM as i32);
        msg_write_byte(msg, 1);

        cl.sendsignon = true;
        cl.spawned = false; // need prespawn, spawn, etc
    }

    // ============================================================
    // FRAME UPDATES
    // ============================================================

    /// Entity updates for everything in the PVS of `clent`.
    pub fn write_entities_to_client(&self, clent: usize, msg: &mut SizeBuf) {
        // find the client's PVS
        let c = self.edict(clent);
        let org = vector_add(&c.origin(), &c.vector(ev::VIEW_OFS));
        let pvs = self.sv.worldmodel.fat_pvs(&org);

        // send over all entities (except the client) that touch the pvs
        for e in 1..self.sv.num_edicts() {
            let ent = self.edict(e);
            if ent.free {
                continue;
            }

            // clent is always sent
            if e != clent {
                if ent.float(ev::MODELINDEX) == 0.0 || self.pr.get_string(ent.string(ev::MODEL)).is_empty() {
                    continue;
                }
                let visible = ent.leafnums[..ent.num_leafs].iter().any(|&l| {
                    let l = l as usize;
                    pvs.get(l >> 3).map_or(false, |b| b & (1 << (l & 7)) != 0)
                });
                if !visible {
                    continue;
                }
            }

            if msg.remaining() < 16 {
                com_printf("packet overflow\n");
                return;
            }

            // send an update
            let base = &ent.baseline;
            let origin = ent.origin();
            let angles = ent.vector(ev::ANGLES);
            let modelindex = ent.float(ev::MODELINDEX) as i32;
            let frame = ent.float(ev::FRAME) as i32;
            let colormap = ent.float(ev::COLORMAP) as i32;
            let skin = ent.float(ev::SKIN) as i32;
            let effects = ent.float(ev::EFFECTS) as i32;

            let mut bits = 0;
            for i in 0..3 {
                let miss = origin[i] - base.origin[i];
                if !(-0.1..=0.1).contains(&miss) {
                    bits |= U_ORIGIN1 << i;
                }
            }
            if angles[0] != base.angles[0] {
                bits |= U_ANGLE1;
            }
            if angles[1] != base.angles[1] {
                bits |= U_ANGLE2;
            }
            if angles[2] != base.angles[2] {
                bits |= U_ANGLE3;
            }
            if ent.movetype() == MOVETYPE_STEP {
                bits |= U_NOLERP; // don't mess up the step animation
            }
            if base.colormap != colormap {
                bits |= U_COLORMAP;
            }
            if base.skin != skin {
                bits |= U_SKIN;
            }
            if base.frame != frame {
                bits |= U_FRAME;
            }
            if base.effects != effects {
                bits |= U_EFFECTS;
            }
            if base.modelindex != modelindex {
                bits |= U_MODEL;
            }
            if e >= 256 {
                bits |= U_LONGENTITY;
            }
            if bits >= 256 {
                bits |= U_MOREBITS;
            }

            // write the message
            msg_write_byte(msg, bits | U_SIGNAL);
            if bits & U_MOREBITS != 0 {
                msg_write_byte(msg, bits >> 8);
            }
            if bits & U_LONGENTITY != 0 {
                msg_write_short(msg, e as i32);
            } else {
                msg_write_byte(msg, e as i32);
            }

            if bits & U_MODEL != 0 {
                msg_write_byte(msg, modelindex);
            }
            if bits & U_FRAME != 0 {
                msg_write_byte(msg, frame);
            }
            if bits & U_COLORMAP != 0 {
                msg_write_byte(msg, colormap);
            }
            if bits & U_SKIN != 0 {
                msg_write_byte(msg, skin);
            }
            if bits & U_EFFECTS != 0 {
                msg_write_byte(msg, effects);
            }
            if bits & U_ORIGIN1 != 0 {
                msg_write_coord(msg, origin[0]);
            }
            if bits & U_ANGLE1 != 0 {
                msg_write_angle(msg, angles[0]);
            }
            if bits & U_ORIGIN2 != 0 {
                msg_write_coord(msg, origin[1]);
            }
            if bits & U_ANGLE2 != 0 {
                msg_write_angle(msg, angles[1]);
            }
            if bits & U_ORIGIN3 != 0 {
                msg_write_coord(msg, origin[2]);
            }
            if bits & U_ANGLE3 != 0 {
                msg_write_angle(msg, angles[2]);
            }
        }
    }

    /// Damage, view angle fixes and the status bar values of the client
    /// edict `e`.
    pub fn write_client_data_to_message(&mut self, e: usize, msg: &mut SizeBuf) -> Result<(), VmError> {
        // send a damage message
        let ent = self.edict(e);
        let dmg_take = ent.float(ev::DMG_TAKE);
        let dmg_save = ent.float(ev::DMG_SAVE);
        if dmg_take != 0.0 || dmg_save != 0.0 {
            let inflictor = ent.v[ev::DMG_INFLICTOR].as_int();
            match usize::try_from(inflictor).ok().and_then(|i| self.sv.edicts.get(i)) {
                Some(other) => {
                    let org = other.origin();
                    let (mins, maxs) = (other.vector(ev::MINS), other.vector(ev::MAXS));
                    msg_write_byte(msg, SVC_DAMAGE as i32);
                    msg_write_byte(msg, dmg_save as i32);
                    msg_write_byte(msg, dmg_take as i32);
                    for i in 0..3 {
                        msg_write_coord(msg, org[i] + 0.5 * (mins[i] + maxs[i]));
                    }
                }
                None => log::warn!("edict {}: damage from bad inflictor {}", e, inflictor),
            }
            let ent = self.edict_mut(e);
            ent.set_float(ev::DMG_TAKE, 0.0);
            ent.set_float(ev::DMG_SAVE, 0.0);
        }

        // how much to look up / down ideally
        self.set_ideal_pitch(e)?;

        // a fixangle might get lost in a dropped packet. Oh well.
        if self.edict(e).float(ev::FIXANGLE) != 0.0 {
            let angles = self.edict(e).vector(ev::ANGLES);
            msg_write_byte(msg, SVC_SETANGLE as i32);
            for a in angles {
                msg_write_angle(msg, a);
            }
            self.edict_mut(e).set_float(ev::FIXANGLE, 0.0);
        }

        let ent = self.edict(e);
        let view_ofs = ent.vector(ev::VIEW_OFS);
        let idealpitch = ent.float(ev::IDEALPITCH);
        let punch = ent.vector(ev::PUNCHANGLE);
        let velocity = ent.vector(ev::VELOCITY);
        let weaponframe = ent.float(ev::WEAPONFRAME);
        let armor = ent.float(ev::ARMORVALUE);

        let mut bits = 0;
        if view_ofs[2] != DEFAULT_VIEWHEIGHT {
            bits |= SU_VIEWHEIGHT;
        }
        if idealpitch != 0.0 {
            bits |= SU_IDEALPITCH;
        }

        // stuff the sigil bits into the high bits of items for sbar, or
        // else mix in items2
        let items = match self.pr.field_items2 {
            Some(ofs) => ent.float(ev::ITEMS) as i32 | ((ent.float(ofs) as i32) << 23),
            None => ent.float(ev::ITEMS) as i32 | ((self.pr.g_float(gv::SERVERFLAGS) as i32) << 28),
        };
        bits |= SU_ITEMS;

        if self.edict_flags(e).contains(EdictFlags::ONGROUND) {
            bits |= SU_ONGROUND;
        }
        if ent.float(ev::WATERLEVEL) >= 2.0 {
            bits |= SU_INWATER;
        }
        for i in 0..3 {
            if punch[i] != 0.0 {
                bits |= SU_PUNCH1 << i;
            }
            if velocity[i] != 0.0 {
                bits |= SU_VELOCITY1 << i;
            }
        }
        if weaponframe != 0.0 {
            bits |= SU_WEAPONFRAME;
        }
        if armor != 0.0 {
            bits |= SU_ARMOR;
        }
        bits |= SU_WEAPON;

        // send the data
        msg_write_byte(msg, SVC_CLIENTDATA as i32);
        msg_write_short(msg, bits);

        if bits & SU_VIEWHEIGHT != 0 {
            msg_write_char(msg, view_ofs[2] as i32);
        }
        if bits & SU_IDEALPITCH != 0 {
            msg_write_char(msg, idealpitch as i32);
        }
        for i in 0..3 {
            if bits & (SU_PUNCH1 << i) != 0 {
                msg_write_char(msg, punch[i] as i32);
            }
            if bits & (SU_VELOCITY1 << i) != 0 {
                msg_write_char(msg, (velocity[i] / 16.0) as i32);
            }
        }

        // always sent
        msg_write_long(msg, items);

        if bits & SU_WEAPONFRAME != 0 {
            msg_write_byte(msg, weaponframe as i32);
        }
        if bits & SU_ARMOR != 0 {
            msg_write_byte(msg, armor as i32);
        }
        let weaponmodel = self.pr.get_string(ent.string(ev::WEAPONMODEL));
        msg_write_byte(msg, self.model_index(&weaponmodel) as i32);

        msg_write_short(msg, ent.float(ev::HEALTH) as i32);
        msg_write_byte(msg, ent.float(ev::CURRENTAMMO) as i32);
        msg_write_byte(msg, ent.float(ev::AMMO_SHELLS) as i32);
        msg_write_byte(msg, ent.float(ev::AMMO_NAILS) as i32);
        msg_write_byte(msg, ent.float(ev::AMMO_ROCKETS) as i32);
        msg_write_byte(msg, ent.float(ev::AMMO_CELLS) as i32);
        msg_write_byte(msg, ent.float(ev::WEAPON) as i32);
        Ok(())
    }

    /// Hand one packet to client `slot`'s channel.
    pub(crate) fn transmit_to(&mut self, slot: usize, data: &[u8]) -> Result<SendStatus, ProtocolError> {
        let now = self.realtime;
        let svs = &mut self.svs;
        match (svs.driver.as_deref_mut(), svs.clients.get_mut(slot)) {
            (Some(driver), Some(Some(cl))) => cl.netchan.transmit(driver, data, now),
            _ => Ok(SendStatus::Dropped),
        }
    }

    fn send_client_datagram(&mut self, slot: usize) -> Result<bool, HostError> {
        let e = ServerContext::client_edict(slot);
        let mut msg = SizeBuf::new(MAX_DATAGRAM);

        msg_write_byte(&mut msg, SVC_TIME as i32);
        msg_write_float(&mut msg, self.sv.time as f32);

        // add the client specific data to the datagram
        let result = self.write_client_data_to_message(e, &mut msg);
        self.contain_fault(result)?;
        self.write_entities_to_client(e, &mut msg);

        // copy the server datagram if there is space
        if msg.cursize + self.sv.datagram.cursize < msg.maxsize {
            msg.write(self.sv.datagram.as_slice());
        }

        // send the datagram
        match self.transmit_to(slot, msg.as_slice()) {
            Ok(_) => Ok(true),
            Err(err) => {
                log::warn!("client {}: {}", slot, err);
                self.drop_client(slot, true)?;
                Ok(false)
            }
        }
    }

    fn update_to_reliable_messages(&mut self) {
        // check for changes to be sent over the reliable streams
        for i in 0..self.svs.maxclients {
            let Some(old_frags) = self.svs.client(i).map(|c| c.old_frags) else {
                continue;
            };
            let frags = self.edict(ServerContext::client_edict(i)).float(ev::FRAGS) as i32;
            if old_frags == frags {
                continue;
            }
            for cl in self.svs.clients.iter_mut().flatten() {
                if !cl.active {
                    continue;
                }
                msg_write_byte(&mut cl.message, SVC_UPDATEFRAGS as i32);
                msg_write_byte(&mut cl.message, i as i32);
                msg_write_short(&mut cl.message, frags);
            }
            if let Some(cl) = self.svs.client_mut(i) {
                cl.old_frags = frags;
            }
        }

        let reliable = self.sv.reliable_datagram.as_slice();
        for cl in self.svs.clients.iter_mut().flatten() {
            if cl.active {
                cl.message.write(reliable);
            }
        }
        self.sv.reliable_datagram.clear();
    }

    /// Send a nop message without trashing or sending the accumulated
    /// client message buffer.
    fn send_nop(&mut self, slot: usize) {
        if let Err(err) = self.transmit_to(slot, &[SVC_NOP]) {
            log::warn!("client {}: {}", slot, err);
        }
        if let Some(cl) = self.svs.client_mut(slot) {
            cl.last_message = self.realtime;
        }
    }

    /// Queue the client's pending reliable data on its channel if the
    /// channel will take it.
    pub(crate) fn queue_reliable(cl: &mut Client) {
        if cl.message.is_empty() || !cl.netchan.can_reliable() {
            return;
        }
        if cl.netchan.message.remaining() < cl.message.cursize {
            return;
        }
        cl.netchan.message.write(cl.message.as_slice());
        cl.message.clear();
    }

    pub fn send_client_messages(&mut self) -> Result<(), HostError> {
        // update frags, names, etc
        self.update_to_reliable_messages();

        // build individual updates
        for slot in 0..self.svs.maxclients {
            let Some(cl) = self.svs.client(slot) else {
                continue;
            };
            if !cl.active {
                continue;
            }

            // check for an overflowed message. Should only happen on a
            // very bad up connection that backs up a lot, then changes
            // level
            if cl.message.overflowed || cl.message.cursize > cl.netchan.message.maxsize {
                com_printf(&format!("WARNING: reliable overflow for {}\n", cl.name));
                self.drop_client(slot, true)?;
                continue;
            }

            if cl.dropasap && cl.netchan.can_reliable() {
                self.drop_client(slot, false)?; // went to another level
                continue;
            }

            let spawned = cl.spawned;
            let sendsignon = cl.sendsignon;
            let realtime = self.realtime;
            let Some(cl) = self.svs.client_mut(slot) else {
                continue;
            };
            let had_message = !cl.message.is_empty();
            Self::queue_reliable(cl);
            if had_message && cl.message.is_empty() {
                cl.last_message = realtime;
                cl.sendsignon = false;
            }

            if spawned {
                self.send_client_datagram(slot)?;
                continue;
            }

            // the player isn't totally in the game yet
            // send small keepalive messages if too much time has passed
            // send a full message when the next signon stage has been
            // requested; other message data (name changes, etc) may
            // accumulate between signon stages
            let (need, last_message) = match self.svs.client(slot) {
                Some(cl) => (cl.netchan.need_reliable(), cl.last_message),
                None => continue,
            };
            if need {
                if let Err(err) = self.transmit_to(slot, &[]) {
                    log::warn!("client {}: {}", slot, err);
                    self.drop_client(slot, true)?;
                }
            } else if !sendsignon && realtime - last_message > 5.0 {
                self.send_nop(slot);
            }
        }

        // clear muzzle flashes
        self.cleanup_ents();
        Ok(())
    }

    fn cleanup_ents(&mut self) {
        for ent in self.sv.edicts.iter_mut().skip(1) {
            let effects = ent.float(ev::EFFECTS) as i32;
            if effects & EF_MUZZLEFLASH != 0 {
                ent.set_float(ev::EFFECTS, (effects & !EF_MUZZLEFLASH) as f32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use myq1_common::net::{LoopbackHub, NetAdr, NetDriver};
    use myq1_common::net_chan::{NetChan, NetSrc};

    fn with_client() -> (ServerContext, Box<dyn NetDriver>) {
        let mut ctx = context_with(&ProgsBuilder::new());
        let hub = LoopbackHub::new();
        ctx.svs.driver = Some(Box::new(hub.driver(1)));
        let remote = hub.driver(2);
        let chan = NetChan::new(NetSrc::Server, NetAdr::Loopback(2), 0, 0.0);
        ctx.svs.clients[0] = Some(Client::new(chan, 1));
        ctx.sv.model_precache = vec![String::new(), "maps/test.bsp".into()];
        ctx.sv.sound_precache = vec![String::new(), "misc/h2ohit1.wav".into()];
        (ctx, Box::new(remote))
    }

    #[test]
    fn test_start_sound_encoding() {
        let (mut ctx, _remote) = with_client();
        ctx.edict_mut(1).set_vector(ev::ORIGIN, &[8.0, 0.0, 0.0]);
        ctx.start_sound(1, 2, "misc/h2ohit1.wav", 255, 1.0).unwrap();
        let d = ctx.sv.datagram.as_slice().to_vec();
        assert_eq!(d[0], SVC_SOUND);
        assert_eq!(d[1], 0, "default volume and attenuation are implied");
        assert_eq!(i16::from_le_bytes([d[2], d[3]]), (1 << 3) | 2);
        assert_eq!(d[4], 1);
        assert_eq!(i16::from_le_bytes([d[5], d[6]]), 64);

        // missing precache is not an error
        ctx.sv.datagram.clear();
        ctx.start_sound(1, 0, "missing.wav", 255, 1.0).unwrap();
        assert!(ctx.sv.datagram.is_empty());

        let err = ctx.start_sound(1, 8, "misc/h2ohit1.wav", 255, 1.0).unwrap_err();
        assert!(matches!(err.fault(), Some(VmFault::Script(_))));
    }

    #[test]
    fn test_damage_from_bad_inflictor_skips_direction() {
        let mut ctx = context_with(&ProgsBuilder::new());
        let ed = ctx.edict_mut(1);
        ed.set_float(ev::DMG_TAKE, 10.0);
        ed.set_entity(ev::DMG_INFLICTOR, 5000);
        let mut msg = SizeBuf::new(1024);
        ctx.write_client_data_to_message(1, &mut msg).unwrap();
        assert_eq!(msg.as_slice()[0], SVC_CLIENTDATA);
        assert_eq!(ctx.edict(1).float(ev::DMG_TAKE), 0.0);

        ctx.edict_mut(1).set_float(ev::DMG_TAKE, 10.0);
        ctx.edict_mut(1).set_entity(ev::DMG_INFLICTOR, 0);
        msg.clear();
        ctx.write_client_data_to_message(1, &mut msg).unwrap();
        let d = msg.as_slice();
        assert_eq!(d[0], SVC_DAMAGE);
        assert_eq!(d[2], 10);
        assert_eq!(d[9], SVC_CLIENTDATA, "direction is three coords");
    }

    #[test]
    fn test_items2_mixed_into_status_bits() {
        let mut b = ProgsBuilder::new();
        let items2 = b.field("items2", 2);
        let mut ctx = context_with(&b);
        assert_eq!(ctx.pr.field_items2, Some(items2));
        let ed = ctx.edict_mut(1);
        ed.set_vector(ev::VIEW_OFS, &[0.0, 0.0, DEFAULT_VIEWHEIGHT]);
        ed.set_float(ev::ITEMS, 3.0);
        ed.set_float(items2, 2.0);
        let mut msg = SizeBuf::new(1024);
        ctx.write_client_data_to_message(1, &mut msg).unwrap();
        let d = msg.as_slice();
        assert_eq!(d[0], SVC_CLIENTDATA);
        assert_eq!(i32::from_le_bytes([d[3], d[4], d[5], d[6]]), 3 | (2 << 23));

        // without the field the server flags fill the high bits
        let mut ctx = context_with(&ProgsBuilder::new());
        assert_eq!(ctx.pr.field_items2, None);
        ctx.edict_mut(1).set_vector(ev::VIEW_OFS, &[0.0, 0.0, DEFAULT_VIEWHEIGHT]);
        ctx.pr.set_g_float(gv::SERVERFLAGS, 1.0);
        msg.clear();
        ctx.write_client_data_to_message(1, &mut msg).unwrap();
        let d = msg.as_slice();
        assert_eq!(i32::from_le_bytes([d[3], d[4], d[5], d[6]]), 1 << 28);
    }

    #[test]
    fn test_start_sound_optional_fields() {
        let (mut ctx, _remote) = with_client();
        ctx.start_sound(1, 0, "misc/h2ohit1.wav", 128, 2.0).unwrap();
        let d = ctx.sv.datagram.as_slice();
        assert_eq!(d[1] as i32, SND_VOLUME | SND_ATTENUATION);
        assert_eq!(d[2], 128);
        assert_eq!(d[3], 128);
    }

    #[test]
    fn test_particle_direction_is_clamped() {
        let (mut ctx, _remote) = with_client();
        ctx.start_particle(&[0.0; 3], &[100.0, -100.0, 1.0], 73, 20);
        let d = ctx.sv.datagram.as_slice();
        assert_eq!(d[0], SVC_PARTICLE);
        assert_eq!(&d[7..10], &[127u8, 0x80, 16]);
        assert_eq!(d[10], 20);
        assert_eq!(d[11], 73);
    }

    #[test]
    fn test_server_info_ends_with_signon() {
        let (mut ctx, _remote) = with_client();
        ctx.send_server_info(0);
        let cl = ctx.svs.client(0).unwrap();
        let msg = cl.message.as_slice();
        assert!(cl.sendsignon);
        assert!(!cl.spawned);
        assert_eq!(&msg[msg.len() - 2..], &[SVC_SIGNONNUM, 1]);
        let text = String::from_utf8_lossy(msg);
        assert!(text.contains("maps/test.bsp"));
        assert!(text.contains("misc/h2ohit1.wav"));
    }

    #[test]
    fn test_prints_reach_only_spawned_clients() {
        let (mut ctx, _remote) = with_client();
        ctx.broadcast_printf("hello\n");
        assert!(ctx.svs.client(0).unwrap().message.is_empty());

        ctx.svs.client_mut(0).unwrap().spawned = true;
        ctx.broadcast_printf("hello\n");
        ctx.client_printf(0, "you\n");
        let msg = ctx.svs.client(0).unwrap().message.as_slice().to_vec();
        assert_eq!(msg[0], SVC_PRINT);
        assert_eq!(&msg[1..8], b"hello\n\0");
        assert_eq!(msg[8], SVC_PRINT);
    }

    #[test]
    fn test_frag_changes_are_broadcast() {
        let (mut ctx, _remote) = with_client();
        ctx.svs.client_mut(0).unwrap().old_frags = 0;
        ctx.edict_mut(1).set_float(ev::FRAGS, 3.0);
        msg_write_byte(&mut ctx.sv.reliable_datagram, SVC_NOP as i32);
        ctx.update_to_reliable_messages();
        let msg = ctx.svs.client(0).unwrap().message.as_slice().to_vec();
        assert_eq!(msg, vec![SVC_UPDATEFRAGS, 0, 3, 0, SVC_NOP]);
        assert!(ctx.sv.reliable_datagram.is_empty());
        assert_eq!(ctx.svs.client(0).unwrap().old_frags, 3);
    }

    #[test]
    fn test_signon_message_goes_out_reliably() {
        let (mut ctx, mut remote) = with_client();
        ctx.send_server_info(0);
        ctx.send_client_messages().unwrap();

        let cl = ctx.svs.client(0).unwrap();
        assert!(cl.message.is_empty());
        assert!(!cl.sendsignon);
        assert!(!cl.netchan.can_reliable(), "waiting for the ack");

        let mut pkt = SizeBuf::new(MAX_PACKETLEN);
        assert_eq!(remote.get_packet(&mut pkt), Some(NetAdr::Loopback(1)));
        let mut chan = NetChan::new(NetSrc::Client, NetAdr::Loopback(1), 0, 0.0);
        assert!(chan.process(&mut pkt, 0.0));
        assert_eq!(msg_read_byte(&mut pkt), SVC_PRINT as i32);
    }

    #[test]
    fn test_muzzle_flash_cleared_after_send() {
        let (mut ctx, _remote) = with_client();
        ctx.edict_mut(1).set_float(ev::EFFECTS, (EF_MUZZLEFLASH | EF_DIMLIGHT) as f32);
        ctx.send_client_messages().unwrap();
        assert_eq!(ctx.edict(1).float(ev::EFFECTS) as i32, EF_DIMLIGHT);
    }
}
