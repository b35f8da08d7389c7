// cl_parse.rs — parse a message received from the server
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::client::*;

fn svc_name(cmd: u8) -> &'static str {
    const NAMES: [&str; 35] = [
        "svc_bad",
        "svc_nop",
        "svc_disconnect",
        "svc_updatestat",
        "svc_version",
        "svc_setview",
        "svc_sound",
        "svc_time",
        "svc_print",
        "svc_stufftext",
        "svc_setangle",
        "svc_serverinfo",
        "svc_lightstyle",
        "svc_updatename",
        "svc_updatefrags",
        "svc_clientdata",
        "svc_stopsound",
        "svc_updatecolors",
        "svc_particle",
        "svc_damage",
        "svc_spawnstatic",
        "svc_spawnbinary",
        "svc_spawnbaseline",
        "svc_temp_entity",
        "svc_setpause",
        "svc_signonnum",
        "svc_centerprint",
        "svc_killedmonster",
        "svc_foundsecret",
        "svc_spawnstaticsound",
        "svc_intermission",
        "svc_finale",
        "svc_cdtrack",
        "svc_sellscreen",
        "svc_cutscene",
    ];
    NAMES.get(cmd as usize).copied().unwrap_or("svc_unknown")
}

/// Entity number, model, frame, colormap, skin and the origin/angle
/// triplets shared by baselines and static entities.
fn read_entity_state(msg: &mut SizeBuf) -> EntityState {
    let mut es = EntityState {
        modelindex: msg_read_byte(msg),
        frame: msg_read_byte(msg),
        colormap: msg_read_byte(msg),
        skin: msg_read_byte(msg),
        ..Default::default()
    };
    for i in 0..3 {
        es.origin[i] = msg_read_coord(msg);
        es.angles[i] = msg_read_angle(msg);
    }
    es
}

impl ClientContext {
    // ============================================================
    // Signon
    // ============================================================

    fn parse_server_info(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        com_dprintf("Serverinfo packet received.\n");

        // wipe the client state
        self.clear_state();

        // parse protocol version number
        let version = msg_read_long(msg);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(version).into());
        }

        // parse maxclients
        let maxclients = msg_read_byte(msg);
        if !(1..=MAX_SCOREBOARD as i32).contains(&maxclients) {
            return Err(ClientError::BadMaxClients(maxclients));
        }
        self.cl.maxclients = maxclients as usize;
        self.cl.scores = vec![Scoreboard::default(); self.cl.maxclients];

        // parse gametype
        self.cl.gametype = msg_read_byte(msg);

        // parse signon message
        self.cl.levelname = msg_read_string(msg);
        com_printf(&format!("{}\n", self.cl.levelname));

        // precache lists, each terminated by an empty string
        loop {
            let name = msg_read_string(msg);
            if name.is_empty() {
                break;
            }
            if self.cl.model_precache.len() == MAX_MODELS {
                com_printf("Server sent too many model precaches\n");
                return Ok(());
            }
            self.cl.model_precache.push(name);
        }
        loop {
            let name = msg_read_string(msg);
            if name.is_empty() {
                break;
            }
            if self.cl.sound_precache.len() == MAX_SOUNDS {
                com_printf("Server sent too many sound precaches\n");
                return Ok(());
            }
            self.cl.sound_precache.push(name);
        }
        msg_check_read(msg)?;

        log::info!(
            "{}: {} models, {} sounds, {} clients",
            self.cl.model_precache.get(1).map_or("", |s| s.as_str()),
            self.cl.model_precache.len() - 1,
            self.cl.sound_precache.len() - 1,
            self.cl.maxclients
        );
        Ok(())
    }

    // ============================================================
    // Entities
    // ============================================================

    /// Parse an entity update message from the server. If an entity's
    /// model or origin changes from frame to frame, it must be relinked.
    /// Other attributes can change without relinking.
    fn parse_update(&mut self, msg: &mut SizeBuf, low_bits: i32) -> Result<(), ClientError> {
        // the first entity update finishes the signon
        if self.cls.signon == SIGNONS - 1 {
            self.cls.signon = SIGNONS;
            self.signon_reply();
        }

        let mut bits = low_bits;
        if bits & U_MOREBITS != 0 {
            bits |= msg_read_byte(msg) << 8;
        }
        let num = if bits & U_LONGENTITY != 0 {
            msg_read_short(msg)
        } else {
            msg_read_byte(msg)
        };
        msg_check_read(msg)?;

        let mtime = self.cl.mtime;
        let maxclients = self.cl.maxclients as i32;
        let num_models = self.cl.model_precache.len() as i32;
        let ent = self.entity_num(num)?;

        // didn't have an update last message
        let mut forcelink = ent.msgtime != mtime[1];
        ent.msgtime = mtime[0];

        let modnum = if bits & U_MODEL != 0 {
            let m = msg_read_byte(msg);
            if m >= num_models {
                return Err(ClientError::Malformed(format!("CL_ParseModel: bad modnum {}", m)));
            }
            m
        } else {
            ent.baseline.modelindex
        };
        if modnum != ent.modelindex {
            ent.modelindex = modnum;
            if modnum == 0 {
                forcelink = true;
            }
        }

        ent.frame = if bits & U_FRAME != 0 { msg_read_byte(msg) } else { ent.baseline.frame };

        let colormap = if bits & U_COLORMAP != 0 { msg_read_byte(msg) } else { ent.baseline.colormap };
        if colormap > maxclients {
            return Err(ClientError::Malformed(format!("colormap {} >= maxclients", colormap)));
        }
        ent.colormap = colormap;

        ent.skin = if bits & U_SKIN != 0 { msg_read_byte(msg) } else { ent.baseline.skin };
        ent.effects = if bits & U_EFFECTS != 0 { msg_read_byte(msg) } else { ent.baseline.effects };

        // shift the known values for interpolation
        ent.msg_origins[1] = ent.msg_origins[0];
        ent.msg_angles[1] = ent.msg_angles[0];

        for i in 0..3 {
            ent.msg_origins[0][i] = if bits & (U_ORIGIN1 << i) != 0 {
                msg_read_coord(msg)
            } else {
                ent.baseline.origin[i]
            };
            let angle_bit = [U_ANGLE1, U_ANGLE2, U_ANGLE3][i];
            ent.msg_angles[0][i] = if bits & angle_bit != 0 {
                msg_read_angle(msg)
            } else {
                ent.baseline.angles[i]
            };
        }

        if bits & U_NOLERP != 0 {
            ent.forcelink = true;
        }

        if forcelink {
            // didn't have an update last message
            ent.msg_origins[1] = ent.msg_origins[0];
            ent.origin = ent.msg_origins[0];
            ent.msg_angles[1] = ent.msg_angles[0];
            ent.angles = ent.msg_angles[0];
            ent.forcelink = true;
        }

        msg_check_read(msg)?;
        Ok(())
    }

    fn parse_baseline(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let num = msg_read_short(msg);
        let es = read_entity_state(msg);
        msg_check_read(msg)?;
        self.entity_num(num)?.baseline = es;
        Ok(())
    }

    /// Static entities are non-interactive world objects like torches.
    fn parse_static(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let es = read_entity_state(msg);
        msg_check_read(msg)?;
        if self.cl.static_entities.len() >= MAX_STATIC_ENTITIES {
            return Err(ClientError::Malformed("Too many static entities".into()));
        }

        // copy it to the current state
        self.cl.static_entities.push(ClientEntity {
            baseline: es,
            msg_origins: [es.origin; 2],
            msg_angles: [es.angles; 2],
            origin: es.origin,
            angles: es.angles,
            modelindex: es.modelindex,
            frame: es.frame,
            colormap: es.colormap,
            skin: es.skin,
            effects: es.effects,
            ..Default::default()
        });
        Ok(())
    }

    // ============================================================
    // Player state
    // ============================================================

    /// Server information pertaining to this client only.
    fn parse_client_data(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let bits = msg_read_short(msg);
        let cl = &mut self.cl;

        cl.viewheight = if bits & SU_VIEWHEIGHT != 0 {
            msg_read_char(msg) as f32
        } else {
            DEFAULT_VIEWHEIGHT
        };
        cl.idealpitch = if bits & SU_IDEALPITCH != 0 { msg_read_char(msg) as f32 } else { 0.0 };

        cl.mvelocity[1] = cl.mvelocity[0];
        for i in 0..3 {
            cl.punchangle[i] = if bits & (SU_PUNCH1 << i) != 0 { msg_read_char(msg) as f32 } else { 0.0 };
            cl.mvelocity[0][i] = if bits & (SU_VELOCITY1 << i) != 0 {
                (msg_read_char(msg) * 16) as f32
            } else {
                0.0
            };
        }

        // [always sent]
        let items = msg_read_long(msg);
        if cl.items != items {
            // set flash times
            for j in 0..32 {
                if items & (1 << j) != 0 && cl.items & (1 << j) == 0 {
                    cl.item_gettime[j] = cl.time;
                }
            }
            cl.items = items;
        }

        cl.onground = bits & SU_ONGROUND != 0;
        cl.inwater = bits & SU_INWATER != 0;

        cl.stats[STAT_WEAPONFRAME] = if bits & SU_WEAPONFRAME != 0 { msg_read_byte(msg) } else { 0 };
        cl.stats[STAT_ARMOR] = if bits & SU_ARMOR != 0 { msg_read_byte(msg) } else { 0 };
        cl.stats[STAT_WEAPON] = if bits & SU_WEAPON != 0 { msg_read_byte(msg) } else { 0 };

        cl.stats[STAT_HEALTH] = msg_read_short(msg);
        cl.stats[STAT_AMMO] = msg_read_byte(msg);
        for j in 0..4 {
            cl.stats[STAT_SHELLS + j] = msg_read_byte(msg);
        }
        cl.stats[STAT_ACTIVEWEAPON] = msg_read_byte(msg);

        msg_check_read(msg)?;
        Ok(())
    }

    fn parse_start_sound_packet(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let field_mask = msg_read_byte(msg);
        let volume = if field_mask & SND_VOLUME != 0 {
            msg_read_byte(msg)
        } else {
            DEFAULT_SOUND_PACKET_VOLUME
        };
        let attenuation = if field_mask & SND_ATTENUATION != 0 {
            msg_read_byte(msg) as f32 / 64.0
        } else {
            DEFAULT_SOUND_PACKET_ATTENUATION
        };

        let channel = msg_read_short(msg);
        let sound_num = msg_read_byte(msg);
        let origin = msg_read_pos(msg);
        msg_check_read(msg)?;

        let entity = channel >> 3;
        if entity as usize > MAX_EDICTS {
            return Err(ClientError::Malformed(format!("CL_ParseStartSoundPacket: ent = {}", entity)));
        }

        self.cl.sound_events.push(SoundEvent {
            entity,
            channel: channel & 7,
            sound_num,
            origin,
            volume: volume as f32 / 255.0,
            attenuation,
        });
        Ok(())
    }

    fn parse_static_sound(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let origin = msg_read_pos(msg);
        let sound_num = msg_read_byte(msg);
        let vol = msg_read_byte(msg);
        let atten = msg_read_byte(msg);
        msg_check_read(msg)?;

        self.cl.static_sounds.push(SoundEvent {
            entity: 0,
            channel: 0,
            sound_num,
            origin,
            volume: vol as f32 / 255.0,
            attenuation: atten as f32 / 64.0,
        });
        Ok(())
    }

    fn parse_particle_effect(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let origin = msg_read_pos(msg);
        let mut dir = [0.0; 3];
        for d in dir.iter_mut() {
            *d = msg_read_char(msg) as f32 * (1.0 / 16.0);
        }
        let mut count = msg_read_byte(msg);
        let color = msg_read_byte(msg);
        msg_check_read(msg)?;

        if count == 255 {
            count = 1024;
        }
        self.cl.temp_events.push(TempEvent::Particles { origin, dir, count, color });
        Ok(())
    }

    fn parse_damage(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let armor = msg_read_byte(msg);
        let blood = msg_read_byte(msg);
        let from = msg_read_pos(msg);
        msg_check_read(msg)?;
        self.cl.temp_events.push(TempEvent::Damage { armor, blood, from });
        Ok(())
    }

    fn parse_beam(&mut self, msg: &mut SizeBuf, kind: i32) -> Result<(), ClientError> {
        let entity = msg_read_short(msg);
        let start = msg_read_pos(msg);
        let end = msg_read_pos(msg);
        msg_check_read(msg)?;

        let model = match kind {
            TE_LIGHTNING1 => "progs/bolt.mdl",
            TE_LIGHTNING2 => "progs/bolt2.mdl",
            TE_LIGHTNING3 => "progs/bolt3.mdl",
            _ => "progs/beam.mdl",
        };
        let modelindex = self
            .cl
            .model_precache
            .iter()
            .position(|m| m == model)
            .unwrap_or(0) as i32;
        let beam = Beam { entity, modelindex, endtime: self.cl.time + 0.2, start, end };

        // override any beam with the same entity
        let now = self.cl.time;
        if let Some(b) = self.cl.beams.iter_mut().find(|b| b.entity == entity) {
            *b = beam;
            return Ok(());
        }
        // find a free beam
        if let Some(b) = self.cl.beams.iter_mut().find(|b| b.modelindex == 0 || b.endtime < now) {
            *b = beam;
            return Ok(());
        }
        if self.cl.beams.len() < MAX_BEAMS {
            self.cl.beams.push(beam);
        } else {
            com_printf("beam list overflow!\n");
        }
        Ok(())
    }

    fn parse_temp_entity(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        let kind = msg_read_byte(msg);
        match kind {
            TE_LIGHTNING1 | TE_LIGHTNING2 | TE_LIGHTNING3 | TE_BEAM => return self.parse_beam(msg, kind),
            TE_EXPLOSION2 => {
                let origin = msg_read_pos(msg);
                let color_start = msg_read_byte(msg);
                let color_length = msg_read_byte(msg);
                msg_check_read(msg)?;
                self.cl.temp_events.push(TempEvent::Explosion2 { origin, color_start, color_length });
            }
            TE_SPIKE | TE_SUPERSPIKE | TE_GUNSHOT | TE_EXPLOSION | TE_TAREXPLOSION | TE_WIZSPIKE
            | TE_KNIGHTSPIKE | TE_LAVASPLASH | TE_TELEPORT => {
                let origin = msg_read_pos(msg);
                msg_check_read(msg)?;
                if kind == TE_EXPLOSION {
                    self.alloc_dlight(0, origin, 350.0, 0.5);
                }
                self.cl.temp_events.push(TempEvent::Point { kind, origin });
            }
            _ => {
                return Err(ClientError::Malformed(format!("CL_ParseTEnt: bad type {}", kind)));
            }
        }
        Ok(())
    }

    // ============================================================
    // Message loop
    // ============================================================

    /// Apply one sequenced packet from the server. Reliable and
    /// unreliable data arrive mixed; `msg` must be positioned after the
    /// channel header.
    pub fn parse_server_message(&mut self, msg: &mut SizeBuf) -> Result<(), ClientError> {
        self.cl.onground = false; // unless the server says otherwise

        loop {
            if msg.badread {
                return Err(ClientError::Malformed("CL_ParseServerMessage: Bad server message".into()));
            }

            let cmd = msg_read_byte(msg);
            if cmd == -1 {
                return Ok(()); // end of message
            }

            // if the high bit of the command byte is set, it is a fast update
            if cmd & U_SIGNAL != 0 {
                self.parse_update(msg, cmd & 127)?;
                continue;
            }

            log::trace!("{:3}:{}", msg.readcount - 1, svc_name(cmd as u8));

            match cmd as u8 {
                SVC_NOP => {}

                SVC_TIME => {
                    self.cl.mtime[1] = self.cl.mtime[0];
                    self.cl.mtime[0] = msg_read_float(msg) as f64;
                }

                SVC_CLIENTDATA => self.parse_client_data(msg)?,

                SVC_VERSION => {
                    let version = msg_read_long(msg);
                    if version != PROTOCOL_VERSION {
                        return Err(ProtocolError::BadVersion(version).into());
                    }
                }

                SVC_DISCONNECT => return Err(ClientError::ServerDisconnected),

                SVC_PRINT => com_printf(&msg_read_string(msg)),

                SVC_CENTERPRINT => self.cl.centerprint = Some(msg_read_string(msg)),

                SVC_STUFFTEXT => {
                    let text = msg_read_string(msg);
                    self.cl.stufftext.push(text);
                }

                SVC_DAMAGE => self.parse_damage(msg)?,

                SVC_SERVERINFO => self.parse_server_info(msg)?,

                SVC_SETANGLE => {
                    for i in 0..3 {
                        self.cl.viewangles[i] = msg_read_angle(msg);
                    }
                }

                SVC_SETVIEW => self.cl.viewentity = msg_read_short(msg).max(0) as usize,

                SVC_LIGHTSTYLE => {
                    let i = msg_read_byte(msg);
                    let style = msg_read_string(msg);
                    match self.cl.lightstyles.get_mut(i as usize) {
                        Some(s) if i >= 0 => *s = style,
                        _ => {
                            return Err(ClientError::Malformed(
                                "svc_lightstyle > MAX_LIGHTSTYLES".into(),
                            ))
                        }
                    }
                }

                SVC_SOUND => self.parse_start_sound_packet(msg)?,

                SVC_STOPSOUND => {
                    let i = msg_read_short(msg);
                    com_dprintf(&format!("stopsound {} {}\n", i >> 3, i & 7));
                }

                SVC_UPDATENAME => {
                    let i = msg_read_byte(msg);
                    let name = msg_read_string(msg);
                    self.score_mut(i, "svc_updatename")?.name = name;
                }

                SVC_UPDATEFRAGS => {
                    let i = msg_read_byte(msg);
                    let frags = msg_read_short(msg);
                    self.score_mut(i, "svc_updatefrags")?.frags = frags;
                }

                SVC_UPDATECOLORS => {
                    let i = msg_read_byte(msg);
                    let colors = msg_read_byte(msg);
                    self.score_mut(i, "svc_updatecolors")?.colors = colors;
                }

                SVC_PARTICLE => self.parse_particle_effect(msg)?,

                SVC_SPAWNBASELINE => self.parse_baseline(msg)?,

                SVC_SPAWNSTATIC => self.parse_static(msg)?,

                SVC_TEMP_ENTITY => self.parse_temp_entity(msg)?,

                SVC_SETPAUSE => {
                    self.cl.paused = msg_read_byte(msg) != 0;
                    log::info!("{}", if self.cl.paused { "paused" } else { "unpaused" });
                }

                SVC_SIGNONNUM => {
                    let i = msg_read_byte(msg);
                    if i <= self.cls.signon {
                        return Err(ClientError::BadSignon { got: i, at: self.cls.signon });
                    }
                    self.cls.signon = i;
                    self.signon_reply();
                }

                SVC_KILLEDMONSTER => self.cl.stats[STAT_MONSTERS] += 1,

                SVC_FOUNDSECRET => self.cl.stats[STAT_SECRETS] += 1,

                SVC_UPDATESTAT => {
                    let i = msg_read_byte(msg);
                    let v = msg_read_long(msg);
                    if !(0..MAX_CL_STATS as i32).contains(&i) {
                        return Err(ClientError::Malformed(format!("svc_updatestat: {} is invalid", i)));
                    }
                    self.cl.stats[i as usize] = v;
                }

                SVC_SPAWNSTATICSOUND => self.parse_static_sound(msg)?,

                SVC_CDTRACK => {
                    self.cl.cdtrack = msg_read_byte(msg);
                    self.cl.looptrack = msg_read_byte(msg);
                }

                SVC_INTERMISSION => {
                    self.cl.intermission = 1;
                    self.cl.completed_time = self.cl.time;
                }

                SVC_FINALE => {
                    self.cl.intermission = 2;
                    self.cl.completed_time = self.cl.time;
                    self.cl.centerprint = Some(msg_read_string(msg));
                }

                SVC_CUTSCENE => {
                    self.cl.intermission = 3;
                    self.cl.completed_time = self.cl.time;
                    self.cl.centerprint = Some(msg_read_string(msg));
                }

                SVC_SELLSCREEN => self.cl.stufftext.push("help\n".to_string()),

                _ => return Err(ProtocolError::BadOpcode(cmd).into()),
            }
        }
    }

    fn score_mut(&mut self, i: i32, what: &str) -> Result<&mut Scoreboard, ClientError> {
        if i < 0 {
            return Err(ClientError::Malformed(format!("CL_ParseServerMessage: {} < 0", what)));
        }
        self.cl
            .scores
            .get_mut(i as usize)
            .ok_or_else(|| ClientError::Malformed(format!("CL_ParseServerMessage: {} > MAX_SCOREBOARD", what)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn server_info(models: &[&str], maxclients: i32) -> SizeBuf {
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SVC_SERVERINFO as i32);
        msg_write_long(&mut msg, PROTOCOL_VERSION);
        msg_write_byte(&mut msg, maxclients);
        msg_write_byte(&mut msg, GAME_DEATHMATCH);
        msg_write_string(&mut msg, "The Necropolis");
        for m in models {
            msg_write_string(&mut msg, m);
        }
        msg_write_byte(&mut msg, 0);
        msg_write_string(&mut msg, "weapons/r_exp3.wav");
        msg_write_byte(&mut msg, 0);
        msg
    }

    fn parse(ctx: &mut ClientContext, msg: &SizeBuf) -> Result<(), ClientError> {
        let mut rd = SizeBuf::from_bytes(msg.as_slice(), msg.maxsize);
        ctx.parse_server_message(&mut rd)
    }

    fn level() -> ClientContext {
        let mut ctx = ClientContext::new();
        let models = ["maps/e1m3.bsp", "*1", "progs/player.mdl", "progs/bolt.mdl"];
        parse(&mut ctx, &server_info(&models, 4)).unwrap();
        ctx
    }

    #[test]
    fn test_server_info() {
        let ctx = level();
        assert_eq!(ctx.cl.maxclients, 4);
        assert_eq!(ctx.cl.scores.len(), 4);
        assert_eq!(ctx.cl.gametype, GAME_DEATHMATCH);
        assert_eq!(ctx.cl.levelname, "The Necropolis");
        assert_eq!(ctx.cl.model_precache[1], "maps/e1m3.bsp");
        assert_eq!(ctx.cl.model_precache.len(), 5);
        assert_eq!(ctx.cl.sound_precache, vec!["".to_string(), "weapons/r_exp3.wav".to_string()]);
    }

    #[test]
    fn test_server_info_rejects_wrong_protocol_and_maxclients() {
        let mut ctx = ClientContext::new();
        let mut msg = server_info(&[], 4);
        msg.data[1] = 14;
        assert!(matches!(
            parse(&mut ctx, &msg),
            Err(ClientError::Protocol(ProtocolError::BadVersion(14)))
        ));
        let msg = server_info(&[], 0);
        assert!(matches!(parse(&mut ctx, &msg), Err(ClientError::BadMaxClients(0))));
    }

    #[test]
    fn test_baseline_then_update() {
        let mut ctx = level();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SVC_SPAWNBASELINE as i32);
        msg_write_short(&mut msg, 300);
        msg_write_byte(&mut msg, 3); // model
        msg_write_byte(&mut msg, 1); // frame
        msg_write_byte(&mut msg, 0);
        msg_write_byte(&mut msg, 0);
        for v in [10.0, 20.0, 30.0] {
            msg_write_coord(&mut msg, v);
            msg_write_angle(&mut msg, 0.0);
        }

        msg_write_byte(&mut msg, SVC_TIME as i32);
        msg_write_float(&mut msg, 0.9);
        msg_write_byte(&mut msg, SVC_TIME as i32);
        msg_write_float(&mut msg, 1.0);

        // long entity number with a new origin x and frame
        let bits = U_LONGENTITY | U_MOREBITS | U_ORIGIN1 | U_FRAME;
        msg_write_byte(&mut msg, (bits & 0xff) | U_SIGNAL);
        msg_write_byte(&mut msg, bits >> 8);
        msg_write_short(&mut msg, 300);
        msg_write_byte(&mut msg, 7);
        msg_write_coord(&mut msg, -64.5);
        parse(&mut ctx, &msg).unwrap();

        let ent = &ctx.cl.entities[300];
        assert_eq!(ctx.cl.num_entities, 301);
        assert_eq!(ent.modelindex, 3);
        assert_eq!(ent.frame, 7);
        assert_eq!(ent.msgtime, 1.0);
        assert_eq!(ent.msg_origins[0], [-64.5, 20.0, 30.0]);
        assert!(ent.forcelink, "first sighting snaps");
        assert_eq!(ent.origin, ent.msg_origins[0]);
    }

    #[test]
    fn test_update_shifts_history() {
        let mut ctx = level();
        let update = |time: f32, x: f32| {
            let mut msg = SizeBuf::new(MAX_MSGLEN);
            msg_write_byte(&mut msg, SVC_TIME as i32);
            msg_write_float(&mut msg, time);
            msg_write_byte(&mut msg, U_SIGNAL | U_ORIGIN1);
            msg_write_byte(&mut msg, 5);
            msg_write_coord(&mut msg, x);
            msg
        };
        parse(&mut ctx, &update(1.0, 8.0)).unwrap();
        ctx.cl.entities[5].forcelink = false;
        parse(&mut ctx, &update(1.1, 16.0)).unwrap();

        let ent = &ctx.cl.entities[5];
        assert!(!ent.forcelink, "consecutive updates interpolate");
        assert_eq!(ent.msg_origins[0][0], 16.0);
        assert_eq!(ent.msg_origins[1][0], 8.0);

        // an update after a gap snaps again
        parse(&mut ctx, &update(1.5, 400.0)).unwrap();
        parse(&mut ctx, &update(1.6, 404.0)).unwrap();
        ctx.cl.entities[5].forcelink = false;
        let mut msg = SizeBuf::new(16);
        msg_write_byte(&mut msg, SVC_TIME as i32);
        msg_write_float(&mut msg, 1.7);
        parse(&mut ctx, &msg).unwrap();
        parse(&mut ctx, &update(1.8, 500.0)).unwrap();
        let ent = &ctx.cl.entities[5];
        assert!(ent.forcelink);
        assert_eq!(ent.msg_origins[1][0], 500.0);
    }

    #[test]
    fn test_client_data() {
        let mut ctx = level();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SVC_CLIENTDATA as i32);
        let bits = SU_VELOCITY1 | SU_ONGROUND | SU_ITEMS | SU_ARMOR | SU_WEAPON | SU_PUNCH1;
        msg_write_short(&mut msg, bits);
        msg_write_char(&mut msg, -2); // punch pitch
        msg_write_char(&mut msg, 20); // velocity x / 16
        msg_write_long(&mut msg, 0x101);
        msg_write_byte(&mut msg, 150);
        msg_write_byte(&mut msg, 4);
        msg_write_short(&mut msg, 87);
        for v in [25, 25, 0, 0, 0] {
            msg_write_byte(&mut msg, v);
        }
        msg_write_byte(&mut msg, 1);
        ctx.cl.time = 3.0;
        parse(&mut ctx, &msg).unwrap();

        let cl = &ctx.cl;
        assert_eq!(cl.punchangle, [-2.0, 0.0, 0.0]);
        assert_eq!(cl.mvelocity[0], [320.0, 0.0, 0.0]);
        assert!(cl.onground);
        assert!(!cl.inwater);
        assert_eq!(cl.viewheight, DEFAULT_VIEWHEIGHT);
        assert_eq!(cl.items, 0x101);
        assert_eq!(cl.item_gettime[8], 3.0);
        assert_eq!(cl.stats[STAT_ARMOR], 150);
        assert_eq!(cl.stats[STAT_WEAPON], 4);
        assert_eq!(cl.stats[STAT_HEALTH], 87);
        assert_eq!(cl.stats[STAT_AMMO], 25);
        assert_eq!(cl.stats[STAT_SHELLS], 25);
        assert_eq!(cl.stats[STAT_ACTIVEWEAPON], 1);
    }

    #[test]
    fn test_sound_and_scoreboard() {
        let mut ctx = level();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SVC_SOUND as i32);
        msg_write_byte(&mut msg, SND_ATTENUATION);
        msg_write_byte(&mut msg, 128);
        msg_write_short(&mut msg, (12 << 3) | 2);
        msg_write_byte(&mut msg, 1);
        msg_write_pos(&mut msg, &[1.0, 2.0, 3.0]);
        msg_write_byte(&mut msg, SVC_UPDATENAME as i32);
        msg_write_byte(&mut msg, 2);
        msg_write_string(&mut msg, "ranger");
        msg_write_byte(&mut msg, SVC_UPDATEFRAGS as i32);
        msg_write_byte(&mut msg, 2);
        msg_write_short(&mut msg, -1);
        parse(&mut ctx, &msg).unwrap();

        let s = ctx.cl.sound_events[0];
        assert_eq!((s.entity, s.channel, s.sound_num), (12, 2, 1));
        assert_approx_eq!(s.volume, 1.0);
        assert_approx_eq!(s.attenuation, 2.0);
        assert_eq!(s.origin, [1.0, 2.0, 3.0]);
        assert_eq!(ctx.cl.scores[2], Scoreboard { name: "ranger".into(), frags: -1, colors: 0 });

        let mut msg = SizeBuf::new(16);
        msg_write_byte(&mut msg, SVC_UPDATENAME as i32);
        msg_write_byte(&mut msg, 9);
        msg_write_string(&mut msg, "nobody");
        assert!(matches!(parse(&mut ctx, &msg), Err(ClientError::Malformed(_))));
    }

    #[test]
    fn test_beams_replace_by_entity() {
        let mut ctx = level();
        let beam = |ent: i32, x: f32| {
            let mut msg = SizeBuf::new(64);
            msg_write_byte(&mut msg, SVC_TEMP_ENTITY as i32);
            msg_write_byte(&mut msg, TE_LIGHTNING1);
            msg_write_short(&mut msg, ent);
            msg_write_pos(&mut msg, &[0.0; 3]);
            msg_write_pos(&mut msg, &[x, 0.0, 0.0]);
            msg
        };
        parse(&mut ctx, &beam(1, 100.0)).unwrap();
        parse(&mut ctx, &beam(1, 200.0)).unwrap();
        parse(&mut ctx, &beam(2, 50.0)).unwrap();
        assert_eq!(ctx.cl.beams.len(), 2);
        assert_eq!(ctx.cl.beams[0].end[0], 200.0);
        assert_eq!(ctx.cl.beams[0].modelindex, 4);
    }

    #[test]
    fn test_signon_numbers_must_increase() {
        let mut ctx = level();
        ctx.cls.signon = 2;
        let mut msg = SizeBuf::new(16);
        msg_write_byte(&mut msg, SVC_SIGNONNUM as i32);
        msg_write_byte(&mut msg, 2);
        assert!(matches!(
            parse(&mut ctx, &msg),
            Err(ClientError::BadSignon { got: 2, at: 2 })
        ));
    }

    #[test]
    fn test_garbage_and_truncation() {
        let mut ctx = level();
        let msg = SizeBuf::from_bytes(&[99], 16);
        assert!(matches!(
            parse(&mut ctx, &msg),
            Err(ClientError::Protocol(ProtocolError::BadOpcode(99)))
        ));

        let msg = SizeBuf::from_bytes(&[SVC_TIME, 0, 0], 16);
        assert!(parse(&mut ctx, &msg).is_err());

        let msg = SizeBuf::from_bytes(&[SVC_DISCONNECT], 16);
        assert!(matches!(parse(&mut ctx, &msg), Err(ClientError::ServerDisconnected)));
    }

    #[test]
    fn test_static_entities_and_stats() {
        let mut ctx = level();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SVC_SPAWNSTATIC as i32);
        for v in [2, 0, 0, 0] {
            msg_write_byte(&mut msg, v);
        }
        for v in [64.0, -64.0, 8.0] {
            msg_write_coord(&mut msg, v);
            msg_write_angle(&mut msg, 90.0);
        }
        msg_write_byte(&mut msg, SVC_KILLEDMONSTER as i32);
        msg_write_byte(&mut msg, SVC_UPDATESTAT as i32);
        msg_write_byte(&mut msg, STAT_TOTALMONSTERS as i32);
        msg_write_long(&mut msg, 30);
        parse(&mut ctx, &msg).unwrap();

        let st = &ctx.cl.static_entities[0];
        assert_eq!(st.origin, [64.0, -64.0, 8.0]);
        assert_approx_eq!(st.angles[1], 90.0);
        assert_eq!(ctx.cl.stats[STAT_MONSTERS], 1);
        assert_eq!(ctx.cl.stats[STAT_TOTALMONSTERS], 30);
    }
}
