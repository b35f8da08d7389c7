// sv_init.rs — level spawning and baselines
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::progs::{ev, gv, Progs, ProgsDat};
use crate::server::*;
use crate::sv_edict::Edict;

use std::sync::Arc;

impl ServerContext {
    /// Precache index of a model, 0 with a warning if it is missing.
    fn baseline_model_index(&self, name: &str) -> i32 {
        let index = self.model_index(name);
        if index == 0 && !name.is_empty() {
            log::warn!("SV_ModelIndex: model {} not precached", name);
        }
        index as i32
    }

    /// Record the current state of every visible entity as its baseline
    /// and append the baselines to the signon buffer.
    pub fn create_baseline(&mut self) {
        let player = self.baseline_model_index("progs/player.mdl");

        for entnum in 0..self.sv.num_edicts() {
            let ent = self.edict(entnum);
            if ent.free {
                continue;
            }
            let is_client = entnum > 0 && entnum <= self.svs.maxclients;
            if !is_client && ent.float(ev::MODELINDEX) == 0.0 {
                continue;
            }

            // create entity baseline
            let (colormap, modelindex) = if is_client {
                (entnum as i32, player)
            } else {
                let model = self.pr.get_string(ent.string(ev::MODEL)).into_owned();
                (0, self.baseline_model_index(&model))
            };
            let baseline = EntityState {
                origin: ent.vector(ev::ORIGIN),
                angles: ent.vector(ev::ANGLES),
                frame: ent.float(ev::FRAME) as i32,
                skin: ent.float(ev::SKIN) as i32,
                colormap,
                modelindex,
                effects: 0,
            };
            self.edict_mut(entnum).baseline = baseline;

            // add to the message
            let signon = &mut self.sv.signon;
            msg_write_byte(signon, SVC_SPAWNBASELINE as i32);
            msg_write_short(signon, entnum as i32);
            msg_write_byte(signon, baseline.modelindex);
            msg_write_byte(signon, baseline.frame);
            msg_write_byte(signon, baseline.colormap);
            msg_write_byte(signon, baseline.skin);
            for i in 0..3 {
                msg_write_coord(signon, baseline.origin[i]);
                msg_write_angle(signon, baseline.angles[i]);
            }
        }
    }

    /// Tell every client to reconnect. Whatever they were still owed from
    /// the old level is discarded.
    pub fn send_reconnect(&mut self) {
        for slot in self.svs.active_clients().collect::<Vec<_>>() {
            if let Some(cl) = self.svs.client_mut(slot) {
                cl.message.clear();
                msg_write_byte(&mut cl.message, SVC_STUFFTEXT as i32);
                msg_write_string(&mut cl.message, "reconnect\n");
            }
        }
    }

    /// Grabs the current state of each client for saving across the
    /// transition to another level.
    pub fn save_spawn_parms(&mut self) -> Result<(), HostError> {
        self.svs.serverflags = self.pr.g_float(gv::SERVERFLAGS) as i32;

        for slot in self.svs.active_clients().collect::<Vec<_>>() {
            // call the progs to get default spawn parms for the new client
            self.pr.set_g_edict(gv::SELF, ServerContext::client_edict(slot));
            let func = self.pr.g_int(gv::SET_CHANGE_PARMS);
            let result = self.execute_program(func);
            self.contain_fault(result)?;

            let mut parms = [0.0; NUM_SPAWN_PARMS];
            self.pr.spawn_parms(&mut parms);
            if let Some(cl) = self.svs.client_mut(slot) {
                cl.spawn_parms = parms;
            }
        }
        Ok(())
    }

    /// Load a new level. Connected clients are sent the new serverinfo.
    ///
    /// A map that can't be found leaves the server inactive and is not an
    /// error; a missing or broken gameplay program is.
    pub fn spawn_server(&mut self, name: &str) -> Result<(), HostError> {
        com_printf("------- Server Initialization -------\n");
        com_dprintf(&format!("SpawnServer: {}\n", name));
        self.svs.changelevel_issued = false; // now safe to issue another

        // tell all connected clients that we are going to a new level
        if self.sv.active {
            self.send_reconnect();
        }

        // make cvars consistant
        if self.cvar("coop") != 0.0 {
            self.cvars.set_value("deathmatch", 0.0);
        }
        let skill = (self.cvar("skill") + 0.5).floor().clamp(0.0, 3.0);
        self.cvars.set_value("skill", skill);

        // set up the new server
        self.sv = Server::default();
        self.sv.name = name.to_string();

        // load progs to get entity field count
        let Some(bytes) = self.assets.load_progs() else {
            return Err(HostError::Fatal("PR_LoadProgs: couldn't load progs.dat".into()));
        };
        self.pr = Progs::new(ProgsDat::from_bytes(&bytes)?);
        com_dprintf(&format!(
            "Programs occupy {}K.\n",
            (bytes.len() + 1023) / 1024
        ));

        // leave slots at start for clients only
        let entityfields = self.pr.entityfields();
        self.sv.edicts = (0..=self.svs.maxclients).map(|_| Edict::new(entityfields)).collect();
        for slot in 0..self.svs.maxclients {
            if let Some(cl) = self.svs.client_mut(slot) {
                cl.edict = ServerContext::client_edict(slot);
            }
        }

        self.sv.state = ServerState::Loading;
        self.sv.paused = false;
        self.sv.time = 1.0;

        self.sv.modelname = format!("maps/{}.bsp", name);
        let world = match self.assets.load_model(&self.sv.modelname) {
            Some(ServerModel::Brush(model)) => model,
            _ => {
                com_printf(&format!("Couldn't spawn server {}\n", self.sv.modelname));
                self.sv.active = false;
                self.sv.state = ServerState::Dead;
                return Ok(());
            }
        };
        world.validate()?;
        self.sv.worldmodel = world.clone();

        // clear world interaction links
        self.clear_world();

        self.sv.sound_precache = vec![String::new()];
        self.sv.model_precache = vec![String::new(), self.sv.modelname.clone()];
        self.sv.models = vec![None, Some(ServerModel::Brush(world.clone()))];
        for i in 1..world.submodels.len() {
            let Some(sub) = world.submodel(i) else {
                continue;
            };
            self.sv.model_precache.push(sub.name.clone());
            self.sv.models.push(Some(ServerModel::Brush(Arc::new(sub))));
        }

        // load the rest of the entities
        let modelname = self.pr.set_string(&self.sv.modelname);
        let ent = self.edict_mut(0);
        ent.clear();
        ent.set_string(ev::MODEL, modelname);
        ent.set_float(ev::MODELINDEX, 1.0); // world model
        ent.set_float(ev::SOLID, SOLID_BSP as f32);
        ent.set_float(ev::MOVETYPE, MOVETYPE_PUSH as f32);

        if self.cvar("coop") != 0.0 {
            self.pr.set_g_float(gv::COOP, self.cvar("coop"));
        } else {
            self.pr.set_g_float(gv::DEATHMATCH, self.cvar("deathmatch"));
        }
        let mapname = self.pr.set_string(name);
        self.pr.set_g_string(gv::MAPNAME, mapname);

        // serverflags are for cross level information (sigils)
        self.pr.set_g_float(gv::SERVERFLAGS, self.svs.serverflags as f32);

        self.ed_load_from_file(&world.entities)?;

        self.sv.active = true;

        // all setup is completed, any further precache statements are errors
        self.sv.state = ServerState::Active;

        // run two frames to allow everything to settle
        self.host_frametime = 0.1;
        self.physics()?;
        self.physics()?;

        // create a baseline for more efficient communications
        self.create_baseline();

        // send serverinfo to all connected clients
        for slot in self.svs.active_clients().collect::<Vec<_>>() {
            self.send_server_info(slot);
        }

        com_dprintf("Server spawned.\n");
        log::info!("{} spawned with {} edicts", self.sv.modelname, self.sv.num_edicts());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use crate::progs::Opcode;
    use assert_approx_eq::assert_approx_eq;
    use myq1_common::cmodel::BrushModel;
    use myq1_common::net::NetAdr;
    use myq1_common::net_chan::{NetChan, NetSrc};

    fn level_progs() -> ProgsBuilder {
        let mut b = ProgsBuilder::new();
        b.builtin_field("classname", 1, ev::CLASSNAME);
        b.builtin_field("origin", 3, ev::ORIGIN);
        b.builtin_field("message", 1, ev::MESSAGE);
        b.function("worldspawn", 0, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        b.function("info_player_start", 0, 0, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        b
    }

    fn assets_for(b: &ProgsBuilder) -> MemoryAssets {
        let mut assets = MemoryAssets::new(b.build());
        let mut room = BrushModel::room("maps/start.bsp", &[-256.0; 3], &[256.0; 3]);
        room.entities = r#"
{ "classname" "worldspawn" "message" "Entrance" }
{ "classname" "info_player_start" "origin" "0 0 -200" }
"#
        .to_string();
        assets.add_brush(room);
        assets
    }

    #[test]
    fn test_spawn_server_builds_the_level() {
        let b = level_progs();
        let mut ctx = ServerContext::new(Box::new(assets_for(&b)));
        ctx.spawn_server("start").unwrap();

        assert!(ctx.sv.active);
        assert_eq!(ctx.sv.state, ServerState::Active);
        assert_eq!(ctx.sv.model_precache, vec!["".to_string(), "maps/start.bsp".to_string()]);
        assert_eq!(ctx.sv.sound_precache, vec!["".to_string()]);
        // two settling frames
        assert_approx_eq!(ctx.sv.time, 1.2, 1e-6);

        let world = ctx.edict(0);
        assert_eq!(world.float(ev::MODELINDEX), 1.0);
        assert_eq!(world.solid(), SOLID_BSP);
        assert_eq!(world.movetype(), MOVETYPE_PUSH);
        assert_eq!(ctx.pr.get_string(world.string(ev::MESSAGE)), "Entrance");
        assert_eq!(ctx.pr.get_string(ctx.pr.g_int(gv::MAPNAME)), "start");

        // world, one client slot, the start spot
        assert_eq!(ctx.sv.num_edicts(), 3);
        assert_eq!(ctx.edict(2).origin(), [0.0, 0.0, -200.0]);
    }

    #[test]
    fn test_missing_map_leaves_server_down() {
        let b = level_progs();
        let mut ctx = ServerContext::new(Box::new(assets_for(&b)));
        ctx.spawn_server("nowhere").unwrap();
        assert!(!ctx.sv.active);
        assert_eq!(ctx.sv.state, ServerState::Dead);
    }

    #[test]
    fn test_missing_progs_is_fatal() {
        let mut assets = MemoryAssets::default();
        assets.add_brush(BrushModel::room("maps/start.bsp", &[-64.0; 3], &[64.0; 3]));
        let mut ctx = ServerContext::new(Box::new(assets));
        assert!(matches!(ctx.spawn_server("start"), Err(HostError::Fatal(_))));
    }

    #[test]
    fn test_coop_overrides_deathmatch_and_skill_is_clamped() {
        let b = level_progs();
        let mut ctx = ServerContext::new(Box::new(assets_for(&b)));
        ctx.cvars.set("coop", "1");
        ctx.cvars.set("deathmatch", "1");
        ctx.cvars.set("skill", "7");
        ctx.spawn_server("start").unwrap();
        assert_eq!(ctx.cvar("deathmatch"), 0.0);
        assert_eq!(ctx.cvar("skill"), 3.0);
        assert_eq!(ctx.pr.g_float(gv::COOP), 1.0);
    }

    #[test]
    fn test_level_change_resends_serverinfo() {
        let b = level_progs();
        let mut ctx = ServerContext::new(Box::new(assets_for(&b)));
        ctx.spawn_server("start").unwrap();

        let chan = NetChan::new(NetSrc::Server, NetAdr::Loopback(2), 0, 0.0);
        let mut cl = Client::new(chan, 1);
        cl.spawned = true;
        msg_write_byte(&mut cl.message, SVC_NOP as i32);
        ctx.svs.clients[0] = Some(cl);

        ctx.spawn_server("start").unwrap();
        let cl = ctx.svs.client(0).unwrap();
        assert!(!cl.spawned);
        let msg = cl.message.as_slice();
        assert_eq!(msg[0], SVC_STUFFTEXT, "stale data is dropped");
        assert_eq!(&msg[1..12], b"reconnect\n\0");
        assert_eq!(msg[12], SVC_PRINT);
        assert_eq!(&msg[msg.len() - 2..], &[SVC_SIGNONNUM, 1]);
    }

    #[test]
    fn test_baselines_cover_clients_and_models() {
        let mut ctx = context_with(&ProgsBuilder::new());
        ctx.sv.model_precache = vec![String::new(), "maps/x.bsp".into(), "progs/player.mdl".into(), "progs/ogre.mdl".into()];

        let ogre = ctx.ed_alloc().unwrap();
        let model = ctx.pr.set_string("progs/ogre.mdl");
        let ent = ctx.edict_mut(ogre);
        ent.set_string(ev::MODEL, model);
        ent.set_float(ev::MODELINDEX, 3.0);
        ent.set_float(ev::FRAME, 4.0);
        ent.set_vector(ev::ORIGIN, &[16.0, 0.0, -8.0]);
        let invisible = ctx.ed_alloc().unwrap();

        ctx.create_baseline();

        assert_eq!(ctx.edict(1).baseline.modelindex, 2);
        assert_eq!(ctx.edict(1).baseline.colormap, 1);
        let base = ctx.edict(ogre).baseline;
        assert_eq!(base.modelindex, 3);
        assert_eq!(base.frame, 4);
        assert_eq!(base.origin, [16.0, 0.0, -8.0]);
        assert_eq!(ctx.edict(invisible).baseline, EntityState::default());

        // client and ogre; the world has no modelindex here
        let signon = ctx.sv.signon.as_slice();
        assert_eq!(signon.len(), 2 * 16);
        assert_eq!(signon[0], SVC_SPAWNBASELINE);
        assert_eq!(&signon[1..7], &[1, 0, 2, 0, 1, 0]);
        assert_eq!(signon[16], SVC_SPAWNBASELINE);
        assert_eq!(signon[17] as usize, ogre);
    }

    #[test]
    fn test_save_spawn_parms_runs_change_parms() {
        let mut b = ProgsBuilder::new();
        let f = b.function("SetChangeParms", 0, 0, 0);
        let fifty = b.float_const(50.0);
        b.op(Opcode::STORE_F, fifty, gv::PARM1, 0);
        b.op(Opcode::DONE, 0, 0, 0);
        b.set_int(gv::SET_CHANGE_PARMS, f as i32);
        b.set_float(gv::SERVERFLAGS, 3.0);
        let mut ctx = context_with(&b);
        let chan = NetChan::new(NetSrc::Server, NetAdr::Loopback(2), 0, 0.0);
        ctx.svs.clients[0] = Some(Client::new(chan, 1));

        ctx.save_spawn_parms().unwrap();
        assert_eq!(ctx.svs.serverflags, 3);
        assert_eq!(ctx.svs.client(0).unwrap().spawn_parms[0], 50.0);
    }
}
