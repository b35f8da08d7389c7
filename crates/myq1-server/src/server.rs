// server.rs — core server types and constants
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::cmodel::{BrushModel, ModelError};
use myq1_common::cvar::{CvarContext, CvarFlags};
use myq1_common::net::NetDriver;
use myq1_common::net_chan::NetChan;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::progs::{Progs, ProgsError};
use crate::sv_edict::Edict;
use crate::sv_world::AreaGrid;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

// ============================================================
// Constants
// ============================================================

pub const VERSION: f32 = 1.09;

pub const NUM_PING_TIMES: usize = 16;

// edict->movetype values
pub const MOVETYPE_NONE: i32 = 0; // never moves
pub const MOVETYPE_ANGLENOCLIP: i32 = 1;
pub const MOVETYPE_ANGLECLIP: i32 = 2;
pub const MOVETYPE_WALK: i32 = 3; // gravity
pub const MOVETYPE_STEP: i32 = 4; // gravity, special edge handling
pub const MOVETYPE_FLY: i32 = 5;
pub const MOVETYPE_TOSS: i32 = 6; // gravity
pub const MOVETYPE_PUSH: i32 = 7; // no clip to world, push and crush
pub const MOVETYPE_NOCLIP: i32 = 8;
pub const MOVETYPE_FLYMISSILE: i32 = 9; // extra size to monsters
pub const MOVETYPE_BOUNCE: i32 = 10;

// edict->solid values
pub const SOLID_NOT: i32 = 0; // no interaction with other objects
pub const SOLID_TRIGGER: i32 = 1; // touch on edge, but not blocking
pub const SOLID_BBOX: i32 = 2; // touch on edge, block
pub const SOLID_SLIDEBOX: i32 = 3; // touch on edge, but not an onground
pub const SOLID_BSP: i32 = 4; // bsp clip, touch on edge, block

// edict->deadflag values
pub const DEAD_NO: i32 = 0;
pub const DEAD_DYING: i32 = 1;
pub const DEAD_DEAD: i32 = 2;

// edict->takedamage values
pub const DAMAGE_NO: f32 = 0.0;
pub const DAMAGE_YES: f32 = 1.0;
pub const DAMAGE_AIM: f32 = 2.0;

bitflags::bitflags! {
    /// edict->flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EdictFlags: i32 {
        const FLY = 1;
        const SWIM = 2;
        const CONVEYOR = 4;
        const CLIENT = 8;
        const INWATER = 16;
        const MONSTER = 32;
        const GODMODE = 64;
        const NOTARGET = 128;
        const ITEM = 256;
        const ONGROUND = 512;
        const PARTIALGROUND = 1024; // not all corners are valid
        const WATERJUMP = 2048; // player jumping out of water
        const JUMPRELEASED = 4096; // for jump debouncing
    }
}

// entity effects
pub const EF_BRIGHTFIELD: i32 = 1;
pub const EF_MUZZLEFLASH: i32 = 2;
pub const EF_BRIGHTLIGHT: i32 = 4;
pub const EF_DIMLIGHT: i32 = 8;

pub const SPAWNFLAG_NOT_EASY: i32 = 256;
pub const SPAWNFLAG_NOT_MEDIUM: i32 = 512;
pub const SPAWNFLAG_NOT_HARD: i32 = 1024;
pub const SPAWNFLAG_NOT_DEATHMATCH: i32 = 2048;

// ============================================================
// Errors
// ============================================================

/// Errors that end the current server session.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("ED_Alloc: no free edicts")]
    NoFreeEdicts,
    #[error("{0} overflow")]
    Overflow(String),
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Progs(#[from] ProgsError),
    #[error(transparent)]
    Model(#[from] ModelError),
}

// ============================================================
// Server state
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[derive(Default)]
pub enum ServerState {
    #[default]
    Dead = 0, // no map loaded
    Loading = 1, // spawning level edicts
    Active = 2,
}

/// A precached model as the server sees it: brush models clip, everything
/// else only contributes its bounds.
#[derive(Debug, Clone)]
pub enum ServerModel {
    Brush(Arc<BrushModel>),
    Bounds { mins: Vec3, maxs: Vec3 },
}

impl ServerModel {
    pub fn mins(&self) -> Vec3 {
        match self {
            ServerModel::Brush(m) => m.mins,
            ServerModel::Bounds { mins, .. } => *mins,
        }
    }

    pub fn maxs(&self) -> Vec3 {
        match self {
            ServerModel::Brush(m) => m.maxs,
            ServerModel::Bounds { maxs, .. } => *maxs,
        }
    }

    pub fn brush(&self) -> Option<&Arc<BrushModel>> {
        match self {
            ServerModel::Brush(m) => Some(m),
            ServerModel::Bounds { .. } => None,
        }
    }
}

/// Where the server gets maps, models and the gameplay program from.
/// File formats are the provider's business.
pub trait ServerAssets {
    fn load_model(&self, name: &str) -> Option<ServerModel>;
    fn load_progs(&self) -> Option<Vec<u8>>;
}

/// Assets held in memory, for listen servers and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryAssets {
    pub models: HashMap<String, ServerModel>,
    pub progs: Vec<u8>,
}

impl MemoryAssets {
    pub fn new(progs: Vec<u8>) -> Self {
        Self { models: HashMap::new(), progs }
    }

    pub fn add_brush(&mut self, model: BrushModel) {
        self.models
            .insert(model.name.clone(), ServerModel::Brush(Arc::new(model)));
    }

    pub fn add_bounds(&mut self, name: &str, mins: Vec3, maxs: Vec3) {
        self.models
            .insert(name.to_string(), ServerModel::Bounds { mins, maxs });
    }
}

impl ServerAssets for MemoryAssets {
    fn load_model(&self, name: &str) -> Option<ServerModel> {
        self.models.get(name).cloned()
    }

    fn load_progs(&self) -> Option<Vec<u8>> {
        if self.progs.is_empty() {
            None
        } else {
            Some(self.progs.clone())
        }
    }
}

// ============================================================
// Server (per-level state)
// ============================================================

pub struct Server {
    pub state: ServerState,
    pub active: bool, // false if only a net client
    pub paused: bool,

    pub time: f64,

    pub lastcheck: usize, // used by the checkclient builtin
    pub lastchecktime: f64,

    pub name: String,      // map name
    pub modelname: String, // maps/<name>.bsp, for model_precache[1]
    pub worldmodel: Arc<BrushModel>,

    pub model_precache: Vec<String>, // index 0 is always ""
    pub models: Vec<Option<ServerModel>>,
    pub sound_precache: Vec<String>,
    pub lightstyles: Vec<String>,

    pub edicts: Vec<Edict>,
    pub max_edicts: usize,
    pub area: AreaGrid,

    /// Unreliable data for every client this frame.
    pub datagram: SizeBuf,
    /// Reliable data copied to every client this frame.
    pub reliable_datagram: SizeBuf,
    /// Static entities and baselines sent to every client on prespawn.
    pub signon: SizeBuf,

    pub checkpvs: Vec<u8>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            state: ServerState::Dead,
            active: false,
            paused: false,
            time: 0.0,
            lastcheck: 0,
            lastchecktime: 0.0,
            name: String::new(),
            modelname: String::new(),
            worldmodel: Arc::new(BrushModel::default()),
            model_precache: Vec::new(),
            models: Vec::new(),
            sound_precache: Vec::new(),
            lightstyles: vec![String::new(); MAX_LIGHTSTYLES],
            edicts: Vec::new(),
            max_edicts: MAX_EDICTS,
            area: AreaGrid::new(MAX_EDICTS),
            datagram: SizeBuf::new(MAX_DATAGRAM),
            reliable_datagram: SizeBuf::new(MAX_DATAGRAM),
            signon: SizeBuf::new(SIGNON_SIZE),
            checkpvs: Vec::new(),
        }
    }
}

impl Server {
    pub fn num_edicts(&self) -> usize {
        self.edicts.len()
    }
}

// ============================================================
// Clients
// ============================================================

pub struct Client {
    pub active: bool,    // false = client is free
    pub spawned: bool,   // false = don't send datagrams
    pub dropasap: bool,  // has been told to go to another level
    pub sendsignon: bool, // only valid before spawned

    pub last_message: f64, // reliable messages must be sent periodically
    pub connecttime: f64,

    pub netchan: NetChan,
    /// Reliable data waiting for the channel to accept it.
    pub message: SizeBuf,
    /// Packets accepted by the channel, waiting for run_clients.
    pub incoming: Vec<SizeBuf>,

    pub cmd: UserCmd, // movement
    pub wishdir: Vec3, // intended motion calced from cmd

    pub name: String,
    pub colors: i32,

    pub ping_times: [f32; NUM_PING_TIMES],
    pub num_pings: usize,

    pub edict: usize,
    pub old_frags: i32,

    /// Spawn parms are carried from level to level.
    pub spawn_parms: [f32; NUM_SPAWN_PARMS],
}

impl Client {
    pub fn new(netchan: NetChan, edict: usize) -> Self {
        let mut message = SizeBuf::new(MAX_MSGLEN);
        message.allow_overflow = true;
        Self {
            active: true,
            spawned: false,
            dropasap: false,
            sendsignon: true,
            last_message: 0.0,
            connecttime: 0.0,
            netchan,
            message,
            incoming: Vec::new(),
            cmd: UserCmd::default(),
            wishdir: [0.0; 3],
            name: "unconnected".to_string(),
            colors: 0,
            ping_times: [0.0; NUM_PING_TIMES],
            num_pings: 0,
            edict,
            old_frags: -999999,
            spawn_parms: [0.0; NUM_SPAWN_PARMS],
        }
    }

    pub fn ping(&self) -> f32 {
        let total: f32 = self.ping_times.iter().sum();
        total / NUM_PING_TIMES as f32
    }
}

/// State that survives level changes.
pub struct ServerStatic {
    pub maxclients: usize,
    pub clients: Vec<Option<Client>>,
    pub serverflags: i32, // episode completion information
    pub changelevel_issued: bool, // cleared when at spawn_server
    pub driver: Option<Box<dyn NetDriver>>,
    /// Addresses refused on connect.
    pub banned: Vec<String>,
}

impl Default for ServerStatic {
    fn default() -> Self {
        Self {
            maxclients: 1,
            clients: (0..1).map(|_| None).collect(),
            serverflags: 0,
            changelevel_issued: false,
            driver: None,
            banned: Vec::new(),
        }
    }
}

impl ServerStatic {
    pub fn client(&self, i: usize) -> Option<&Client> {
        self.clients.get(i).and_then(|c| c.as_ref())
    }

    pub fn client_mut(&mut self, i: usize) -> Option<&mut Client> {
        self.clients.get_mut(i).and_then(|c| c.as_mut())
    }

    /// Slots with an active client.
    pub fn active_clients(&self) -> impl Iterator<Item = usize> + '_ {
        self.clients
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_ref().map_or(false, |c| c.active))
            .map(|(i, _)| i)
    }
}

// ============================================================
// ServerContext
// ============================================================

/// Everything the server owns. Passed by reference through the frame loop
/// and into every builtin.
pub struct ServerContext {
    pub cvars: CvarContext,
    pub sv: Server,
    pub svs: ServerStatic,
    pub pr: Progs,
    pub assets: Box<dyn ServerAssets>,

    pub realtime: f64,
    pub oldrealtime: f64,
    pub host_frametime: f64,
    pub host_framecount: u64,

    /// The client whose message is being processed.
    pub host_client: Option<usize>,

    /// Commands queued for the host console (localcmd, changelevel).
    pub cbuf: Vec<String>,
}

impl ServerContext {
    pub fn new(assets: Box<dyn ServerAssets>) -> Self {
        let mut ctx = Self {
            cvars: CvarContext::new(),
            sv: Server::default(),
            svs: ServerStatic::default(),
            pr: Progs::default(),
            assets,
            realtime: 0.0,
            oldrealtime: 0.0,
            host_frametime: 0.0,
            host_framecount: 0,
            host_client: None,
            cbuf: Vec::new(),
        };
        ctx.sv_init();
        ctx
    }

    /// Register the server variables.
    pub fn sv_init(&mut self) {
        let c = &mut self.cvars;
        c.register("sv_maxvelocity", "2000", CvarFlags::empty());
        c.register("sv_gravity", "800", CvarFlags::SERVER);
        c.register("sv_friction", "4", CvarFlags::SERVER);
        c.register("edgefriction", "2", CvarFlags::empty());
        c.register("sv_stopspeed", "100", CvarFlags::empty());
        c.register("sv_maxspeed", "320", CvarFlags::SERVER);
        c.register("sv_accelerate", "10", CvarFlags::empty());
        c.register("sv_idealpitchscale", "0.8", CvarFlags::empty());
        c.register("sv_aim", "0.93", CvarFlags::empty());
        c.register("sv_nostep", "0", CvarFlags::empty());
        c.register("cl_rollspeed", "200", CvarFlags::empty());
        c.register("cl_rollangle", "2.0", CvarFlags::empty());

        c.register("maxclients", "1", CvarFlags::empty());
        c.register("deathmatch", "0", CvarFlags::empty());
        c.register("coop", "0", CvarFlags::empty());
        c.register("teamplay", "0", CvarFlags::SERVER);
        c.register("skill", "1", CvarFlags::empty());
        c.register("fraglimit", "0", CvarFlags::SERVER);
        c.register("timelimit", "0", CvarFlags::SERVER);
        c.register("noexit", "0", CvarFlags::SERVER);
        c.register("pausable", "1", CvarFlags::empty());
        c.register("developer", "0", CvarFlags::empty());
        c.register("host_framerate", "0", CvarFlags::empty());
        c.register("sys_ticrate", "0.05", CvarFlags::empty());
        c.register("timeout", "60", CvarFlags::empty());
        c.register("hostname", "UNNAMED", CvarFlags::empty());
    }

    #[inline]
    pub fn cvar(&self, name: &str) -> f32 {
        self.cvars.variable_value(name)
    }

    /// Resize the client table. Only valid while no level is running.
    pub fn set_maxclients(&mut self, n: usize) {
        let n = n.clamp(1, MAX_SCOREBOARD);
        self.svs.maxclients = n;
        self.svs.clients = (0..n).map(|_| None).collect();
        self.cvars.set_value("maxclients", n as f32);
        if n > 1 && self.cvar("coop") == 0.0 {
            self.cvars.set_value("deathmatch", 1.0);
        }
    }

    // ---- edict helpers ----

    #[inline]
    pub fn edict(&self, e: usize) -> &Edict {
        &self.sv.edicts[e]
    }

    #[inline]
    pub fn edict_mut(&mut self, e: usize) -> &mut Edict {
        &mut self.sv.edicts[e]
    }

    /// Edict number of client slot `i`.
    #[inline]
    pub fn client_edict(i: usize) -> usize {
        i + 1
    }

    /// Client slot of edict `e`, if it belongs to a client.
    pub fn edict_client(&self, e: usize) -> Option<usize> {
        if e >= 1 && e <= self.svs.maxclients {
            Some(e - 1)
        } else {
            None
        }
    }

    pub fn edict_flags(&self, e: usize) -> EdictFlags {
        EdictFlags::from_bits_retain(self.sv.edicts[e].float(crate::progs::ev::FLAGS) as i32)
    }

    pub fn set_edict_flags(&mut self, e: usize, flags: EdictFlags) {
        self.sv.edicts[e].set_float(crate::progs::ev::FLAGS, flags.bits() as f32);
    }

    pub fn model(&self, modelindex: usize) -> Option<&ServerModel> {
        self.sv.models.get(modelindex).and_then(|m| m.as_ref())
    }

    /// Precache index of a model name, 0 if it isn't precached.
    pub fn model_index(&self, name: &str) -> usize {
        if name.is_empty() {
            return 0;
        }
        self.sv
            .model_precache
            .iter()
            .position(|m| m == name)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_assets() {
        let mut assets = MemoryAssets::new(Vec::new());
        assets.add_bounds("progs/player.mdl", [-16.0; 3], [16.0; 3]);
        assert!(assets.load_progs().is_none());
        let m = assets.load_model("progs/player.mdl").expect("model");
        assert_eq!(m.mins(), [-16.0; 3]);
        assert!(m.brush().is_none());
        assert!(assets.load_model("progs/missing.mdl").is_none());
    }

    #[test]
    fn test_maxclients_enables_deathmatch() {
        let mut ctx = ServerContext::new(Box::new(MemoryAssets::default()));
        ctx.set_maxclients(4);
        assert_eq!(ctx.svs.clients.len(), 4);
        assert_eq!(ctx.cvar("deathmatch"), 1.0);
        ctx.set_maxclients(99);
        assert_eq!(ctx.svs.maxclients, MAX_SCOREBOARD);
        assert_eq!(ctx.edict_client(0), None);
        assert_eq!(ctx.edict_client(1), Some(0));
    }
}
