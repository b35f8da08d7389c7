// client.rs — client connection and world-mirror state
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::cvar::{CvarContext, CvarFlags};
use myq1_common::net::{NetAdr, NetDriver};
use myq1_common::net_chan::NetChan;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use thiserror::Error;

// ============================================================
// Constants
// ============================================================

pub const MAX_STATIC_ENTITIES: usize = 128;
pub const MAX_VISEDICTS: usize = 256;
pub const MAX_DLIGHTS: usize = 32;
pub const MAX_BEAMS: usize = 24;

/// Seconds between connection request retries.
pub const CONNECT_RESEND: f64 = 3.0;

/// Largest gap between two server messages that is still interpolated.
pub const MAX_LERP_GAP: f64 = 0.1;

/// A per-axis jump larger than this is a teleport, not motion.
pub const TELEPORT_DELTA: f32 = 100.0;

// entity effects, as sent by the server
pub const EF_BRIGHTFIELD: i32 = 1;
pub const EF_MUZZLEFLASH: i32 = 2;
pub const EF_BRIGHTLIGHT: i32 = 4;
pub const EF_DIMLIGHT: i32 = 8;

// ============================================================
// Errors
// ============================================================

/// Conditions that end the connection to the server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Server disconnected")]
    ServerDisconnected,
    #[error("Received signon {got} when at {at}")]
    BadSignon { got: i32, at: i32 },
    #[error("Bad maxclients ({0}) from server")]
    BadMaxClients(i32),
    #[error("CL_EntityNum: {0} is an invalid number")]
    BadEntityNum(i32),
    #[error("{0}")]
    Malformed(String),
    #[error("lost server connection")]
    Timeout,
}

// ============================================================
// Connection state (survives level changes)
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    /// Sending connection requests, waiting for `accept`.
    Connecting,
    /// Valid netchan, going through the signon sequence.
    Connected,
}

pub struct ClientStatic {
    pub state: ConnState,

    /// 0 to SIGNONS; the client is in the game once it reaches SIGNONS.
    pub signon: i32,

    pub servername: Option<NetAdr>,
    pub connect_time: f64,
    /// Random per-session id, lets the server survive NAT port changes.
    pub qport: i32,
    pub netchan: Option<NetChan>,
    pub driver: Option<Box<dyn NetDriver>>,

    /// Why the last connection ended, for display.
    pub disconnect_reason: Option<String>,
}

impl Default for ClientStatic {
    fn default() -> Self {
        Self {
            state: ConnState::Disconnected,
            signon: 0,
            servername: None,
            connect_time: -99999.0,
            qport: (rand::random::<u16>() & 0x7fff) as i32,
            netchan: None,
            driver: None,
            disconnect_reason: None,
        }
    }
}

// ============================================================
// Entity mirror
// ============================================================

/// One server entity as the client sees it. The last two origins and
/// angles received are kept so drawing can interpolate between them.
#[derive(Debug, Clone, Default)]
pub struct ClientEntity {
    pub baseline: EntityState,

    /// Time of the last message that carried this entity.
    pub msgtime: f64,
    /// [0] is the latest sample, [1] the one before it.
    pub msg_origins: [Vec3; 2],
    pub msg_angles: [Vec3; 2],

    /// Interpolated values for presentation.
    pub origin: Vec3,
    pub angles: Vec3,

    pub modelindex: i32,
    pub frame: i32,
    pub colormap: i32,
    pub skin: i32,
    pub effects: i32,

    /// Snap to the latest sample instead of interpolating.
    pub forcelink: bool,
}

impl ClientEntity {
    pub fn has_model(&self) -> bool {
        self.modelindex != 0
    }
}

/// Read-only copy of a visible entity for the presentation side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderEntity {
    pub num: usize,
    pub modelindex: i32,
    pub origin: Vec3,
    pub angles: Vec3,
    pub frame: i32,
    pub colormap: i32,
    pub skin: i32,
    pub effects: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DLight {
    pub key: usize,
    pub origin: Vec3,
    pub radius: f32,
    pub die: f64,
    pub minlight: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Beam {
    pub entity: i32,
    pub modelindex: i32,
    pub endtime: f64,
    pub start: Vec3,
    pub end: Vec3,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scoreboard {
    pub name: String,
    pub frags: i32,
    pub colors: i32, // two 4 bit fields
}

/// A sound the server asked for; mixing is the sound system's business.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundEvent {
    pub entity: i32,
    pub channel: i32,
    pub sound_num: i32,
    pub origin: Vec3,
    pub volume: f32,
    pub attenuation: f32,
}

/// Effects that only matter to presentation (particles, explosions).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempEvent {
    Particles { origin: Vec3, dir: Vec3, count: i32, color: i32 },
    Point { kind: i32, origin: Vec3 },
    Explosion2 { origin: Vec3, color_start: i32, color_length: i32 },
    Damage { armor: i32, blood: i32, from: Vec3 },
}

// ============================================================
// Per-level state, wiped on every serverinfo
// ============================================================

pub struct ClientState {
    pub movemessages: i32, // first few moves are thrown away
    pub cmd: UserCmd,

    pub stats: [i32; MAX_CL_STATS],
    pub items: i32,
    pub item_gettime: [f64; 32],

    /// Velocity from the last two clientdata messages.
    pub mvelocity: [Vec3; 2],
    pub velocity: Vec3,

    pub viewangles: Vec3,
    pub punchangle: Vec3,
    pub idealpitch: f32,
    pub viewheight: f32,

    pub paused: bool,
    pub onground: bool,
    pub inwater: bool,
    pub intermission: i32,
    pub completed_time: f64,

    /// Times of the last two server messages.
    pub mtime: [f64; 2],
    /// Clients view of time, between mtime[1] and mtime[0].
    pub time: f64,
    pub oldtime: f64,
    pub last_received_message: f64,

    pub model_precache: Vec<String>, // index 0 is always ""
    pub sound_precache: Vec<String>,

    pub levelname: String,
    pub viewentity: usize,
    pub maxclients: usize,
    pub gametype: i32,
    pub cdtrack: i32,
    pub looptrack: i32,

    pub scores: Vec<Scoreboard>,
    pub lightstyles: Vec<String>,

    pub entities: Vec<ClientEntity>,
    pub num_entities: usize, // held in entities array
    pub static_entities: Vec<ClientEntity>,
    pub visedicts: Vec<usize>,

    pub dlights: Vec<DLight>,
    pub beams: Vec<Beam>,
    pub sound_events: Vec<SoundEvent>,
    pub static_sounds: Vec<SoundEvent>,
    pub temp_events: Vec<TempEvent>,
    pub centerprint: Option<String>,
    /// Console text the server stuffed for execution.
    pub stufftext: Vec<String>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            movemessages: 0,
            cmd: UserCmd::default(),
            stats: [0; MAX_CL_STATS],
            items: 0,
            item_gettime: [0.0; 32],
            mvelocity: [[0.0; 3]; 2],
            velocity: [0.0; 3],
            viewangles: [0.0; 3],
            punchangle: [0.0; 3],
            idealpitch: 0.0,
            viewheight: DEFAULT_VIEWHEIGHT,
            paused: false,
            onground: false,
            inwater: false,
            intermission: 0,
            completed_time: 0.0,
            mtime: [0.0; 2],
            time: 0.0,
            oldtime: 0.0,
            last_received_message: 0.0,
            model_precache: vec![String::new()],
            sound_precache: vec![String::new()],
            levelname: String::new(),
            viewentity: 0,
            maxclients: 0,
            gametype: GAME_COOP,
            cdtrack: 0,
            looptrack: 0,
            scores: Vec::new(),
            lightstyles: vec![String::new(); MAX_LIGHTSTYLES],
            entities: vec![ClientEntity::default(); MAX_EDICTS],
            num_entities: 0,
            static_entities: Vec::new(),
            visedicts: Vec::new(),
            dlights: Vec::new(),
            beams: Vec::new(),
            sound_events: Vec::new(),
            static_sounds: Vec::new(),
            temp_events: Vec::new(),
            centerprint: None,
            stufftext: Vec::new(),
        }
    }
}

// ============================================================
// ClientContext
// ============================================================

/// Everything the client owns. Nothing here is shared with the server;
/// presentation reads copies made by `render_entities`.
pub struct ClientContext {
    pub cvars: CvarContext,
    pub cls: ClientStatic,
    pub cl: ClientState,

    pub realtime: f64,
    pub host_frametime: f64,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientContext {
    pub fn new() -> Self {
        let mut ctx = Self {
            cvars: CvarContext::new(),
            cls: ClientStatic::default(),
            cl: ClientState::default(),
            realtime: 0.0,
            host_frametime: 0.0,
        };
        ctx.cl_init();
        ctx
    }

    /// Register the client variables.
    pub fn cl_init(&mut self) {
        let c = &mut self.cvars;
        c.register("_cl_name", "player", CvarFlags::ARCHIVE);
        c.register("_cl_color", "0", CvarFlags::ARCHIVE);
        c.register("cl_nolerp", "0", CvarFlags::empty());
        c.register("cl_timeout", "60", CvarFlags::empty());
        c.register("cl_upspeed", "200", CvarFlags::empty());
        c.register("cl_forwardspeed", "200", CvarFlags::ARCHIVE);
        c.register("cl_backspeed", "200", CvarFlags::ARCHIVE);
        c.register("cl_sidespeed", "350", CvarFlags::empty());
        c.register("cl_movespeedkey", "2.0", CvarFlags::empty());
        c.register("cl_yawspeed", "140", CvarFlags::empty());
        c.register("cl_pitchspeed", "150", CvarFlags::empty());
        c.register("cl_anglespeedkey", "1.5", CvarFlags::empty());
    }

    #[inline]
    pub fn cvar(&self, name: &str) -> f32 {
        self.cvars.variable_value(name)
    }

    /// Forget everything about the current level.
    pub fn clear_state(&mut self) {
        self.cl = ClientState::default();
        if let Some(chan) = self.cls.netchan.as_mut() {
            chan.message.clear();
        }
    }

    /// Entity slot `num`, growing the live count to cover it.
    pub fn entity_num(&mut self, num: i32) -> Result<&mut ClientEntity, ClientError> {
        if num < 0 || num as usize >= self.cl.entities.len() {
            return Err(ClientError::BadEntityNum(num));
        }
        let num = num as usize;
        if num >= self.cl.num_entities {
            self.cl.num_entities = num + 1;
        }
        Ok(&mut self.cl.entities[num])
    }

    /// Copies of the entities to draw this frame.
    pub fn render_entities(&self) -> Vec<RenderEntity> {
        self.cl
            .visedicts
            .iter()
            .map(|&num| {
                let ent = &self.cl.entities[num];
                RenderEntity {
                    num,
                    modelindex: ent.modelindex,
                    origin: ent.origin,
                    angles: ent.angles,
                    frame: ent.frame,
                    colormap: ent.colormap,
                    skin: ent.skin,
                    effects: ent.effects,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_num_grows_live_count() {
        let mut ctx = ClientContext::new();
        assert_eq!(ctx.cl.num_entities, 0);
        ctx.entity_num(5).unwrap().frame = 3;
        assert_eq!(ctx.cl.num_entities, 6);
        ctx.entity_num(2).unwrap();
        assert_eq!(ctx.cl.num_entities, 6);
        assert_eq!(ctx.cl.entities[5].frame, 3);
        assert!(matches!(ctx.entity_num(MAX_EDICTS as i32), Err(ClientError::BadEntityNum(_))));
        assert!(matches!(ctx.entity_num(-1), Err(ClientError::BadEntityNum(-1))));
    }

    #[test]
    fn test_clear_state_resets_level() {
        let mut ctx = ClientContext::new();
        ctx.cl.levelname = "the slipgate complex".into();
        ctx.entity_num(9).unwrap();
        ctx.clear_state();
        assert!(ctx.cl.levelname.is_empty());
        assert_eq!(ctx.cl.num_entities, 0);
        assert_eq!(ctx.cl.model_precache, vec![String::new()]);
        assert_eq!(ctx.cl.viewheight, DEFAULT_VIEWHEIGHT);
    }

    #[test]
    fn test_qport_is_fifteen_bits() {
        let cls = ClientStatic::default();
        assert!((0..0x8000).contains(&cls.qport));
    }
}
