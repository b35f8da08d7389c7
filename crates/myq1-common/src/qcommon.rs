// qcommon.rs — definitions common between client and server
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use thiserror::Error;

// ============================================================
// SizeBuf
// ============================================================

/// Fixed-capacity message buffer used for every network message.
#[derive(Debug, Clone)]
pub struct SizeBuf {
    /// If false, overflow is a capacity error for the owner to report.
    pub allow_overflow: bool,
    /// Set when something was dropped because the buffer was full.
    pub overflowed: bool,
    /// Set when a read ran past `cursize`.
    pub badread: bool,
    pub data: Vec<u8>,
    pub maxsize: usize,
    pub cursize: usize,
    pub readcount: usize,
}

impl SizeBuf {
    pub fn new(maxsize: usize) -> Self {
        Self {
            allow_overflow: false,
            overflowed: false,
            badread: false,
            data: vec![0u8; maxsize],
            maxsize,
            cursize: 0,
            readcount: 0,
        }
    }

    /// Buffer pre-filled with `bytes`, ready for reading.
    pub fn from_bytes(bytes: &[u8], maxsize: usize) -> Self {
        let mut sb = Self::new(maxsize.max(bytes.len()));
        sb.data[..bytes.len()].copy_from_slice(bytes);
        sb.cursize = bytes.len();
        sb
    }

    pub fn clear(&mut self) {
        self.cursize = 0;
        self.overflowed = false;
    }

    pub fn is_empty(&self) -> bool {
        self.cursize == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.cursize]
    }

    /// Bytes still free for writing.
    pub fn remaining(&self) -> usize {
        self.maxsize - self.cursize
    }
}

// ============================================================
// Protocol
// ============================================================

pub const PROTOCOL_VERSION: i32 = 15;

pub const MAX_MSGLEN: usize = 8000; // max length of a reliable message
pub const MAX_DATAGRAM: usize = 1024; // max length of unreliable message
pub const MAX_PACKETLEN: usize = MAX_MSGLEN + MAX_DATAGRAM + 16;
pub const SIGNON_SIZE: usize = 8192;

pub const PORT_SERVER: u16 = 26000;

pub const DEFAULT_VIEWHEIGHT: f32 = 22.0;

// game types sent by serverinfo
pub const GAME_COOP: i32 = 0;
pub const GAME_DEATHMATCH: i32 = 1;

// if the high bit of the command byte is set, the rest of the byte holds
// the low U_* bits of a fast entity update
pub const U_MOREBITS: i32 = 1 << 0;
pub const U_ORIGIN1: i32 = 1 << 1;
pub const U_ORIGIN2: i32 = 1 << 2;
pub const U_ORIGIN3: i32 = 1 << 3;
pub const U_ANGLE2: i32 = 1 << 4;
pub const U_NOLERP: i32 = 1 << 5; // don't interpolate movement
pub const U_FRAME: i32 = 1 << 6;
pub const U_SIGNAL: i32 = 1 << 7; // just differentiates from other updates

// svc_update can pass all of the fast update bits, plus more
pub const U_ANGLE1: i32 = 1 << 8;
pub const U_ANGLE3: i32 = 1 << 9;
pub const U_MODEL: i32 = 1 << 10;
pub const U_COLORMAP: i32 = 1 << 11;
pub const U_SKIN: i32 = 1 << 12;
pub const U_EFFECTS: i32 = 1 << 13;
pub const U_LONGENTITY: i32 = 1 << 14;

pub const SU_VIEWHEIGHT: i32 = 1 << 0;
pub const SU_IDEALPITCH: i32 = 1 << 1;
pub const SU_PUNCH1: i32 = 1 << 2;
pub const SU_PUNCH2: i32 = 1 << 3;
pub const SU_PUNCH3: i32 = 1 << 4;
pub const SU_VELOCITY1: i32 = 1 << 5;
pub const SU_VELOCITY2: i32 = 1 << 6;
pub const SU_VELOCITY3: i32 = 1 << 7;
pub const SU_ITEMS: i32 = 1 << 9;
pub const SU_ONGROUND: i32 = 1 << 10; // no data follows, the bit is it
pub const SU_INWATER: i32 = 1 << 11; // no data follows, the bit is it
pub const SU_WEAPONFRAME: i32 = 1 << 12;
pub const SU_ARMOR: i32 = 1 << 13;
pub const SU_WEAPON: i32 = 1 << 14;

// a sound with no channel is a local only sound
pub const SND_VOLUME: i32 = 1 << 0; // a byte
pub const SND_ATTENUATION: i32 = 1 << 1; // a byte
pub const DEFAULT_SOUND_PACKET_VOLUME: i32 = 255;
pub const DEFAULT_SOUND_PACKET_ATTENUATION: f32 = 1.0;

// ============================================================
// Server to client
// ============================================================

pub const SVC_BAD: u8 = 0;
pub const SVC_NOP: u8 = 1;
pub const SVC_DISCONNECT: u8 = 2;
pub const SVC_UPDATESTAT: u8 = 3; // [byte] [long]
pub const SVC_VERSION: u8 = 4; // [long] server version
pub const SVC_SETVIEW: u8 = 5; // [short] entity number
pub const SVC_SOUND: u8 = 6; // <see code>
pub const SVC_TIME: u8 = 7; // [float] server time
pub const SVC_PRINT: u8 = 8; // [string] null terminated string
pub const SVC_STUFFTEXT: u8 = 9; // [string] stuffed into client's console buffer
pub const SVC_SETANGLE: u8 = 10; // [angle3] set the view angle to this absolute value
pub const SVC_SERVERINFO: u8 = 11; // [long] version, [string] signon string, model/sound lists
pub const SVC_LIGHTSTYLE: u8 = 12; // [byte] [string]
pub const SVC_UPDATENAME: u8 = 13; // [byte] [string]
pub const SVC_UPDATEFRAGS: u8 = 14; // [byte] [short]
pub const SVC_CLIENTDATA: u8 = 15; // <shortbits + data>
pub const SVC_STOPSOUND: u8 = 16; // <see code>
pub const SVC_UPDATECOLORS: u8 = 17; // [byte] [byte]
pub const SVC_PARTICLE: u8 = 18; // [vec3] <variable>
pub const SVC_DAMAGE: u8 = 19;
pub const SVC_SPAWNSTATIC: u8 = 20;
pub const SVC_SPAWNBINARY: u8 = 21;
pub const SVC_SPAWNBASELINE: u8 = 22;
pub const SVC_TEMP_ENTITY: u8 = 23;
pub const SVC_SETPAUSE: u8 = 24; // [byte] on / off
pub const SVC_SIGNONNUM: u8 = 25; // [byte] used for the signon sequence
pub const SVC_CENTERPRINT: u8 = 26; // [string] to put in center of the screen
pub const SVC_KILLEDMONSTER: u8 = 27;
pub const SVC_FOUNDSECRET: u8 = 28;
pub const SVC_SPAWNSTATICSOUND: u8 = 29; // [coord3] [byte] samp [byte] vol [byte] aten
pub const SVC_INTERMISSION: u8 = 30; // [string] music
pub const SVC_FINALE: u8 = 31; // [string] music [string] text
pub const SVC_CDTRACK: u8 = 32; // [byte] track [byte] looptrack
pub const SVC_SELLSCREEN: u8 = 33;
pub const SVC_CUTSCENE: u8 = 34;

// ============================================================
// Client to server
// ============================================================

pub const CLC_BAD: u8 = 0;
pub const CLC_NOP: u8 = 1;
pub const CLC_DISCONNECT: u8 = 2;
pub const CLC_MOVE: u8 = 3; // [usercmd_t]
pub const CLC_STRINGCMD: u8 = 4; // [string] message

// ============================================================
// Temp entity events
// ============================================================

pub const TE_SPIKE: i32 = 0;
pub const TE_SUPERSPIKE: i32 = 1;
pub const TE_GUNSHOT: i32 = 2;
pub const TE_EXPLOSION: i32 = 3;
pub const TE_TAREXPLOSION: i32 = 4;
pub const TE_LIGHTNING1: i32 = 5;
pub const TE_LIGHTNING2: i32 = 6;
pub const TE_WIZSPIKE: i32 = 7;
pub const TE_KNIGHTSPIKE: i32 = 8;
pub const TE_LIGHTNING3: i32 = 9;
pub const TE_LAVASPLASH: i32 = 10;
pub const TE_TELEPORT: i32 = 11;
pub const TE_EXPLOSION2: i32 = 12;
pub const TE_BEAM: i32 = 13;

/// Number of signon messages a client receives before it is in the game.
pub const SIGNONS: i32 = 4;

// ============================================================
// Entity state carried in baselines and updates
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityState {
    pub origin: [f32; 3],
    pub angles: [f32; 3],
    pub modelindex: i32,
    pub frame: i32,
    pub colormap: i32,
    pub skin: i32,
    pub effects: i32,
}

/// Movement intent sent by the client every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UserCmd {
    pub viewangles: [f32; 3],
    // intended velocities
    pub forwardmove: f32,
    pub sidemove: f32,
    pub upmove: f32,
}

// ============================================================
// Errors
// ============================================================

/// Malformed or out-of-sequence protocol data.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("read past end of message")]
    BadRead,
    #[error("illegible message: opcode {0}")]
    BadOpcode(i32),
    #[error("server returned version {0}, not {}", PROTOCOL_VERSION)]
    BadVersion(i32),
    #[error("{0}")]
    Malformed(String),
    #[error("{0} overflowed")]
    Overflow(&'static str),
}
