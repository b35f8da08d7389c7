// progs.rs — compiled gameplay program image and VM register file
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::{bytes_string, com_dprintf, string_bytes};
use myq1_common::crc::crc_block;
use myq1_common::q_shared::Vec3;

use std::borrow::Cow;
use thiserror::Error;

pub const PROG_VERSION: i32 = 6;
pub const PROGHEADER_CRC: i32 = 5927;

pub const MAX_PARMS: usize = 8;
pub const DEF_SAVEGLOBAL: u16 = 1 << 15;

pub const OFS_NULL: usize = 0;
pub const OFS_RETURN: usize = 1;
pub const OFS_PARM0: usize = 4; // leave 3 ofs for each parm to hold vectors
pub const OFS_PARM1: usize = 7;
pub const OFS_PARM2: usize = 10;
pub const OFS_PARM3: usize = 13;
pub const OFS_PARM4: usize = 16;
pub const OFS_PARM5: usize = 19;
pub const OFS_PARM6: usize = 22;
pub const OFS_PARM7: usize = 25;
pub const RESERVED_OFS: usize = 28;

/// Global offset of builtin parameter `n`.
#[inline]
pub const fn ofs_parm(n: usize) -> usize {
    OFS_PARM0 + n * 3
}

// ============================================================
// Register cells
// ============================================================

/// One 32-bit slot of the global or entity register file. The tag records
/// what was last stored; typed reads reinterpret the bits the way the
/// bytecode expects. A vector is three consecutive `Float` cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Float(f32),
    String(i32),
    Entity(i32),
    Function(i32),
    Int(i32),
}

impl Default for Cell {
    fn default() -> Self {
        Cell::Float(0.0)
    }
}

impl Cell {
    #[inline]
    pub fn as_float(self) -> f32 {
        match self {
            Cell::Float(f) => f,
            Cell::String(i) | Cell::Entity(i) | Cell::Function(i) | Cell::Int(i) => {
                f32::from_bits(i as u32)
            }
        }
    }

    #[inline]
    pub fn as_int(self) -> i32 {
        match self {
            Cell::Float(f) => f.to_bits() as i32,
            Cell::String(i) | Cell::Entity(i) | Cell::Function(i) | Cell::Int(i) => i,
        }
    }

    /// Zero bits, the false value of every type.
    #[inline]
    pub fn is_zero(self) -> bool {
        self.as_int() == 0
    }

    fn from_raw(etype: Etype, raw: u32) -> Self {
        match etype {
            Etype::String => Cell::String(raw as i32),
            Etype::Entity => Cell::Entity(raw as i32),
            Etype::Function => Cell::Function(raw as i32),
            Etype::Field | Etype::Pointer => Cell::Int(raw as i32),
            Etype::Void | Etype::Float | Etype::Vector => Cell::Float(f32::from_bits(raw)),
        }
    }
}

// ============================================================
// Built-in entity fields
//
// Offsets of the fields the engine reads and writes directly. Fields
// above ENTVARS_SIZE belong to the program alone.
// ============================================================

pub mod ev {
    pub const MODELINDEX: usize = 0;
    pub const ABSMIN: usize = 1;
    pub const ABSMAX: usize = 4;
    pub const LTIME: usize = 7;
    pub const MOVETYPE: usize = 8;
    pub const SOLID: usize = 9;
    pub const ORIGIN: usize = 10;
    pub const OLDORIGIN: usize = 13;
    pub const VELOCITY: usize = 16;
    pub const ANGLES: usize = 19;
    pub const AVELOCITY: usize = 22;
    pub const PUNCHANGLE: usize = 25;
    pub const CLASSNAME: usize = 28;
    pub const MODEL: usize = 29;
    pub const FRAME: usize = 30;
    pub const SKIN: usize = 31;
    pub const EFFECTS: usize = 32;
    pub const MINS: usize = 33;
    pub const MAXS: usize = 36;
    pub const SIZE: usize = 39;
    pub const TOUCH: usize = 42;
    pub const USE: usize = 43;
    pub const THINK: usize = 44;
    pub const BLOCKED: usize = 45;
    pub const NEXTTHINK: usize = 46;
    pub const GROUNDENTITY: usize = 47;
    pub const HEALTH: usize = 48;
    pub const FRAGS: usize = 49;
    pub const WEAPON: usize = 50;
    pub const WEAPONMODEL: usize = 51;
    pub const WEAPONFRAME: usize = 52;
    pub const CURRENTAMMO: usize = 53;
    pub const AMMO_SHELLS: usize = 54;
    pub const AMMO_NAILS: usize = 55;
    pub const AMMO_ROCKETS: usize = 56;
    pub const AMMO_CELLS: usize = 57;
    pub const ITEMS: usize = 58;
    pub const TAKEDAMAGE: usize = 59;
    pub const CHAIN: usize = 60;
    pub const DEADFLAG: usize = 61;
    pub const VIEW_OFS: usize = 62;
    pub const BUTTON0: usize = 65;
    pub const BUTTON1: usize = 66;
    pub const BUTTON2: usize = 67;
    pub const IMPULSE: usize = 68;
    pub const FIXANGLE: usize = 69;
    pub const V_ANGLE: usize = 70;
    pub const IDEALPITCH: usize = 73;
    pub const NETNAME: usize = 74;
    pub const ENEMY: usize = 75;
    pub const FLAGS: usize = 76;
    pub const COLORMAP: usize = 77;
    pub const TEAM: usize = 78;
    pub const MAX_HEALTH: usize = 79;
    pub const TELEPORT_TIME: usize = 80;
    pub const ARMORTYPE: usize = 81;
    pub const ARMORVALUE: usize = 82;
    pub const WATERLEVEL: usize = 83;
    pub const WATERTYPE: usize = 84;
    pub const IDEAL_YAW: usize = 85;
    pub const YAW_SPEED: usize = 86;
    pub const AIMENT: usize = 87;
    pub const GOALENTITY: usize = 88;
    pub const SPAWNFLAGS: usize = 89;
    pub const TARGET: usize = 90;
    pub const TARGETNAME: usize = 91;
    pub const DMG_TAKE: usize = 92;
    pub const DMG_SAVE: usize = 93;
    pub const DMG_INFLICTOR: usize = 94;
    pub const OWNER: usize = 95;
    pub const MOVEDIR: usize = 96;
    pub const MESSAGE: usize = 99;
    pub const SOUNDS: usize = 100;
    pub const NOISE: usize = 101;
    pub const NOISE1: usize = 102;
    pub const NOISE2: usize = 103;
    pub const NOISE3: usize = 104;
}

/// Number of built-in entity field cells.
pub const ENTVARS_SIZE: usize = 105;

/// Built-in globals.
pub mod gv {
    pub const SELF: usize = 28;
    pub const OTHER: usize = 29;
    pub const WORLD: usize = 30;
    pub const TIME: usize = 31;
    pub const FRAMETIME: usize = 32;
    pub const FORCE_RETOUCH: usize = 33;
    pub const MAPNAME: usize = 34;
    pub const DEATHMATCH: usize = 35;
    pub const COOP: usize = 36;
    pub const TEAMPLAY: usize = 37;
    pub const SERVERFLAGS: usize = 38;
    pub const TOTAL_SECRETS: usize = 39;
    pub const TOTAL_MONSTERS: usize = 40;
    pub const FOUND_SECRETS: usize = 41;
    pub const KILLED_MONSTERS: usize = 42;
    pub const PARM1: usize = 43; // parm1..parm16
    pub const V_FORWARD: usize = 59;
    pub const V_UP: usize = 62;
    pub const V_RIGHT: usize = 65;
    pub const TRACE_ALLSOLID: usize = 68;
    pub const TRACE_STARTSOLID: usize = 69;
    pub const TRACE_FRACTION: usize = 70;
    pub const TRACE_ENDPOS: usize = 71;
    pub const TRACE_PLANE_NORMAL: usize = 74;
    pub const TRACE_PLANE_DIST: usize = 77;
    pub const TRACE_ENT: usize = 78;
    pub const TRACE_INOPEN: usize = 79;
    pub const TRACE_INWATER: usize = 80;
    pub const MSG_ENTITY: usize = 81;
    pub const MAIN: usize = 82;
    pub const START_FRAME: usize = 83;
    pub const PLAYER_PRE_THINK: usize = 84;
    pub const PLAYER_POST_THINK: usize = 85;
    pub const CLIENT_KILL: usize = 86;
    pub const CLIENT_CONNECT: usize = 87;
    pub const PUT_CLIENT_IN_SERVER: usize = 88;
    pub const CLIENT_DISCONNECT: usize = 89;
    pub const SET_NEW_PARMS: usize = 90;
    pub const SET_CHANGE_PARMS: usize = 91;
}

/// Number of built-in global cells.
pub const GLOBALVARS_SIZE: usize = 92;

// ============================================================
// File format
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Etype {
    Void,
    String,
    Float,
    Vector,
    Entity,
    Field,
    Function,
    Pointer,
}

impl Etype {
    pub fn from_def(def_type: u16) -> Option<Self> {
        Some(match def_type & !DEF_SAVEGLOBAL {
            0 => Etype::Void,
            1 => Etype::String,
            2 => Etype::Float,
            3 => Etype::Vector,
            4 => Etype::Entity,
            5 => Etype::Field,
            6 => Etype::Function,
            7 => Etype::Pointer,
            _ => return None,
        })
    }

    /// Cells occupied by a value of this type.
    pub fn width(self) -> usize {
        if self == Etype::Vector {
            3
        } else {
            1
        }
    }
}

macro_rules! opcodes {
    ($($name:ident),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum Opcode { $($name),* }

        impl Opcode {
            const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn from_u16(op: u16) -> Option<Self> {
                Self::ALL.get(op as usize).copied()
            }

            pub fn name(self) -> &'static str {
                match self { $(Opcode::$name => stringify!($name)),* }
            }
        }
    };
}

opcodes! {
    DONE,
    MUL_F, MUL_V, MUL_FV, MUL_VF,
    DIV_F,
    ADD_F, ADD_V,
    SUB_F, SUB_V,

    EQ_F, EQ_V, EQ_S, EQ_E, EQ_FNC,
    NE_F, NE_V, NE_S, NE_E, NE_FNC,

    LE, GE, LT, GT,

    LOAD_F, LOAD_V, LOAD_S, LOAD_ENT, LOAD_FLD, LOAD_FNC,

    ADDRESS,

    STORE_F, STORE_V, STORE_S, STORE_ENT, STORE_FLD, STORE_FNC,
    STOREP_F, STOREP_V, STOREP_S, STOREP_ENT, STOREP_FLD, STOREP_FNC,

    RETURN,
    NOT_F, NOT_V, NOT_S, NOT_ENT, NOT_FNC,
    IF, IFNOT,
    CALL0, CALL1, CALL2, CALL3, CALL4, CALL5, CALL6, CALL7, CALL8,
    STATE,
    GOTO,
    AND, OR,
    BITAND, BITOR,
}

impl Opcode {
    /// Width of each operand used as a global index, 0 when the operand
    /// is unused or is a jump offset.
    fn operand_widths(self) -> [usize; 3] {
        use Opcode::*;
        match self {
            DONE | RETURN => [3, 0, 0],
            MUL_V => [3, 3, 1],
            MUL_FV => [1, 3, 3],
            MUL_VF => [3, 1, 3],
            ADD_V | SUB_V => [3, 3, 3],
            EQ_V | NE_V => [3, 3, 1],
            MUL_F | DIV_F | ADD_F | SUB_F | EQ_F | EQ_S | EQ_E | EQ_FNC | NE_F | NE_S | NE_E
            | NE_FNC | LE | GE | LT | GT | AND | OR | BITAND | BITOR => [1, 1, 1],
            LOAD_V => [1, 1, 3],
            LOAD_F | LOAD_S | LOAD_ENT | LOAD_FLD | LOAD_FNC | ADDRESS => [1, 1, 1],
            STORE_V => [3, 3, 0],
            STOREP_V => [3, 1, 0],
            STORE_F | STORE_S | STORE_ENT | STORE_FLD | STORE_FNC | STOREP_F | STOREP_S
            | STOREP_ENT | STOREP_FLD | STOREP_FNC => [1, 1, 0],
            NOT_V => [3, 0, 1],
            NOT_F | NOT_S | NOT_ENT | NOT_FNC => [1, 0, 1],
            IF | IFNOT => [1, 0, 0],
            CALL0 | CALL1 | CALL2 | CALL3 | CALL4 | CALL5 | CALL6 | CALL7 | CALL8 => [1, 0, 0],
            STATE => [1, 1, 0],
            GOTO => [0, 0, 0],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statement {
    pub op: u16,
    pub a: i16,
    pub b: i16,
    pub c: i16,
}

impl Statement {
    #[inline]
    pub fn ga(&self) -> usize {
        self.a as u16 as usize
    }
    #[inline]
    pub fn gb(&self) -> usize {
        self.b as u16 as usize
    }
    #[inline]
    pub fn gc(&self) -> usize {
        self.c as u16 as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Def {
    pub def_type: u16, // if DEF_SAVEGLOBAL bit is set the variable needs to be saved in savegames
    pub ofs: u16,
    pub s_name: i32,
}

impl Def {
    pub fn etype(&self) -> Option<Etype> {
        Etype::from_def(self.def_type)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Function {
    pub first_statement: i32, // negative numbers are builtins
    pub parm_start: i32,
    pub locals: i32, // total ints of parms + locals
    pub s_name: i32,
    pub s_file: i32, // source file defined in
    pub numparms: i32,
    pub parm_size: [u8; MAX_PARMS],
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgsHeader {
    pub version: i32,
    pub crc: i32, // check of header file
    pub ofs_statements: i32,
    pub numstatements: i32, // statement 0 is an error
    pub ofs_globaldefs: i32,
    pub numglobaldefs: i32,
    pub ofs_fielddefs: i32,
    pub numfielddefs: i32,
    pub ofs_functions: i32,
    pub numfunctions: i32, // function 0 is an empty
    pub ofs_strings: i32,
    pub numstrings: i32, // first string is a null string
    pub ofs_globals: i32,
    pub numglobals: i32,
    pub entityfields: i32,
}

pub const HEADER_SIZE: usize = 15 * 4;
pub const STATEMENT_SIZE: usize = 8;
pub const DEF_SIZE: usize = 8;
pub const FUNCTION_SIZE: usize = 7 * 4 + MAX_PARMS;

#[derive(Debug, Error, PartialEq)]
pub enum ProgsError {
    #[error("progs.dat too small for a header ({0} bytes)")]
    Truncated(usize),
    #[error("progs.dat has wrong version number ({0} should be {})", PROG_VERSION)]
    BadVersion(i32),
    #[error("progs.dat system vars have been modified, progdefs.h is out of date")]
    BadCrc(i32),
    #[error("progs.dat {section} out of range")]
    SectionOutOfRange { section: &'static str },
    #[error("progs.dat needs at least {need} {what}, has {have}")]
    TooSmall { what: &'static str, need: usize, have: usize },
    #[error("statement {statement}: bad opcode {op}")]
    BadOpcode { statement: usize, op: u16 },
    #[error("statement {statement}: operand out of range")]
    BadOperand { statement: usize },
    #[error("function {function}: bad {what}")]
    BadFunction { function: usize, what: &'static str },
    #[error("couldn't find {0}")]
    Missing(String),
}

fn read_i32(bytes: &[u8], ofs: usize) -> Option<i32> {
    bytes
        .get(ofs..ofs + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u16(bytes: &[u8], ofs: usize) -> Option<u16> {
    bytes.get(ofs..ofs + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Byte range of a section, checked against the file size.
fn section(
    bytes: &[u8],
    ofs: i32,
    count: i32,
    size: usize,
    name: &'static str,
) -> Result<std::ops::Range<usize>, ProgsError> {
    let bad = || ProgsError::SectionOutOfRange { section: name };
    let ofs = usize::try_from(ofs).map_err(|_| bad())?;
    let count = usize::try_from(count).map_err(|_| bad())?;
    let end = count
        .checked_mul(size)
        .and_then(|n| n.checked_add(ofs))
        .ok_or_else(bad)?;
    if end > bytes.len() {
        return Err(bad());
    }
    Ok(ofs..end)
}

/// A loaded, validated program image. Immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct ProgsDat {
    pub header: ProgsHeader,
    pub statements: Vec<Statement>,
    pub globaldefs: Vec<Def>,
    pub fielddefs: Vec<Def>,
    pub functions: Vec<Function>,
    pub strings: Vec<u8>,
    /// Initial contents of the global register file.
    pub globals: Vec<Cell>,
    /// CRC of the whole file.
    pub crc: u16,
}

impl ProgsDat {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgsError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProgsError::Truncated(bytes.len()));
        }
        let mut h = [0i32; 15];
        for (i, v) in h.iter_mut().enumerate() {
            *v = read_i32(bytes, i * 4).ok_or(ProgsError::Truncated(bytes.len()))?;
        }
        let header = ProgsHeader {
            version: h[0],
            crc: h[1],
            ofs_statements: h[2],
            numstatements: h[3],
            ofs_globaldefs: h[4],
            numglobaldefs: h[5],
            ofs_fielddefs: h[6],
            numfielddefs: h[7],
            ofs_functions: h[8],
            numfunctions: h[9],
            ofs_strings: h[10],
            numstrings: h[11],
            ofs_globals: h[12],
            numglobals: h[13],
            entityfields: h[14],
        };

        if header.version != PROG_VERSION {
            return Err(ProgsError::BadVersion(header.version));
        }
        if header.crc != PROGHEADER_CRC {
            return Err(ProgsError::BadCrc(header.crc));
        }

        let strings_range = section(bytes, header.ofs_strings, header.numstrings, 1, "strings")?;
        let strings = bytes[strings_range].to_vec();

        let range = section(bytes, header.ofs_statements, header.numstatements, STATEMENT_SIZE, "statements")?;
        let statements: Vec<Statement> = bytes[range]
            .chunks_exact(STATEMENT_SIZE)
            .map(|c| Statement {
                op: u16::from_le_bytes([c[0], c[1]]),
                a: i16::from_le_bytes([c[2], c[3]]),
                b: i16::from_le_bytes([c[4], c[5]]),
                c: i16::from_le_bytes([c[6], c[7]]),
            })
            .collect();

        let read_defs = |ofs: i32, num: i32, name: &'static str| -> Result<Vec<Def>, ProgsError> {
            let range = section(bytes, ofs, num, DEF_SIZE, name)?;
            Ok(bytes[range]
                .chunks_exact(DEF_SIZE)
                .map(|c| Def {
                    def_type: u16::from_le_bytes([c[0], c[1]]),
                    ofs: u16::from_le_bytes([c[2], c[3]]),
                    s_name: i32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                })
                .collect())
        };
        let globaldefs = read_defs(header.ofs_globaldefs, header.numglobaldefs, "globaldefs")?;
        let fielddefs = read_defs(header.ofs_fielddefs, header.numfielddefs, "fielddefs")?;

        let range = section(bytes, header.ofs_functions, header.numfunctions, FUNCTION_SIZE, "functions")?;
        let functions: Vec<Function> = bytes[range]
            .chunks_exact(FUNCTION_SIZE)
            .map(|c| {
                let i = |n: usize| i32::from_le_bytes([c[n * 4], c[n * 4 + 1], c[n * 4 + 2], c[n * 4 + 3]]);
                let mut parm_size = [0u8; MAX_PARMS];
                parm_size.copy_from_slice(&c[28..28 + MAX_PARMS]);
                Function {
                    first_statement: i(0),
                    parm_start: i(1),
                    locals: i(2),
                    // i(3) is the runtime profile slot
                    s_name: i(4),
                    s_file: i(5),
                    numparms: i(6),
                    parm_size,
                }
            })
            .collect();

        let range = section(bytes, header.ofs_globals, header.numglobals, 4, "globals")?;
        let raw: Vec<u32> = bytes[range]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut globals: Vec<Cell> = raw.iter().map(|&r| Cell::Float(f32::from_bits(r))).collect();
        for def in &globaldefs {
            let Some(etype) = def.etype() else { continue };
            let ofs = def.ofs as usize;
            if etype == Etype::Vector || ofs >= globals.len() {
                continue;
            }
            globals[ofs] = Cell::from_raw(etype, raw[ofs]);
        }

        let dat = Self {
            header,
            statements,
            globaldefs,
            fielddefs,
            functions,
            strings,
            globals,
            crc: crc_block(bytes),
        };
        dat.validate()?;
        Ok(dat)
    }

    fn validate(&self) -> Result<(), ProgsError> {
        let numglobals = self.globals.len();
        if numglobals < GLOBALVARS_SIZE {
            return Err(ProgsError::TooSmall { what: "globals", need: GLOBALVARS_SIZE, have: numglobals });
        }
        let entityfields = self.header.entityfields.max(0) as usize;
        if entityfields < ENTVARS_SIZE {
            return Err(ProgsError::TooSmall { what: "entity fields", need: ENTVARS_SIZE, have: entityfields });
        }

        let numstatements = self.statements.len() as i64;
        for (i, st) in self.statements.iter().enumerate() {
            let op = Opcode::from_u16(st.op).ok_or(ProgsError::BadOpcode { statement: i, op: st.op })?;
            let widths = op.operand_widths();
            for (operand, width) in [st.ga(), st.gb(), st.gc()].into_iter().zip(widths) {
                if width > 0 && operand + width > numglobals {
                    return Err(ProgsError::BadOperand { statement: i });
                }
            }
            let jump = match op {
                Opcode::GOTO => Some(st.a),
                Opcode::IF | Opcode::IFNOT => Some(st.b),
                _ => None,
            };
            if let Some(jump) = jump {
                let target = i as i64 + jump as i64;
                if target < 0 || target >= numstatements {
                    return Err(ProgsError::BadOperand { statement: i });
                }
            }
        }

        for (i, f) in self.functions.iter().enumerate() {
            if f.first_statement >= 0 && f.first_statement as i64 >= numstatements && i != 0 {
                return Err(ProgsError::BadFunction { function: i, what: "first statement" });
            }
            if f.parm_start < 0 || f.locals < 0 || (f.parm_start + f.locals) as usize > numglobals {
                return Err(ProgsError::BadFunction { function: i, what: "locals" });
            }
            if f.numparms < 0 || f.numparms as usize > MAX_PARMS {
                return Err(ProgsError::BadFunction { function: i, what: "parameter count" });
            }
        }
        Ok(())
    }

    pub fn entityfields(&self) -> usize {
        self.header.entityfields as usize
    }

    /// String from the program's string table.
    pub fn string_at(&self, ofs: i32) -> Cow<'_, str> {
        let Some(tail) = usize::try_from(ofs).ok().and_then(|o| self.strings.get(o..)) else {
            return Cow::Borrowed("");
        };
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        bytes_string(&tail[..end])
    }

    pub fn function_name(&self, fnum: usize) -> Cow<'_, str> {
        self.functions
            .get(fnum)
            .map_or(Cow::Borrowed("(null)"), |f| self.string_at(f.s_name))
    }

    pub fn find_field(&self, name: &str) -> Option<&Def> {
        self.fielddefs.iter().find(|d| self.string_at(d.s_name) == name)
    }

    pub fn find_global(&self, name: &str) -> Option<&Def> {
        self.globaldefs.iter().find(|d| self.string_at(d.s_name) == name)
    }

    pub fn global_at_ofs(&self, ofs: usize) -> Option<&Def> {
        self.globaldefs.iter().find(|d| d.ofs as usize == ofs)
    }

    pub fn field_at_ofs(&self, ofs: usize) -> Option<&Def> {
        self.fielddefs.iter().find(|d| d.ofs as usize == ofs)
    }

    pub fn find_function(&self, name: &str) -> Option<usize> {
        self.functions
            .iter()
            .position(|f| self.string_at(f.s_name) == name)
    }
}

// ============================================================
// Runtime program state
// ============================================================

pub const MAX_STACK_DEPTH: usize = 32;
pub const LOCALSTACK_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, Default)]
pub struct StackFrame {
    pub s: i32,
    pub f: usize, // function index
}

/// The loaded program plus everything that changes while it runs.
#[derive(Debug, Clone, Default)]
pub struct Progs {
    pub dat: ProgsDat,
    pub globals: Vec<Cell>,

    /// Strings created at run time. Id `-1 - i` is `dyn_strings[i]`;
    /// slot 0 is the temporary result of ftos/vtos and friends.
    pub dyn_strings: Vec<String>,

    // interpreter state
    pub stack: Vec<StackFrame>,
    pub localstack: Vec<Cell>,
    pub xfunction: usize,
    pub xstatement: i32,
    pub argc: usize,
    pub trace: bool,
    pub profile: Vec<u32>,
    pub builtin_profile: Vec<u32>,

    /// Offsets of optional fields some programs declare.
    pub field_gravity: Option<usize>,
    pub field_items2: Option<usize>,
}

impl Progs {
    pub fn new(dat: ProgsDat) -> Self {
        let globals = dat.globals.clone();
        let nfuncs = dat.functions.len();
        let optional_field = |name: &str| {
            dat.find_field(name)
                .map(|d| d.ofs as usize)
                .filter(|&ofs| ofs < dat.entityfields())
        };
        let field_gravity = optional_field("gravity");
        let field_items2 = optional_field("items2");
        com_dprintf(&format!(
            "Programs occupy {}K, crc {}\n",
            (dat.statements.len() * STATEMENT_SIZE + dat.globals.len() * 4 + dat.strings.len()) / 1024,
            dat.crc
        ));
        Self {
            dat,
            globals,
            dyn_strings: vec![String::new()],
            stack: Vec::with_capacity(MAX_STACK_DEPTH),
            localstack: Vec::with_capacity(LOCALSTACK_SIZE),
            xfunction: 0,
            xstatement: 0,
            argc: 0,
            trace: false,
            profile: vec![0; nfuncs],
            builtin_profile: Vec::new(),
            field_gravity,
            field_items2,
        }
    }

    pub fn entityfields(&self) -> usize {
        self.dat.entityfields()
    }

    /// Unwind a half-finished call chain after a runtime fault, putting
    /// back the locals each active call had saved.
    pub fn reset_stack(&mut self) {
        while let Some(frame) = self.stack.pop() {
            let Some(f) = self.dat.functions.get(self.xfunction) else { break };
            let start = f.parm_start.max(0) as usize;
            let count = f.locals.max(0) as usize;
            let Some(base) = self.localstack.len().checked_sub(count) else { break };
            for (i, cell) in self.localstack.drain(base..).enumerate() {
                if let Some(g) = self.globals.get_mut(start + i) {
                    *g = cell;
                }
            }
            self.xfunction = frame.f;
        }
        self.stack.clear();
        self.localstack.clear();
        self.xfunction = 0;
    }

    // ---- strings ----

    pub fn get_string(&self, id: i32) -> Cow<'_, str> {
        if id < 0 {
            let idx = (-1 - id) as usize;
            return self
                .dyn_strings
                .get(idx)
                .map_or(Cow::Borrowed(""), |s| Cow::Borrowed(s.as_str()));
        }
        self.dat.string_at(id)
    }

    /// Store a permanent string for the rest of the level.
    pub fn new_string(&mut self, s: &str) -> i32 {
        self.dyn_strings.push(s.to_string());
        -(self.dyn_strings.len() as i32)
    }

    /// Overwrite the shared temporary string and return its id.
    pub fn temp_string(&mut self, s: String) -> i32 {
        self.dyn_strings[0] = s;
        -1
    }

    /// Forget level strings, keeping the temporary slot.
    pub fn clear_strings(&mut self) {
        self.dyn_strings.truncate(1);
    }

    /// Id of `s` in the string table, adding it if needed.
    pub fn set_string(&mut self, s: &str) -> i32 {
        if s.is_empty() {
            return 0;
        }
        let bytes = string_bytes(s);
        if let Some(pos) = find_subslice(&self.dat.strings, &bytes) {
            // must be followed by a terminator to be the same string
            if self.dat.strings.get(pos + bytes.len()) == Some(&0) {
                return pos as i32;
            }
        }
        self.new_string(s)
    }

    // ---- globals ----

    #[inline]
    pub fn g_float(&self, ofs: usize) -> f32 {
        self.globals[ofs].as_float()
    }

    #[inline]
    pub fn g_int(&self, ofs: usize) -> i32 {
        self.globals[ofs].as_int()
    }

    #[inline]
    pub fn g_vector(&self, ofs: usize) -> Vec3 {
        [
            self.globals[ofs].as_float(),
            self.globals[ofs + 1].as_float(),
            self.globals[ofs + 2].as_float(),
        ]
    }

    /// Edict number held in a global.
    #[inline]
    pub fn g_edict(&self, ofs: usize) -> usize {
        self.globals[ofs].as_int().max(0) as usize
    }

    pub fn g_string(&self, ofs: usize) -> String {
        self.get_string(self.globals[ofs].as_int()).into_owned()
    }

    #[inline]
    pub fn set_g_float(&mut self, ofs: usize, v: f32) {
        self.globals[ofs] = Cell::Float(v);
    }

    #[inline]
    pub fn set_g_vector(&mut self, ofs: usize, v: &Vec3) {
        for i in 0..3 {
            self.globals[ofs + i] = Cell::Float(v[i]);
        }
    }

    #[inline]
    pub fn set_g_edict(&mut self, ofs: usize, e: usize) {
        self.globals[ofs] = Cell::Entity(e as i32);
    }

    #[inline]
    pub fn set_g_string(&mut self, ofs: usize, s: i32) {
        self.globals[ofs] = Cell::String(s);
    }

    #[inline]
    pub fn set_g_function(&mut self, ofs: usize, f: i32) {
        self.globals[ofs] = Cell::Function(f);
    }

    // ---- builtin parameters and return value ----

    #[inline]
    pub fn parm_float(&self, n: usize) -> f32 {
        self.g_float(ofs_parm(n))
    }

    #[inline]
    pub fn parm_vector(&self, n: usize) -> Vec3 {
        self.g_vector(ofs_parm(n))
    }

    #[inline]
    pub fn parm_edict(&self, n: usize) -> usize {
        self.g_edict(ofs_parm(n))
    }

    #[inline]
    pub fn parm_string(&self, n: usize) -> String {
        self.g_string(ofs_parm(n))
    }

    #[inline]
    pub fn parm_int(&self, n: usize) -> i32 {
        self.g_int(ofs_parm(n))
    }

    #[inline]
    pub fn return_float(&mut self, v: f32) {
        self.set_g_float(OFS_RETURN, v);
    }

    #[inline]
    pub fn return_vector(&mut self, v: &Vec3) {
        self.set_g_vector(OFS_RETURN, v);
    }

    #[inline]
    pub fn return_edict(&mut self, e: usize) {
        self.set_g_edict(OFS_RETURN, e);
    }

    #[inline]
    pub fn return_string(&mut self, s: i32) {
        self.set_g_string(OFS_RETURN, s);
    }

    /// Spawn parms parm1..parm16.
    pub fn set_spawn_parms(&mut self, parms: &[f32]) {
        for (i, p) in parms.iter().enumerate() {
            self.set_g_float(gv::PARM1 + i, *p);
        }
    }

    pub fn spawn_parms(&self, out: &mut [f32]) {
        for (i, p) in out.iter_mut().enumerate() {
            *p = self.g_float(gv::PARM1 + i);
        }
    }
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

// ============================================================
// In-memory program builder for tests
// ============================================================
