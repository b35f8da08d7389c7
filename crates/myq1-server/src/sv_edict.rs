// sv_edict.rs — entity dictionary
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.
//
// Every edict carries one array of register cells. Offsets below
// ENTVARS_SIZE are the built-in fields the engine touches directly; the
// rest belong to the gameplay program and are reached only by offset.

use myq1_common::common::{com_dprintf, com_printf};
use myq1_common::q_shared::*;
use myq1_common::qcommon::EntityState;

use crate::pr_exec::VmError;
use crate::progs::{ev, gv, Cell, Def, Etype, ENTVARS_SIZE};
use crate::server::*;

#[derive(Debug, Clone)]
pub struct Edict {
    pub free: bool,
    pub freetime: f64, // sv.time when the object was freed

    pub num_leafs: usize,
    pub leafnums: [i16; MAX_ENT_LEAFS],

    pub baseline: EntityState,

    /// Field cells, `entityfields` of them.
    pub v: Vec<Cell>,
}

impl Edict {
    pub fn new(entityfields: usize) -> Self {
        Self {
            free: false,
            freetime: 0.0,
            num_leafs: 0,
            leafnums: [0; MAX_ENT_LEAFS],
            baseline: EntityState::default(),
            v: vec![Cell::default(); entityfields.max(ENTVARS_SIZE)],
        }
    }

    /// Wipe every field, including the program's own.
    pub fn clear(&mut self) {
        self.v.iter_mut().for_each(|c| *c = Cell::default());
        self.free = false;
    }

    #[inline]
    pub fn float(&self, ofs: usize) -> f32 {
        self.v[ofs].as_float()
    }

    #[inline]
    pub fn set_float(&mut self, ofs: usize, f: f32) {
        self.v[ofs] = Cell::Float(f);
    }

    #[inline]
    pub fn vector(&self, ofs: usize) -> Vec3 {
        [self.v[ofs].as_float(), self.v[ofs + 1].as_float(), self.v[ofs + 2].as_float()]
    }

    #[inline]
    pub fn set_vector(&mut self, ofs: usize, v: &Vec3) {
        for i in 0..3 {
            self.v[ofs + i] = Cell::Float(v[i]);
        }
    }

    #[inline]
    pub fn int(&self, ofs: usize) -> i32 {
        self.v[ofs].as_int()
    }

    /// Edict number stored in an entity field.
    #[inline]
    pub fn entity(&self, ofs: usize) -> usize {
        self.v[ofs].as_int().max(0) as usize
    }

    #[inline]
    pub fn set_entity(&mut self, ofs: usize, e: usize) {
        self.v[ofs] = Cell::Entity(e as i32);
    }

    #[inline]
    pub fn string(&self, ofs: usize) -> i32 {
        self.v[ofs].as_int()
    }

    #[inline]
    pub fn set_string(&mut self, ofs: usize, s: i32) {
        self.v[ofs] = Cell::String(s);
    }

    #[inline]
    pub fn function(&self, ofs: usize) -> i32 {
        self.v[ofs].as_int()
    }

    #[inline]
    pub fn set_function(&mut self, ofs: usize, f: i32) {
        self.v[ofs] = Cell::Function(f);
    }

    pub fn origin(&self) -> Vec3 {
        self.vector(ev::ORIGIN)
    }

    pub fn solid(&self) -> i32 {
        self.float(ev::SOLID) as i32
    }

    pub fn movetype(&self) -> i32 {
        self.float(ev::MOVETYPE) as i32
    }
}

impl ServerContext {
    /// Either finds a free edict, or allocates a new one.
    ///
    /// Slots freed within the last half second are skipped so a client
    /// doesn't mistake a new entity for the one it is still interpolating;
    /// the first two seconds of a level are exempt.
    pub fn ed_alloc(&mut self) -> Result<usize, crate::server::HostError> {
        let first = self.svs.maxclients + 1;
        let time = self.sv.time;
        for i in first..self.sv.edicts.len() {
            let e = &self.sv.edicts[i];
            if e.free && (e.freetime < 2.0 || time - e.freetime > 0.5) {
                self.sv.edicts[i].clear();
                return Ok(i);
            }
        }

        if self.sv.edicts.len() >= self.sv.max_edicts {
            return Err(HostError::NoFreeEdicts);
        }
        self.sv.edicts.push(Edict::new(self.pr.entityfields()));
        Ok(self.sv.edicts.len() - 1)
    }

    /// Marks the edict as free.
    ///
    /// The key fields are cleared now so same-frame readers see an inert
    /// entity; the rest is wiped when the slot is handed out again.
    pub fn ed_free(&mut self, e: usize) {
        if e == 0 {
            log::warn!("ED_Free: tried to free the world");
            return;
        }
        self.unlink_edict(e);

        let time = self.sv.time;
        let ed = &mut self.sv.edicts[e];
        ed.free = true;
        ed.set_string(ev::MODEL, 0);
        ed.set_float(ev::TAKEDAMAGE, 0.0);
        ed.set_float(ev::MODELINDEX, 0.0);
        ed.set_float(ev::COLORMAP, 0.0);
        ed.set_float(ev::SKIN, 0.0);
        ed.set_float(ev::FRAME, 0.0);
        ed.set_vector(ev::ORIGIN, &VEC3_ORIGIN);
        ed.set_vector(ev::ANGLES, &VEC3_ORIGIN);
        ed.set_float(ev::NEXTTHINK, -1.0);
        ed.set_float(ev::SOLID, 0.0);
        ed.freetime = time;
    }

    /// Next entity after `e` that is in use, searching by a string field.
    pub fn ed_find_string(&self, start: usize, field: usize, value: &str) -> Option<usize> {
        (start + 1..self.sv.edicts.len()).find(|&e| {
            let ed = &self.sv.edicts[e];
            !ed.free && {
                let s = ed.string(field);
                s != 0 && self.pr.get_string(s) == value
            }
        })
    }

    /// Next entity after `e` that is in use, or the world when none is.
    pub fn next_ent(&self, e: usize) -> usize {
        (e + 1..self.sv.edicts.len())
            .find(|&i| !self.sv.edicts[i].free)
            .unwrap_or(0)
    }

    /// Entities with a solid type whose centers lie within `radius` of `org`.
    pub fn find_radius(&self, org: &Vec3, radius: f32) -> Vec<usize> {
        (1..self.sv.edicts.len())
            .filter(|&e| {
                let ed = &self.sv.edicts[e];
                if ed.free || ed.solid() == SOLID_NOT {
                    return false;
                }
                let origin = ed.origin();
                let mins = ed.vector(ev::MINS);
                let maxs = ed.vector(ev::MAXS);
                let mut eorg = [0.0; 3];
                for j in 0..3 {
                    eorg[j] = org[j] - (origin[j] + (mins[j] + maxs[j]) * 0.5);
                }
                vector_length(&eorg) <= radius
            })
            .collect()
    }

    // ============================================================
    // Printing
    // ============================================================

    /// Text for a value of the given type, as read from `cells`.
    pub fn value_string(&self, etype: Etype, cells: &[Cell]) -> String {
        let c = cells.first().copied().unwrap_or_default();
        match etype {
            Etype::String => self.pr.get_string(c.as_int()).into_owned(),
            Etype::Entity => format!("entity {}", c.as_int()),
            Etype::Function => format!("{}()", self.pr.dat.function_name(c.as_int().max(0) as usize)),
            Etype::Field => match self.pr.dat.field_at_ofs(c.as_int().max(0) as usize) {
                Some(def) => format!(".{}", self.pr.dat.string_at(def.s_name)),
                None => format!(".{}", c.as_int()),
            },
            Etype::Void => "void".to_string(),
            Etype::Float => format!("{:5.1}", c.as_float()),
            Etype::Vector => {
                let f = |i: usize| cells.get(i).copied().unwrap_or_default().as_float();
                format!("'{:5.1} {:5.1} {:5.1}'", f(0), f(1), f(2))
            }
            Etype::Pointer => "pointer".to_string(),
        }
    }

    /// Dump an edict's non-zero fields.
    pub fn ed_print(&self, e: usize) -> String {
        let Some(ed) = self.sv.edicts.get(e) else {
            return format!("edict {} out of range\n", e);
        };
        if ed.free {
            return "FREE\n".to_string();
        }
        let mut out = format!("\nEDICT {}:\n", e);
        for def in &self.pr.dat.fielddefs {
            let name = self.pr.dat.string_at(def.s_name);
            // skip _x, _y, _z vars
            if name.len() > 2 && name.as_bytes()[name.len() - 2] == b'_' {
                continue;
            }
            let Some(etype) = def.etype() else { continue };
            let ofs = def.ofs as usize;
            let width = etype.width();
            let Some(cells) = ed.v.get(ofs..ofs + width) else { continue };
            if cells.iter().all(|c| c.is_zero()) {
                continue;
            }
            out.push_str(&format!("{:<15}{}\n", name, self.value_string(etype, cells)));
        }
        out
    }

    // ============================================================
    // Parsing
    // ============================================================

    /// Copy a string for the program, turning `\n` escapes into newlines.
    pub fn ed_new_string(&mut self, s: &str) -> i32 {
        let mut out = String::with_capacity(s.len());
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if chars.peek() == Some(&'n') {
                    chars.next();
                    out.push('\n');
                } else {
                    out.push('\\');
                }
            } else {
                out.push(c);
            }
        }
        self.pr.new_string(&out)
    }

    /// Parse `value` by the def's type into `cells`.
    /// Returns false for an unknown field or function name.
    fn parse_epair(&mut self, cells: Target, def: &Def, value: &str) -> bool {
        let Some(etype) = def.etype() else { return false };
        let ofs = def.ofs as usize;
        let mut put = |ctx: &mut Self, i: usize, c: Cell| match cells {
            Target::Global => ctx.pr.globals[ofs + i] = c,
            Target::Edict(e) => ctx.sv.edicts[e].v[ofs + i] = c,
        };

        match etype {
            Etype::String => {
                let s = self.ed_new_string(value);
                put(self, 0, Cell::String(s));
            }
            Etype::Float => put(self, 0, Cell::Float(atof(value))),
            Etype::Vector => {
                let mut parts = value.split_whitespace();
                for i in 0..3 {
                    put(self, i, Cell::Float(parts.next().map_or(0.0, atof)));
                }
            }
            Etype::Entity => put(self, 0, Cell::Entity(atof(value) as i32)),
            Etype::Field => {
                let Some(f) = self.pr.dat.find_field(value) else {
                    com_printf(&format!("Can't find field {}\n", value));
                    return false;
                };
                let f = f.ofs as i32;
                put(self, 0, Cell::Int(f));
            }
            Etype::Function => {
                let Some(f) = self.pr.dat.find_function(value) else {
                    com_printf(&format!("Can't find function {}\n", value));
                    return false;
                };
                put(self, 0, Cell::Function(f as i32));
            }
            Etype::Void | Etype::Pointer => {}
        }
        true
    }

    /// Parse a `{ "key" "value" ... }` block of globals.
    pub fn ed_parse_global<'a>(&mut self, data: &'a str) -> Result<&'a str, crate::server::HostError> {
        let mut data = data;
        loop {
            let (keyname, rest) = com_parse(data);
            let Some(rest) = rest else {
                return Err(HostError::Fatal("ED_ParseGlobals: EOF without closing brace".into()));
            };
            data = rest;
            if keyname.starts_with('}') {
                break;
            }

            let (value, rest) = com_parse(data);
            let Some(rest) = rest else {
                return Err(HostError::Fatal("ED_ParseGlobals: EOF without closing brace".into()));
            };
            data = rest;
            if value.starts_with('}') {
                return Err(HostError::Fatal("ED_ParseGlobals: closing brace without data".into()));
            }

            let Some(def) = self.pr.dat.find_global(&keyname).copied() else {
                com_printf(&format!("'{}' is not a global\n", keyname));
                continue;
            };
            if !self.parse_epair(Target::Global, &def, &value) {
                return Err(HostError::Fatal("ED_ParseGlobals: parse error".into()));
            }
        }
        Ok(data)
    }

    /// Parse the fields of one entity block (after the opening brace) into
    /// edict `e`. An empty block frees the edict.
    pub fn ed_parse_edict<'a>(&mut self, data: &'a str, e: usize) -> Result<&'a str, crate::server::HostError> {
        let mut data = data;
        let mut init = false;

        // clear it
        if e != 0 {
            self.sv.edicts[e].clear();
        }

        loop {
            let (mut keyname, rest) = com_parse(data);
            let Some(rest) = rest else {
                return Err(HostError::Fatal("ED_ParseEntity: EOF without closing brace".into()));
            };
            data = rest;
            if keyname.starts_with('}') {
                break;
            }

            // anglehack is to allow QuakeEd to write single scalar angles
            // and allow them to be turned into vectors
            let anglehack = keyname == "angle";
            if anglehack {
                keyname = "angles".to_string();
            }
            // FIXME: change light to _light to get rid of this hack
            if keyname == "light" {
                keyname = "light_lev".to_string();
            }
            let keyname = keyname.trim_end().to_string();

            let (value, rest) = com_parse(data);
            let Some(rest) = rest else {
                return Err(HostError::Fatal("ED_ParseEntity: EOF without closing brace".into()));
            };
            data = rest;
            if value.starts_with('}') {
                return Err(HostError::Fatal("ED_ParseEntity: closing brace without data".into()));
            }

            init = true;

            // keynames with a leading underscore are used for utility comments,
            // and are immediately discarded by quake
            if keyname.starts_with('_') {
                continue;
            }

            let Some(key) = self.pr.dat.find_field(&keyname).copied() else {
                com_dprintf(&format!("'{}' is not a field\n", keyname));
                continue;
            };

            let value = if anglehack { format!("0 {} 0", value) } else { value };
            if !self.parse_epair(Target::Edict(e), &key, &value) {
                return Err(HostError::Fatal("ED_ParseEdict: parse error".into()));
            }
        }

        if !init {
            self.sv.edicts[e].free = true;
        }
        Ok(data)
    }

    /// Spawn every entity in the map's entity text.
    ///
    /// The first block is the world. Entities excluded by the current skill
    /// or deathmatch setting are dropped, then the spawn function named by
    /// `classname` runs with `self` set to the new entity. A script fault
    /// in one spawn function does not stop the rest.
    pub fn ed_load_from_file(&mut self, data: &str) -> Result<(), crate::server::HostError> {
        let mut data = data;
        let mut ent: Option<usize> = None;
        let mut inhibit = 0;

        self.pr.set_g_float(gv::TIME, self.sv.time as f32);

        let skill = (self.cvar("skill") + 0.5).floor().clamp(0.0, 3.0) as i32;
        let deathmatch = self.cvar("deathmatch") != 0.0;

        loop {
            let (token, rest) = com_parse(data);
            let Some(rest) = rest else { break };
            data = rest;
            if token != "{" {
                return Err(HostError::Fatal(format!(
                    "ED_LoadFromFile: found {} when expecting {{",
                    token
                )));
            }

            let e = match ent {
                None => 0,
                Some(_) => self.ed_alloc()?,
            };
            ent = Some(e);
            data = self.ed_parse_edict(data, e)?;

            // remove things from different skill levels or deathmatch
            let spawnflags = self.sv.edicts[e].float(ev::SPAWNFLAGS) as i32;
            let inhibited = if deathmatch {
                spawnflags & SPAWNFLAG_NOT_DEATHMATCH != 0
            } else {
                (skill == 0 && spawnflags & SPAWNFLAG_NOT_EASY != 0)
                    || (skill == 1 && spawnflags & SPAWNFLAG_NOT_MEDIUM != 0)
                    || (skill >= 2 && spawnflags & SPAWNFLAG_NOT_HARD != 0)
            };
            if inhibited {
                self.ed_free(e);
                inhibit += 1;
                continue;
            }

            // immediately call spawn function
            let classname = self.sv.edicts[e].string(ev::CLASSNAME);
            if classname == 0 {
                com_printf(&format!("No classname for:{}", self.ed_print(e)));
                self.ed_free(e);
                continue;
            }

            let name = self.pr.get_string(classname).into_owned();
            let Some(func) = self.pr.dat.find_function(&name) else {
                com_printf(&format!("No spawn function for:{}", self.ed_print(e)));
                self.ed_free(e);
                continue;
            };

            self.pr.set_g_edict(gv::SELF, e);
            let result = self.execute_program(func as i32);
            self.contain_fault(result)?;
        }

        com_dprintf(&format!("{} entities inhibited\n", inhibit));
        Ok(())
    }

    /// Log a recoverable script fault and drop the call chain it broke.
    /// Anything fatal is handed back to the caller.
    pub fn contain_fault(&mut self, result: Result<(), VmError>) -> Result<(), crate::server::HostError> {
        match result {
            Ok(()) => Ok(()),
            Err(VmError::Fault { function, fault }) => {
                log::error!("script fault in {} ignored: {}", function, fault);
                self.pr.reset_stack();
                Ok(())
            }
            Err(VmError::Host(e)) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Global,
    Edict(usize),
}

/// Leading float of a string, 0 if there is none.
pub fn atof(s: &str) -> f32 {
    let s = s.trim();
    if let Ok(v) = s.parse::<f32>() {
        return v;
    }
    // longest numeric prefix
    let end = s
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '-' || *c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    s[..end].parse::<f32>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use assert_approx_eq::assert_approx_eq;

    fn base_builder() -> ProgsBuilder {
        let mut b = ProgsBuilder::new();
        b.builtin_field("classname", 1, ev::CLASSNAME);
        b.builtin_field("origin", 3, ev::ORIGIN);
        b.builtin_field("origin_x", 2, ev::ORIGIN);
        b.builtin_field("angles", 3, ev::ANGLES);
        b.builtin_field("spawnflags", 2, ev::SPAWNFLAGS);
        b.builtin_field("health", 2, ev::HEALTH);
        b.builtin_field("message", 1, ev::MESSAGE);
        b
    }

    #[test]
    fn test_alloc_never_returns_world_or_client_slots() {
        let mut ctx = context_with(&ProgsBuilder::new());
        let e = ctx.ed_alloc().unwrap();
        assert_eq!(e, 2);
        let f = ctx.ed_alloc().unwrap();
        assert_ne!(e, f);
    }

    #[test]
    fn test_recently_freed_slots_are_not_reused() {
        let mut ctx = context_with(&ProgsBuilder::new());
        ctx.sv.time = 10.0;
        let ents: Vec<usize> = (0..8).map(|_| ctx.ed_alloc().unwrap()).collect();

        // free every other one, the first half a second ago
        ctx.sv.time = 10.0;
        ctx.ed_free(ents[0]);
        ctx.sv.time = 10.4;
        for e in ents.iter().skip(2).step_by(2) {
            ctx.ed_free(*e);
        }

        ctx.sv.time = 10.6;
        let again: Vec<usize> = (0..4).map(|_| ctx.ed_alloc().unwrap()).collect();
        assert_eq!(again[0], ents[0], "the stale slot is reused");
        for e in &again[1..] {
            assert!(!ents.contains(e), "slot {} freed under 0.5s ago was reused", e);
        }
    }

    #[test]
    fn test_early_level_frees_reuse_immediately() {
        let mut ctx = context_with(&ProgsBuilder::new());
        ctx.sv.time = 1.0;
        let e = ctx.ed_alloc().unwrap();
        ctx.ed_free(e);
        assert_eq!(ctx.ed_alloc().unwrap(), e);
    }

    #[test]
    fn test_alloc_exhaustion_is_fatal() {
        let mut ctx = context_with(&ProgsBuilder::new());
        ctx.sv.max_edicts = 4;
        ctx.ed_alloc().unwrap();
        ctx.ed_alloc().unwrap();
        assert!(matches!(ctx.ed_alloc(), Err(HostError::NoFreeEdicts)));
    }

    #[test]
    fn test_reuse_clears_program_fields() {
        let mut b = ProgsBuilder::new();
        let custom = b.field("custom", 2);
        let mut ctx = context_with(&b);
        let e = ctx.ed_alloc().unwrap();
        ctx.edict_mut(e).set_float(custom, 7.0);
        ctx.ed_free(e);
        assert_eq!(ctx.edict(e).float(custom), 7.0, "only key fields clear on free");
        assert_eq!(ctx.edict(e).float(ev::NEXTTHINK), -1.0);
        let again = ctx.ed_alloc().unwrap();
        assert_eq!(again, e);
        assert_eq!(ctx.edict(e).float(custom), 0.0);
    }

    #[test]
    fn test_parse_edict_fields() {
        let mut ctx = context_with(&base_builder());
        let e = ctx.ed_alloc().unwrap();
        let text = "\"classname\" \"info_null\"\n\"origin\" \"1 2 3\"\n\"angle\" \"90\"\n\"_comment\" \"x\"\n\"message\" \"a\\nb\"\n}";
        let rest = ctx.ed_parse_edict(text, e).unwrap();
        assert!(rest.trim().is_empty());
        let ed = ctx.edict(e);
        assert_eq!(ctx.pr.get_string(ed.string(ev::CLASSNAME)), "info_null");
        assert_eq!(ed.origin(), [1.0, 2.0, 3.0]);
        assert_approx_eq!(ed.vector(ev::ANGLES)[1], 90.0);
        assert_eq!(ctx.pr.get_string(ed.string(ev::MESSAGE)), "a\nb");
    }

    #[test]
    fn test_parse_edict_missing_brace() {
        let mut ctx = context_with(&base_builder());
        let e = ctx.ed_alloc().unwrap();
        assert!(ctx.ed_parse_edict("\"classname\" \"x\"", e).is_err());
    }

    #[test]
    fn test_load_from_file_spawns_and_inhibits() {
        let mut b = base_builder();
        b.function("worldspawn", 0, 0, 0);
        b.op(crate::progs::Opcode::DONE, 0, 0, 0);
        b.function("info_thing", 0, 0, 0);
        b.op(crate::progs::Opcode::DONE, 0, 0, 0);
        let mut ctx = context_with(&b);
        ctx.cvars.set("skill", "0");
        let text = r#"
{ "classname" "worldspawn" }
{ "classname" "info_thing" "origin" "0 0 8" }
{ "classname" "info_thing" "spawnflags" "256" }
{ "classname" "no_such_thing" }
"#;
        ctx.ed_load_from_file(text).unwrap();
        let live: Vec<usize> = (2..ctx.sv.num_edicts()).filter(|&e| !ctx.edict(e).free).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(ctx.edict(live[0]).origin(), [0.0, 0.0, 8.0]);
        assert_eq!(ctx.pr.get_string(ctx.edict(0).string(ev::CLASSNAME)), "worldspawn");
        assert!(!ctx.edict(0).free);
    }

    #[test]
    fn test_ed_print_skips_zero_and_components() {
        let mut ctx = context_with(&base_builder());
        let e = ctx.ed_alloc().unwrap();
        ctx.edict_mut(e).set_float(ev::HEALTH, 25.0);
        ctx.edict_mut(e).set_vector(ev::ORIGIN, &[1.0, 0.0, 0.0]);
        let text = ctx.ed_print(e);
        assert!(text.contains("health"));
        assert!(text.contains(" 25.0"));
        assert!(text.contains("origin"));
        assert!(!text.contains("origin_x"));
        assert!(!text.contains("spawnflags"));
    }

    #[test]
    fn test_find_and_nextent() {
        let mut ctx = context_with(&base_builder());
        let a = ctx.ed_alloc().unwrap();
        let b = ctx.ed_alloc().unwrap();
        let s = ctx.pr.new_string("light");
        ctx.edict_mut(b).set_string(ev::CLASSNAME, s);
        assert_eq!(ctx.ed_find_string(0, ev::CLASSNAME, "light"), Some(b));
        assert_eq!(ctx.ed_find_string(b, ev::CLASSNAME, "light"), None);
        assert_eq!(ctx.next_ent(a), b);
        assert_eq!(ctx.next_ent(b), 0);
    }

    #[test]
    fn test_atof_prefix() {
        assert_eq!(atof("12.5"), 12.5);
        assert_eq!(atof(" -3"), -3.0);
        assert_eq!(atof("7abc"), 7.0);
        assert_eq!(atof("abc"), 0.0);
    }
}
