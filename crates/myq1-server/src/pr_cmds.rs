// pr_cmds.rs — builtin functions callable from the gameplay program
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.
//
// Builtins take their arguments from the parameter globals and leave a
// result in OFS_RETURN. Their numbers are compiled into the program, so
// an entry may be added at the end of BUILTINS but never moved.

use myq1_common::common::*;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::pr_exec::{VmError, VmFault};
use crate::progs::*;
use crate::server::*;
use crate::sv_world::MOVE_NORMAL;

pub type BuiltinFn = fn(&mut ServerContext) -> Result<(), VmError>;

/// One slot of the builtin table. Slots without a function fault when
/// called.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: Option<BuiltinFn>,
}

const fn bi(name: &'static str, func: BuiltinFn) -> Builtin {
    Builtin { name, func: Some(func) }
}

const FIXME: Builtin = Builtin { name: "Fixme", func: None };

// message destinations for the Write* builtins
pub const MSG_BROADCAST: i32 = 0; // unreliable to all
pub const MSG_ONE: i32 = 1; // reliable to one (msg_entity)
pub const MSG_ALL: i32 = 2; // reliable to all
pub const MSG_INIT: i32 = 3; // write to the init string

pub const BUILTINS: &[Builtin] = &[
    FIXME,
    bi("makevectors", pf_makevectors), // void(entity e) makevectors = #1
    bi("setorigin", pf_setorigin),     // void(entity e, vector o) setorigin = #2
    bi("setmodel", pf_setmodel),       // void(entity e, string m) setmodel = #3
    bi("setsize", pf_setsize),         // void(entity e, vector min, vector max) setsize = #4
    FIXME,                             // void(entity e, vector min, vector max) setabssize = #5
    bi("break", pf_break),             // void() break = #6
    bi("random", pf_random),           // float() random = #7
    bi("sound", pf_sound),             // void(entity e, float chan, string samp) sound = #8
    bi("normalize", pf_normalize),     // vector(vector v) normalize = #9
    bi("error", pf_error),             // void(string e) error = #10
    bi("objerror", pf_objerror),       // void(string e) objerror = #11
    bi("vlen", pf_vlen),               // float(vector v) vlen = #12
    bi("vectoyaw", pf_vectoyaw),       // float(vector v) vectoyaw = #13
    bi("spawn", pf_spawn),             // entity() spawn = #14
    bi("remove", pf_remove),           // void(entity e) remove = #15
    bi("traceline", pf_traceline),     // float(vector v1, vector v2, float tryents) traceline = #16
    bi("checkclient", pf_checkclient), // entity() clientlist = #17
    bi("find", pf_find),               // entity(entity start, .string fld, string match) find = #18
    bi("precache_sound", pf_precache_sound), // void(string s) precache_sound = #19
    bi("precache_model", pf_precache_model), // void(string s) precache_model = #20
    bi("stuffcmd", pf_stuffcmd),       // void(entity client, string s) stuffcmd = #21
    bi("findradius", pf_findradius),   // entity(vector org, float rad) findradius = #22
    bi("bprint", pf_bprint),           // void(string s) bprint = #23
    bi("sprint", pf_sprint),           // void(entity client, string s) sprint = #24
    bi("dprint", pf_dprint),           // void(string s) dprint = #25
    bi("ftos", pf_ftos),               // void(string s) ftos = #26
    bi("vtos", pf_vtos),               // void(string s) vtos = #27
    bi("coredump", pf_coredump),
    bi("traceon", pf_traceon),
    bi("traceoff", pf_traceoff),
    bi("eprint", pf_eprint),           // void(entity e) debug print an entire entity
    bi("walkmove", pf_walkmove),       // float(float yaw, float dist) walkmove
    FIXME,                             // float(float yaw, float dist) walkmove
    bi("droptofloor", pf_droptofloor),
    bi("lightstyle", pf_lightstyle),
    bi("rint", pf_rint),
    bi("floor", pf_floor),
    bi("ceil", pf_ceil),
    FIXME,
    bi("checkbottom", pf_checkbottom),
    bi("pointcontents", pf_pointcontents),
    FIXME,
    bi("fabs", pf_fabs),
    bi("aim", pf_aim),
    bi("cvar", pf_cvar),
    bi("localcmd", pf_localcmd),
    bi("nextent", pf_nextent),
    bi("particle", pf_particle),
    bi("changeyaw", pf_changeyaw),
    FIXME,
    bi("vectoangles", pf_vectoangles),
    bi("WriteByte", pf_write_byte),
    bi("WriteChar", pf_write_char),
    bi("WriteShort", pf_write_short),
    bi("WriteLong", pf_write_long),
    bi("WriteCoord", pf_write_coord),
    bi("WriteAngle", pf_write_angle),
    bi("WriteString", pf_write_string),
    bi("WriteEntity", pf_write_entity),
    FIXME,
    FIXME,
    FIXME,
    FIXME,
    FIXME,
    FIXME,
    FIXME,
    bi("movetogoal", pf_movetogoal),
    bi("precache_file", pf_precache_file),
    bi("makestatic", pf_makestatic),
    bi("changelevel", pf_changelevel),
    FIXME,
    bi("cvar_set", pf_cvar_set),
    bi("centerprint", pf_centerprint),
    bi("ambientsound", pf_ambientsound),
    bi("precache_model2", pf_precache_model),
    bi("precache_sound2", pf_precache_sound), // precache_sound2 is different only for qcc
    bi("precache_file2", pf_precache_file),
    bi("setspawnparms", pf_setspawnparms),
];

// ============================================================
// Helpers
// ============================================================

/// Concatenate the string parameters from `first` on.
fn var_string(ctx: &ServerContext, first: usize) -> String {
    (first..ctx.pr.argc.min(MAX_PARMS))
        .map(|i| ctx.pr.parm_string(i))
        .collect()
}

fn fault(ctx: &ServerContext, msg: impl Into<String>) -> VmError {
    ctx.run_error(VmFault::Script(msg.into()))
}

/// Edict parameter `n`, checked against the live edict count.
fn parm_edict_checked(ctx: &ServerContext, n: usize) -> Result<usize, VmError> {
    let e = ctx.pr.parm_int(n);
    match usize::try_from(e) {
        Ok(e) if e < ctx.sv.num_edicts() => Ok(e),
        _ => Err(ctx.run_error(VmFault::BadEntity(e))),
    }
}

/// Client slot of a client edict parameter.
fn parm_client(ctx: &ServerContext, n: usize) -> Result<Option<usize>, VmError> {
    let e = parm_edict_checked(ctx, n)?;
    Ok(ctx
        .edict_client(e)
        .filter(|&c| ctx.svs.client(c).is_some()))
}

fn set_min_max_size(ctx: &mut ServerContext, e: usize, min: &Vec3, max: &Vec3) -> Result<(), VmError> {
    if (0..3).any(|i| min[i] > max[i]) {
        return Err(fault(ctx, "backwards mins/maxs"));
    }

    // set derived values
    let size = vector_subtract(max, min);
    let ed = ctx.edict_mut(e);
    ed.set_vector(ev::MINS, min);
    ed.set_vector(ev::MAXS, max);
    ed.set_vector(ev::SIZE, &size);

    ctx.link_edict(e, false)
}

// ============================================================
// Vector math
// ============================================================

/// Writes new values for v_forward, v_up, and v_right based on angles.
fn pf_makevectors(ctx: &mut ServerContext) -> Result<(), VmError> {
    let (forward, right, up) = angle_vectors(&ctx.pr.parm_vector(0));
    ctx.pr.set_g_vector(gv::V_FORWARD, &forward);
    ctx.pr.set_g_vector(gv::V_RIGHT, &right);
    ctx.pr.set_g_vector(gv::V_UP, &up);
    Ok(())
}

fn pf_normalize(ctx: &mut ServerContext) -> Result<(), VmError> {
    let mut v = ctx.pr.parm_vector(0);
    vector_normalize(&mut v);
    ctx.pr.return_vector(&v);
    Ok(())
}

fn pf_vlen(ctx: &mut ServerContext) -> Result<(), VmError> {
    let len = vector_length(&ctx.pr.parm_vector(0));
    ctx.pr.return_float(len);
    Ok(())
}

fn pf_vectoyaw(ctx: &mut ServerContext) -> Result<(), VmError> {
    let yaw = vectoyaw(&ctx.pr.parm_vector(0));
    ctx.pr.return_float(yaw);
    Ok(())
}

fn pf_vectoangles(ctx: &mut ServerContext) -> Result<(), VmError> {
    let angles = vectoangles(&ctx.pr.parm_vector(0));
    ctx.pr.return_vector(&angles);
    Ok(())
}

/// Returns a number from 0 <= num <= 1.
fn pf_random(ctx: &mut ServerContext) -> Result<(), VmError> {
    let num = (rand::random::<u16>() & 0x7fff) as f32 / 0x7fff as f32;
    ctx.pr.return_float(num);
    Ok(())
}

fn pf_rint(ctx: &mut ServerContext) -> Result<(), VmError> {
    let f = ctx.pr.parm_float(0);
    let r = if f > 0.0 { (f + 0.5) as i32 } else { (f - 0.5) as i32 };
    ctx.pr.return_float(r as f32);
    Ok(())
}

fn pf_floor(ctx: &mut ServerContext) -> Result<(), VmError> {
    let f = ctx.pr.parm_float(0).floor();
    ctx.pr.return_float(f);
    Ok(())
}

fn pf_ceil(ctx: &mut ServerContext) -> Result<(), VmError> {
    let f = ctx.pr.parm_float(0).ceil();
    ctx.pr.return_float(f);
    Ok(())
}

fn pf_fabs(ctx: &mut ServerContext) -> Result<(), VmError> {
    let f = ctx.pr.parm_float(0).abs();
    ctx.pr.return_float(f);
    Ok(())
}

// ============================================================
// Entity setup
// ============================================================

/// This is the only valid way to move an object without using the physics
/// of the world (setting velocity and waiting). Directly changing origin
/// will not set internal links correctly, so clipping would be messed up.
fn pf_setorigin(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    let org = ctx.pr.parm_vector(1);
    ctx.edict_mut(e).set_vector(ev::ORIGIN, &org);
    ctx.link_edict(e, false)
}

/// The size box is rotated by the current angle.
fn pf_setsize(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    let min = ctx.pr.parm_vector(1);
    let max = ctx.pr.parm_vector(2);
    set_min_max_size(ctx, e, &min, &max)
}

fn pf_setmodel(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    let m_id = ctx.pr.parm_int(1);
    let m = ctx.pr.get_string(m_id).into_owned();

    // check to see if model was properly precached
    let Some(i) = ctx.sv.model_precache.iter().position(|p| *p == m) else {
        return Err(fault(ctx, format!("no precache: {}", m)));
    };

    let ed = ctx.edict_mut(e);
    ed.set_string(ev::MODEL, m_id);
    ed.set_float(ev::MODELINDEX, i as f32);

    let (mins, maxs) = match ctx.model(i) {
        Some(model) => (model.mins(), model.maxs()),
        None => (VEC3_ORIGIN, VEC3_ORIGIN),
    };
    set_min_max_size(ctx, e, &mins, &maxs)
}

fn pf_spawn(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = ctx.ed_alloc()?;
    ctx.pr.return_edict(e);
    Ok(())
}

fn pf_remove(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    ctx.ed_free(e);
    Ok(())
}

/// Make this static to prevent it from being sent over the network each
/// frame. It goes into the signon and the edict is freed.
fn pf_makestatic(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    let ed = ctx.edict(e);
    let model = ctx.pr.get_string(ed.string(ev::MODEL)).into_owned();
    let modelindex = ctx.model_index(&model);
    let (frame, colormap, skin) = (ed.float(ev::FRAME), ed.float(ev::COLORMAP), ed.float(ev::SKIN));
    let (origin, angles) = (ed.origin(), ed.vector(ev::ANGLES));

    let msg = &mut ctx.sv.signon;
    msg_write_byte(msg, SVC_SPAWNSTATIC as i32);
    msg_write_byte(msg, modelindex as i32);
    msg_write_byte(msg, frame as i32);
    msg_write_byte(msg, colormap as i32);
    msg_write_byte(msg, skin as i32);
    for i in 0..3 {
        msg_write_coord(msg, origin[i]);
        msg_write_angle(msg, angles[i]);
    }

    // throw the entity away now
    ctx.ed_free(e);
    Ok(())
}

// ============================================================
// Precaching
// ============================================================

fn check_precache_name(ctx: &ServerContext, s: &str) -> Result<(), VmError> {
    if ctx.sv.state != ServerState::Loading {
        return Err(fault(ctx, "PF_Precache_*: Precache can only be done in spawn functions"));
    }
    if s.bytes().next().map_or(true, |b| b <= b' ') {
        return Err(fault(ctx, "Bad string"));
    }
    Ok(())
}

fn pf_precache_file(ctx: &mut ServerContext) -> Result<(), VmError> {
    // precache_file is only used to copy files with qcc, it does nothing
    let s = ctx.pr.parm_int(0);
    ctx.pr.return_string(s);
    Ok(())
}

fn pf_precache_sound(ctx: &mut ServerContext) -> Result<(), VmError> {
    let id = ctx.pr.parm_int(0);
    ctx.pr.return_string(id);
    let s = ctx.pr.get_string(id).into_owned();
    check_precache_name(ctx, &s)?;

    if ctx.sv.sound_precache.iter().any(|p| *p == s) {
        return Ok(());
    }
    if ctx.sv.sound_precache.len() >= MAX_SOUNDS {
        return Err(HostError::Overflow("PF_precache_sound".into()).into());
    }
    ctx.sv.sound_precache.push(s);
    Ok(())
}

fn pf_precache_model(ctx: &mut ServerContext) -> Result<(), VmError> {
    let id = ctx.pr.parm_int(0);
    ctx.pr.return_string(id);
    let s = ctx.pr.get_string(id).into_owned();
    check_precache_name(ctx, &s)?;

    if ctx.sv.model_precache.iter().any(|p| *p == s) {
        return Ok(());
    }
    if ctx.sv.model_precache.len() >= MAX_MODELS {
        return Err(HostError::Overflow("PF_precache_model".into()).into());
    }
    let Some(model) = ctx.assets.load_model(&s) else {
        return Err(HostError::Fatal(format!("Mod_NumForName: {} not found", s)).into());
    };
    if let ServerModel::Brush(brush) = &model {
        brush.validate().map_err(HostError::from)?;
    }
    ctx.sv.model_precache.push(s);
    ctx.sv.models.push(Some(model));
    Ok(())
}

// ============================================================
// Sound and effects
// ============================================================

/// Each entity can have eight independent sound sources, like voice,
/// weapon, feet, etc.
///
/// Channel 0 is an auto-allocate channel, the others override anything
/// already running on that entity/channel pair.
///
/// An attenuation of 0 will play full volume everywhere in the level.
/// Larger attenuations will drop off.
fn pf_sound(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    let channel = ctx.pr.parm_float(1) as i32;
    let sample = ctx.pr.parm_string(2);
    let volume = (ctx.pr.parm_float(3) * 255.0) as i32;
    let attenuation = ctx.pr.parm_float(4);
    ctx.start_sound(e, channel, &sample, volume, attenuation)
}

fn pf_ambientsound(ctx: &mut ServerContext) -> Result<(), VmError> {
    let pos = ctx.pr.parm_vector(0);
    let samp = ctx.pr.parm_string(1);
    let vol = ctx.pr.parm_float(2);
    let attenuation = ctx.pr.parm_float(3);

    // check to see if samp was properly precached
    let Some(soundnum) = ctx.sv.sound_precache.iter().position(|s| *s == samp) else {
        com_printf(&format!("no precache: {}\n", samp));
        return Ok(());
    };

    // add an svc_spawnambient command to the level signon packet
    let msg = &mut ctx.sv.signon;
    msg_write_byte(msg, SVC_SPAWNSTATICSOUND as i32);
    msg_write_pos(msg, &pos);
    msg_write_byte(msg, soundnum as i32);
    msg_write_byte(msg, (vol * 255.0) as i32);
    msg_write_byte(msg, (attenuation * 64.0) as i32);
    Ok(())
}

fn pf_particle(ctx: &mut ServerContext) -> Result<(), VmError> {
    let org = ctx.pr.parm_vector(0);
    let dir = ctx.pr.parm_vector(1);
    let color = ctx.pr.parm_float(2) as i32;
    let count = ctx.pr.parm_float(3) as i32;
    ctx.start_particle(&org, &dir, color, count);
    Ok(())
}

fn pf_lightstyle(ctx: &mut ServerContext) -> Result<(), VmError> {
    let style = ctx.pr.parm_float(0) as i32;
    let val = ctx.pr.parm_string(1);

    let Some(slot) = usize::try_from(style).ok().filter(|&s| s < MAX_LIGHTSTYLES) else {
        return Err(fault(ctx, format!("lightstyle: bad style {}", style)));
    };

    // change the string in sv
    ctx.sv.lightstyles[slot] = val.clone();

    // send message to all clients on this server
    if ctx.sv.state != ServerState::Active {
        return Ok(());
    }
    for client in ctx.svs.clients.iter_mut().flatten() {
        if client.active && client.spawned {
            msg_write_char(&mut client.message, SVC_LIGHTSTYLE as i32);
            msg_write_char(&mut client.message, style);
            msg_write_string(&mut client.message, &val);
        }
    }
    Ok(())
}

// ============================================================
// Collision queries
// ============================================================

/// Used for use tracing and shot targeting. Traces are blocked by bbox
/// and exact bsp entities, and also slide box entities if the tryents
/// flag is set.
fn pf_traceline(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v1 = ctx.pr.parm_vector(0);
    let v2 = ctx.pr.parm_vector(1);
    let nomonsters = ctx.pr.parm_float(2) as i32;
    let ent = parm_edict_checked(ctx, 3)?;

    let trace = ctx.sv_move(&v1, &VEC3_ORIGIN, &VEC3_ORIGIN, &v2, nomonsters, Some(ent))?;
    set_trace_globals(ctx, &trace);
    Ok(())
}

pub(crate) fn set_trace_globals(ctx: &mut ServerContext, trace: &Trace) {
    let pr = &mut ctx.pr;
    pr.set_g_float(gv::TRACE_ALLSOLID, trace.allsolid as i32 as f32);
    pr.set_g_float(gv::TRACE_STARTSOLID, trace.startsolid as i32 as f32);
    pr.set_g_float(gv::TRACE_FRACTION, trace.fraction);
    pr.set_g_float(gv::TRACE_INWATER, trace.inwater as i32 as f32);
    pr.set_g_float(gv::TRACE_INOPEN, trace.inopen as i32 as f32);
    pr.set_g_vector(gv::TRACE_ENDPOS, &trace.endpos);
    pr.set_g_vector(gv::TRACE_PLANE_NORMAL, &trace.plane.normal);
    pr.set_g_float(gv::TRACE_PLANE_DIST, trace.plane.dist);
    pr.set_g_edict(gv::TRACE_ENT, trace.ent.unwrap_or(0));
}

fn pf_pointcontents(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_vector(0);
    let contents = ctx.point_contents(&v);
    ctx.pr.return_float(contents as f32);
    Ok(())
}

fn pf_checkbottom(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    let on = ctx.check_bottom(e)?;
    ctx.pr.return_float(on as i32 as f32);
    Ok(())
}

/// Pick the next client to be visible to monsters and cache its PVS.
fn new_check_client(ctx: &mut ServerContext, check: usize) -> usize {
    let maxclients = ctx.svs.maxclients;

    // cycle to the next one
    let check = check.clamp(1, maxclients);
    let mut i = if check == maxclients { 1 } else { check + 1 };

    loop {
        if i == maxclients + 1 {
            i = 1;
        }
        if i == check {
            break; // didn't find anything else
        }
        if let Some(ed) = ctx.sv.edicts.get(i) {
            let flags = EdictFlags::from_bits_retain(ed.float(ev::FLAGS) as i32);
            if !ed.free && ed.float(ev::HEALTH) > 0.0 && !flags.contains(EdictFlags::NOTARGET) {
                break; // anything that is a client is a valid target
            }
        }
        i += 1;
    }

    // get the PVS for the entity
    let org = ctx.sv.edicts.get(i).map_or(VEC3_ORIGIN, |ed| {
        vector_add(&ed.origin(), &ed.vector(ev::VIEW_OFS))
    });
    let leaf = ctx.sv.worldmodel.point_in_leaf(&org);
    ctx.sv.checkpvs = ctx.sv.worldmodel.leaf_pvs(leaf);
    i
}

/// Returns a client (or object that has a client enemy) that would be a
/// valid target.
///
/// If there are more than one valid options, they are cycled each frame.
/// If (self.origin + self.viewofs) is not in the PVS of the current
/// target, it is not returned at all.
fn pf_checkclient(ctx: &mut ServerContext) -> Result<(), VmError> {
    // find a new check if on a new frame
    if ctx.sv.time - ctx.sv.lastchecktime >= 0.1 {
        ctx.sv.lastcheck = new_check_client(ctx, ctx.sv.lastcheck);
        ctx.sv.lastchecktime = ctx.sv.time;
    }

    // return check if it might be visible
    let check = ctx.sv.lastcheck;
    let visible_target = ctx
        .sv
        .edicts
        .get(check)
        .map_or(false, |ed| !ed.free && ed.float(ev::HEALTH) > 0.0);
    if !visible_target {
        ctx.pr.return_edict(0);
        return Ok(());
    }

    // if current entity can't possibly see the check entity, return 0
    let me = ctx.self_checked()?;
    let ed = ctx.edict(me);
    let view = vector_add(&ed.origin(), &ed.vector(ev::VIEW_OFS));
    let leaf = ctx.sv.worldmodel.point_in_leaf(&view) as i64 - 1;
    let in_pvs = leaf >= 0
        && ctx
            .sv
            .checkpvs
            .get((leaf >> 3) as usize)
            .map_or(false, |b| b & (1 << (leaf & 7)) != 0);
    ctx.pr.return_edict(if in_pvs { check } else { 0 });
    Ok(())
}

/// Pick a vector for the player to shoot along.
fn pf_aim(ctx: &mut ServerContext) -> Result<(), VmError> {
    let ent = parm_edict_checked(ctx, 0)?;
    let _speed = ctx.pr.parm_float(1);

    let mut start = ctx.edict(ent).origin();
    start[2] += 20.0;

    let forward = ctx.pr.g_vector(gv::V_FORWARD);
    let teamplay = ctx.cvar("teamplay") != 0.0;
    let team = ctx.edict(ent).float(ev::TEAM);

    // try sending a trace straight
    let end = vector_ma(&start, 2048.0, &forward);
    let tr = ctx.sv_move(&start, &VEC3_ORIGIN, &VEC3_ORIGIN, &end, MOVE_NORMAL, Some(ent))?;
    if let Some(hit) = tr.ent {
        let h = ctx.edict(hit);
        if h.float(ev::TAKEDAMAGE) == DAMAGE_AIM
            && (!teamplay || team <= 0.0 || team != h.float(ev::TEAM))
        {
            ctx.pr.return_vector(&forward);
            return Ok(());
        }
    }

    // try all possible entities
    let bestdir = forward;
    let mut bestdist = ctx.cvar("sv_aim");
    let mut bestent = None;

    for check in 1..ctx.sv.num_edicts() {
        let c = ctx.edict(check);
        if c.float(ev::TAKEDAMAGE) != DAMAGE_AIM || check == ent {
            continue;
        }
        if teamplay && team > 0.0 && team == c.float(ev::TEAM) {
            continue; // don't aim at teammate
        }
        let (origin, mins, maxs) = (c.origin(), c.vector(ev::MINS), c.vector(ev::MAXS));
        let mut end = [0.0; 3];
        for j in 0..3 {
            end[j] = origin[j] + 0.5 * (mins[j] + maxs[j]);
        }
        let mut dir = vector_subtract(&end, &start);
        vector_normalize(&mut dir);
        let dist = dot_product(&dir, &forward);
        if dist < bestdist {
            continue; // too far to turn
        }
        let tr = ctx.sv_move(&start, &VEC3_ORIGIN, &VEC3_ORIGIN, &end, MOVE_NORMAL, Some(ent))?;
        if tr.ent == Some(check) {
            // can shoot at this one
            bestdist = dist;
            bestent = Some(check);
        }
    }

    match bestent {
        Some(best) => {
            let dir = vector_subtract(&ctx.edict(best).origin(), &ctx.edict(ent).origin());
            let dist = dot_product(&dir, &forward);
            let mut end = vector_scale(&forward, dist);
            end[2] = dir[2];
            vector_normalize(&mut end);
            ctx.pr.return_vector(&end);
        }
        None => ctx.pr.return_vector(&bestdir),
    }
    Ok(())
}

// ============================================================
// Entity search
// ============================================================

fn pf_find(ctx: &mut ServerContext) -> Result<(), VmError> {
    let start = ctx.pr.parm_edict(0);
    let field = ctx.pr.parm_int(1);
    let s = ctx.pr.parm_int(2);
    if s == 0 {
        return Err(fault(ctx, "PF_Find: bad search string"));
    }
    let Some(field) = usize::try_from(field).ok().filter(|&f| f < ctx.pr.entityfields()) else {
        return Err(ctx.run_error(VmFault::BadField(field)));
    };
    let value = ctx.pr.get_string(s).into_owned();
    let found = ctx.ed_find_string(start, field, &value).unwrap_or(0);
    ctx.pr.return_edict(found);
    Ok(())
}

/// Returns a chain of entities that have origins within a spherical area.
fn pf_findradius(ctx: &mut ServerContext) -> Result<(), VmError> {
    let org = ctx.pr.parm_vector(0);
    let rad = ctx.pr.parm_float(1);

    let mut chain = 0;
    for e in ctx.find_radius(&org, rad) {
        ctx.edict_mut(e).set_entity(ev::CHAIN, chain);
        chain = e;
    }
    ctx.pr.return_edict(chain);
    Ok(())
}

fn pf_nextent(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = ctx.pr.parm_edict(0);
    let next = ctx.next_ent(e);
    ctx.pr.return_edict(next);
    Ok(())
}

// ============================================================
// Monster movement
// ============================================================

fn pf_walkmove(ctx: &mut ServerContext) -> Result<(), VmError> {
    let ent = ctx.self_checked()?;
    let yaw = ctx.pr.parm_float(0);
    let dist = ctx.pr.parm_float(1);

    let flags = ctx.edict_flags(ent);
    if !flags.intersects(EdictFlags::ONGROUND | EdictFlags::FLY | EdictFlags::SWIM) {
        ctx.pr.return_float(0.0);
        return Ok(());
    }

    let yaw = yaw.to_radians();
    let mv = [yaw.cos() * dist, yaw.sin() * dist, 0.0];

    // save program state, because movestep may call other progs
    let oldf = ctx.pr.xfunction;
    let oldself = ent;

    let moved = ctx.movestep(ent, &mv, true)?;

    // restore program state
    ctx.pr.xfunction = oldf;
    ctx.pr.set_g_edict(gv::SELF, oldself);
    ctx.pr.return_float(moved as i32 as f32);
    Ok(())
}

fn pf_droptofloor(ctx: &mut ServerContext) -> Result<(), VmError> {
    let ent = ctx.self_checked()?;
    let ed = ctx.edict(ent);
    let origin = ed.origin();
    let (mins, maxs) = (ed.vector(ev::MINS), ed.vector(ev::MAXS));
    let mut end = origin;
    end[2] -= 256.0;

    let trace = ctx.sv_move(&origin, &mins, &maxs, &end, MOVE_NORMAL, Some(ent))?;

    if trace.fraction == 1.0 || trace.allsolid {
        ctx.pr.return_float(0.0);
        return Ok(());
    }

    ctx.edict_mut(ent).set_vector(ev::ORIGIN, &trace.endpos);
    ctx.link_edict(ent, false)?;
    let flags = ctx.edict_flags(ent) | EdictFlags::ONGROUND;
    ctx.set_edict_flags(ent, flags);
    ctx.edict_mut(ent).set_entity(ev::GROUNDENTITY, trace.ent.unwrap_or(0));
    ctx.pr.return_float(1.0);
    Ok(())
}

fn pf_changeyaw(ctx: &mut ServerContext) -> Result<(), VmError> {
    let ent = ctx.self_checked()?;
    ctx.change_yaw(ent);
    Ok(())
}

fn pf_movetogoal(ctx: &mut ServerContext) -> Result<(), VmError> {
    let dist = ctx.pr.parm_float(0);
    ctx.move_to_goal(dist)
}

// ============================================================
// Printing
// ============================================================

/// Broadcast print to everyone on server.
fn pf_bprint(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = var_string(ctx, 0);
    ctx.broadcast_printf(&s);
    Ok(())
}

/// Single print to a specific client.
fn pf_sprint(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = var_string(ctx, 1);
    let Some(c) = parm_client(ctx, 0)? else {
        com_printf("tried to sprint to a non-client\n");
        return Ok(());
    };
    ctx.client_printf(c, &s);
    Ok(())
}

/// Single print to a specific client, in the middle of the screen.
fn pf_centerprint(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = var_string(ctx, 1);
    let Some(c) = parm_client(ctx, 0)? else {
        com_printf("tried to centerprint to a non-client\n");
        return Ok(());
    };
    if let Some(client) = ctx.svs.client_mut(c) {
        msg_write_char(&mut client.message, SVC_CENTERPRINT as i32);
        msg_write_string(&mut client.message, &s);
    }
    Ok(())
}

fn pf_dprint(ctx: &mut ServerContext) -> Result<(), VmError> {
    com_dprintf(&var_string(ctx, 0));
    Ok(())
}

fn pf_ftos(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_float(0);
    let s = if v == v.trunc() && v.abs() < i32::MAX as f32 {
        format!("{}", v as i32)
    } else {
        format!("{:5.1}", v)
    };
    let id = ctx.pr.temp_string(s);
    ctx.pr.return_string(id);
    Ok(())
}

fn pf_vtos(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_vector(0);
    let id = ctx.pr.temp_string(format!("'{:5.1} {:5.1} {:5.1}'", v[0], v[1], v[2]));
    ctx.pr.return_string(id);
    Ok(())
}

fn pf_eprint(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = parm_edict_checked(ctx, 0)?;
    com_printf(&ctx.ed_print(e));
    Ok(())
}

fn pf_coredump(ctx: &mut ServerContext) -> Result<(), VmError> {
    com_printf(&format!("{} entities\n", ctx.sv.num_edicts()));
    for e in 0..ctx.sv.num_edicts() {
        com_printf(&ctx.ed_print(e));
    }
    Ok(())
}

fn pf_traceon(ctx: &mut ServerContext) -> Result<(), VmError> {
    ctx.pr.trace = true;
    Ok(())
}

fn pf_traceoff(ctx: &mut ServerContext) -> Result<(), VmError> {
    ctx.pr.trace = false;
    Ok(())
}

fn pf_break(_ctx: &mut ServerContext) -> Result<(), VmError> {
    com_printf("break statement\n");
    Ok(())
}

/// Dumps self and ends the level. The server shuts down.
fn pf_error(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = var_string(ctx, 0);
    let function = ctx.pr.dat.function_name(ctx.pr.xfunction).into_owned();
    log::error!("======SERVER ERROR in {}:\n{}", function, s);
    if let Some(dump) = ctx.self_dump() {
        log::error!("{}", dump);
    }
    Err(HostError::Fatal(format!("Program error: {}", s)).into())
}

/// Dumps out self, then an error message. The program is aborted and self
/// is removed, but the level can continue.
fn pf_objerror(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = var_string(ctx, 0);
    let me = ctx.self_checked()?;
    let function = ctx.pr.dat.function_name(ctx.pr.xfunction).into_owned();
    log::error!("======OBJECT ERROR in {}:\n{}", function, s);
    log::error!("{}", ctx.ed_print(me));
    ctx.ed_free(me);
    Err(fault(ctx, s))
}

// ============================================================
// Console and cvars
// ============================================================

/// Sends text over to the client's execution buffer.
fn pf_stuffcmd(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = ctx.pr.parm_string(1);
    let Some(c) = parm_client(ctx, 0)? else {
        return Err(fault(ctx, "Parm 0 not a client"));
    };
    if let Some(client) = ctx.svs.client_mut(c) {
        msg_write_byte(&mut client.message, SVC_STUFFTEXT as i32);
        msg_write_string(&mut client.message, &s);
    }
    Ok(())
}

/// Sends text over to the server's execution buffer.
fn pf_localcmd(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = ctx.pr.parm_string(0);
    ctx.cbuf.push(s);
    Ok(())
}

fn pf_cvar(ctx: &mut ServerContext) -> Result<(), VmError> {
    let name = ctx.pr.parm_string(0);
    let v = ctx.cvar(&name);
    ctx.pr.return_float(v);
    Ok(())
}

fn pf_cvar_set(ctx: &mut ServerContext) -> Result<(), VmError> {
    let name = ctx.pr.parm_string(0);
    let value = ctx.pr.parm_string(1);
    ctx.cvars.set(&name, &value);
    Ok(())
}

fn pf_changelevel(ctx: &mut ServerContext) -> Result<(), VmError> {
    // make sure we don't issue two changelevels
    if ctx.svs.changelevel_issued {
        return Ok(());
    }
    ctx.svs.changelevel_issued = true;

    let s = ctx.pr.parm_string(0);
    ctx.cbuf.push(format!("changelevel {}", s));
    Ok(())
}

fn pf_setspawnparms(ctx: &mut ServerContext) -> Result<(), VmError> {
    let Some(c) = parm_client(ctx, 0)? else {
        return Err(fault(ctx, "Entity is not a client"));
    };
    // copy spawn parms out of the client_t
    if let Some(parms) = ctx.svs.client(c).map(|cl| cl.spawn_parms) {
        ctx.pr.set_spawn_parms(&parms);
    }
    Ok(())
}

// ============================================================
// Message writing
// ============================================================

/// Run `write` against the buffer named by the destination parameter.
fn write_dest(ctx: &mut ServerContext, write: impl FnOnce(&mut SizeBuf)) -> Result<(), VmError> {
    let dest = ctx.pr.parm_float(0) as i32;
    let buf = match dest {
        MSG_BROADCAST => &mut ctx.sv.datagram,
        MSG_ONE => {
            let ent = ctx.pr.g_edict(gv::MSG_ENTITY);
            let slot = ctx.edict_client(ent);
            match slot.and_then(|c| ctx.svs.client_mut(c)) {
                Some(client) => &mut client.message,
                None => return Err(fault(ctx, "WriteDest: not a client")),
            }
        }
        MSG_ALL => &mut ctx.sv.reliable_datagram,
        MSG_INIT => &mut ctx.sv.signon,
        _ => return Err(fault(ctx, "WriteDest: bad destination")),
    };
    write(buf);
    Ok(())
}

fn pf_write_byte(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_float(1) as i32;
    write_dest(ctx, |msg| msg_write_byte(msg, v))
}

fn pf_write_char(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_float(1) as i32;
    write_dest(ctx, |msg| msg_write_char(msg, v))
}

fn pf_write_short(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_float(1) as i32;
    write_dest(ctx, |msg| msg_write_short(msg, v))
}

fn pf_write_long(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_float(1) as i32;
    write_dest(ctx, |msg| msg_write_long(msg, v))
}

fn pf_write_angle(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_float(1);
    write_dest(ctx, |msg| msg_write_angle(msg, v))
}

fn pf_write_coord(ctx: &mut ServerContext) -> Result<(), VmError> {
    let v = ctx.pr.parm_float(1);
    write_dest(ctx, |msg| msg_write_coord(msg, v))
}

fn pf_write_string(ctx: &mut ServerContext) -> Result<(), VmError> {
    let s = ctx.pr.parm_string(1);
    write_dest(ctx, |msg| msg_write_string(msg, &s))
}

fn pf_write_entity(ctx: &mut ServerContext) -> Result<(), VmError> {
    let e = ctx.pr.parm_edict(1) as i32;
    write_dest(ctx, |msg| msg_write_short(msg, e))
}
