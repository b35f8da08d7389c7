// sv_phys.rs — entity physics
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.
//
// pushmove objects do not obey gravity, and do not interact with each
// other or trigger fields, but block normal movement and push normal
// objects when they move.
//
// onground is set for toss objects when they come to a complete rest. It
// is set for step objects each frame.
//
// doors, plats, etc are SOLID_BSP, and MOVETYPE_PUSH
// bonus items are SOLID_TRIGGER touch, and MOVETYPE_TOSS
// corpses are SOLID_NOT and MOVETYPE_TOSS
// crates are SOLID_BBOX and MOVETYPE_TOSS
// walking monsters are SOLID_SLIDEBOX and MOVETYPE_STEP
// flying/floating monsters are SOLID_SLIDEBOX and MOVETYPE_FLY
//
// solid_edge items only clip against bsp models.

use myq1_common::common::*;
use myq1_common::q_shared::*;

use crate::pr_exec::{VmError, VmFault};
use crate::progs::{ev, gv};
use crate::server::*;
use crate::sv_world::{MOVE_MISSILE, MOVE_NOMONSTERS, MOVE_NORMAL};

const STOP_EPSILON: f32 = 0.1;
const MAX_CLIP_PLANES: usize = 5;
const STEPSIZE: f32 = 18.0;

/// Adjust `input` to slide along `normal`. Returns the blocked flags:
/// 1 for a floor, 2 for a wall or step.
pub fn clip_velocity(input: &Vec3, normal: &Vec3, overbounce: f32) -> (Vec3, i32) {
    let mut blocked = 0;
    if normal[2] > 0.0 {
        blocked |= 1; // floor
    }
    if normal[2] == 0.0 {
        blocked |= 2; // step
    }

    let backoff = dot_product(input, normal) * overbounce;

    let mut out = [0.0; 3];
    for i in 0..3 {
        out[i] = input[i] - normal[i] * backoff;
        if out[i] > -STOP_EPSILON && out[i] < STOP_EPSILON {
            out[i] = 0.0;
        }
    }
    (out, blocked)
}

impl ServerContext {
    fn check_velocity(&mut self, e: usize) {
        let maxvelocity = self.cvar("sv_maxvelocity");
        let classname = self.pr.get_string(self.edict(e).string(ev::CLASSNAME)).into_owned();
        let ent = self.edict_mut(e);
        let mut velocity = ent.vector(ev::VELOCITY);
        let mut origin = ent.origin();

        // bound velocity
        for i in 0..3 {
            if velocity[i].is_nan() {
                com_printf(&format!("Got a NaN velocity on {}\n", classname));
                velocity[i] = 0.0;
            }
            if origin[i].is_nan() {
                com_printf(&format!("Got a NaN origin on {}\n", classname));
                origin[i] = 0.0;
            }
            if velocity[i] > maxvelocity {
                velocity[i] = maxvelocity;
            } else if velocity[i] < -maxvelocity {
                velocity[i] = -maxvelocity;
            }
        }
        ent.set_vector(ev::VELOCITY, &velocity);
        ent.set_vector(ev::ORIGIN, &origin);
    }

    /// Runs thinking code if time. There is some play in the exact time
    /// the think function will be called, because it is called before any
    /// movement is done in a frame. Not used for pushmove objects, because
    /// they must be exact. Returns false if the entity removed itself.
    pub fn run_think(&mut self, e: usize) -> Result<bool, VmError> {
        let mut thinktime = self.edict(e).float(ev::NEXTTHINK) as f64;
        if thinktime <= 0.0 || thinktime > self.sv.time + self.host_frametime {
            return Ok(true);
        }

        if thinktime < self.sv.time {
            // don't let things stay in the past. it is possible to start
            // that way by a trigger with a local time.
            thinktime = self.sv.time;
        }

        let think = self.edict(e).function(ev::THINK);
        self.edict_mut(e).set_float(ev::NEXTTHINK, 0.0);
        self.pr.set_g_float(gv::TIME, thinktime as f32);
        self.pr.set_g_edict(gv::SELF, e);
        self.pr.set_g_edict(gv::OTHER, 0);
        self.execute_program(think)?;
        Ok(!self.edict(e).free)
    }

    /// Two entities have touched, so run their touch functions.
    fn impact(&mut self, e1: usize, e2: usize) -> Result<(), VmError> {
        let old_self = self.pr.g_edict(gv::SELF);
        let old_other = self.pr.g_edict(gv::OTHER);

        self.pr.set_g_float(gv::TIME, self.sv.time as f32);
        for (a, b) in [(e1, e2), (e2, e1)] {
            let ent = self.edict(a);
            let touch = ent.function(ev::TOUCH);
            if touch != 0 && ent.solid() != SOLID_NOT {
                self.pr.set_g_edict(gv::SELF, a);
                self.pr.set_g_edict(gv::OTHER, b);
                self.execute_program(touch)?;
            }
        }

        self.pr.set_g_edict(gv::SELF, old_self);
        self.pr.set_g_edict(gv::OTHER, old_other);
        Ok(())
    }

    // ============================================================
    // SV_FlyMove
    //
    // The basic solid body movement clip that slides along multiple
    // planes. Returns the clipflags if the velocity was modified (hit
    // something solid):
    // 1 = floor
    // 2 = wall / step
    // 4 = dead stop
    // If steptrace is not None, the trace of any vertical wall hit will be
    // stored.
    // ============================================================

    pub fn fly_move(&mut self, e: usize, time: f32, mut steptrace: Option<&mut Trace>) -> Result<i32, VmError> {
        let numbumps = 4;
        let mut blocked = 0;
        let mut original_velocity = self.edict(e).vector(ev::VELOCITY);
        let primal_velocity = original_velocity;
        let mut planes: Vec<Vec3> = Vec::with_capacity(MAX_CLIP_PLANES);
        let mut time_left = time;

        for _ in 0..numbumps {
            let ent = self.edict(e);
            let velocity = ent.vector(ev::VELOCITY);
            if velocity == [0.0; 3] {
                break;
            }

            let origin = ent.origin();
            let end = vector_ma(&origin, time_left, &velocity);
            let (mins, maxs) = (ent.vector(ev::MINS), ent.vector(ev::MAXS));
            let trace = self.sv_move(&origin, &mins, &maxs, &end, MOVE_NORMAL, Some(e))?;

            if trace.allsolid {
                // entity is trapped in another solid
                self.edict_mut(e).set_vector(ev::VELOCITY, &VEC3_ORIGIN);
                return Ok(3);
            }

            if trace.fraction > 0.0 {
                // actually covered some distance
                self.edict_mut(e).set_vector(ev::ORIGIN, &trace.endpos);
                original_velocity = velocity;
                planes.clear();
            }

            if trace.fraction == 1.0 {
                break; // moved the entire distance
            }

            let Some(hit) = trace.ent else {
                return Err(HostError::Fatal("SV_FlyMove: !trace.ent".into()).into());
            };

            if trace.plane.normal[2] > 0.7 {
                blocked |= 1; // floor
                if self.edict(hit).solid() == SOLID_BSP {
                    let flags = self.edict_flags(e) | EdictFlags::ONGROUND;
                    self.set_edict_flags(e, flags);
                    self.edict_mut(e).set_entity(ev::GROUNDENTITY, hit);
                }
            }
            if trace.plane.normal[2] == 0.0 {
                blocked |= 2; // step
                if let Some(st) = steptrace.as_deref_mut() {
                    *st = trace; // save for player extrafriction
                }
            }

            // run the impact function
            self.impact(e, hit)?;
            if self.edict(e).free {
                break; // removed by the impact function
            }

            time_left -= time_left * trace.fraction;

            // cliped to another plane
            if planes.len() >= MAX_CLIP_PLANES {
                // this shouldn't really happen
                self.edict_mut(e).set_vector(ev::VELOCITY, &VEC3_ORIGIN);
                return Ok(3);
            }
            planes.push(trace.plane.normal);

            // modify original_velocity so it parallels all of the clip
            // planes
            let mut new_velocity = None;
            for (i, plane) in planes.iter().enumerate() {
                let (v, _) = clip_velocity(&original_velocity, plane, 1.0);
                let ok = planes
                    .iter()
                    .enumerate()
                    .all(|(j, other)| j == i || dot_product(&v, other) >= 0.0);
                if ok {
                    new_velocity = Some(v);
                    break;
                }
            }

            let velocity = match new_velocity {
                // go along this plane
                Some(v) => v,
                None => {
                    // go along the crease
                    if planes.len() != 2 {
                        self.edict_mut(e).set_vector(ev::VELOCITY, &VEC3_ORIGIN);
                        return Ok(7);
                    }
                    let dir = cross_product(&planes[0], &planes[1]);
                    let d = dot_product(&dir, &self.edict(e).vector(ev::VELOCITY));
                    vector_scale(&dir, d)
                }
            };

            // if original velocity is against the original velocity, stop
            // dead to avoid tiny occilations in sloping corners
            if dot_product(&velocity, &primal_velocity) <= 0.0 {
                self.edict_mut(e).set_vector(ev::VELOCITY, &VEC3_ORIGIN);
                return Ok(blocked);
            }
            self.edict_mut(e).set_vector(ev::VELOCITY, &velocity);
        }

        Ok(blocked)
    }

    fn add_gravity(&mut self, e: usize) {
        let ent_gravity = match self.pr.field_gravity {
            Some(ofs) => {
                let g = self.edict(e).float(ofs);
                if g != 0.0 {
                    g
                } else {
                    1.0
                }
            }
            None => 1.0,
        };
        let fall = ent_gravity * self.cvar("sv_gravity") * self.host_frametime as f32;
        let ent = self.edict_mut(e);
        let mut velocity = ent.vector(ev::VELOCITY);
        velocity[2] -= fall;
        ent.set_vector(ev::VELOCITY, &velocity);
    }

    // ============================================================
    // PUSHMOVE
    // ============================================================

    /// Does not change the entity's velocity at all.
    pub fn push_entity(&mut self, e: usize, push: &Vec3) -> Result<Trace, VmError> {
        let ent = self.edict(e);
        let origin = ent.origin();
        let end = vector_add(&origin, push);
        let (mins, maxs) = (ent.vector(ev::MINS), ent.vector(ev::MAXS));

        let move_type = if ent.movetype() == MOVETYPE_FLYMISSILE {
            MOVE_MISSILE
        } else if ent.solid() == SOLID_TRIGGER || ent.solid() == SOLID_NOT {
            // only clip against bmodels
            MOVE_NOMONSTERS
        } else {
            MOVE_NORMAL
        };
        let trace = self.sv_move(&origin, &mins, &maxs, &end, move_type, Some(e))?;

        self.edict_mut(e).set_vector(ev::ORIGIN, &trace.endpos);
        self.link_edict(e, true)?;

        if let Some(hit) = trace.ent {
            self.impact(e, hit)?;
        }
        Ok(trace)
    }

    fn push_move(&mut self, pusher: usize, movetime: f32) -> Result<(), VmError> {
        let p = self.edict(pusher);
        let velocity = p.vector(ev::VELOCITY);
        if velocity == [0.0; 3] {
            let ltime = p.float(ev::LTIME);
            self.edict_mut(pusher).set_float(ev::LTIME, ltime + movetime);
            return Ok(());
        }

        let mv = vector_scale(&velocity, movetime);
        let mins = vector_add(&p.vector(ev::ABSMIN), &mv);
        let maxs = vector_add(&p.vector(ev::ABSMAX), &mv);
        let pushorig = p.origin();

        // move the pusher to it's final position
        let p = self.edict_mut(pusher);
        p.set_vector(ev::ORIGIN, &vector_add(&pushorig, &mv));
        let ltime = p.float(ev::LTIME);
        p.set_float(ev::LTIME, ltime + movetime);
        self.link_edict(pusher, false)?;

        // see if any solid entities are inside the final position
        let mut moved: Vec<(usize, Vec3)> = Vec::new();
        for check in 1..self.sv.num_edicts() {
            let c = self.edict(check);
            if c.free {
                continue;
            }
            let movetype = c.movetype();
            if movetype == MOVETYPE_PUSH || movetype == MOVETYPE_NONE || movetype == MOVETYPE_NOCLIP {
                continue;
            }

            // if the entity is standing on the pusher, it will definately
            // be moved
            let riding =
                self.edict_flags(check).contains(EdictFlags::ONGROUND) && c.entity(ev::GROUNDENTITY) == pusher;
            if !riding {
                let (absmin, absmax) = (c.vector(ev::ABSMIN), c.vector(ev::ABSMAX));
                if (0..3).any(|i| absmin[i] >= maxs[i] || absmax[i] <= mins[i]) {
                    continue;
                }
                // see if the ent's bbox is inside the pusher's final
                // position
                if self.test_entity_position(check)?.is_none() {
                    continue;
                }
            }

            // remove the onground flag for non-players
            if movetype != MOVETYPE_WALK {
                let flags = self.edict_flags(check) - EdictFlags::ONGROUND;
                self.set_edict_flags(check, flags);
            }

            let entorig = self.edict(check).origin();
            moved.push((check, entorig));

            // try moving the contacted entity
            let solid = self.edict(pusher).float(ev::SOLID);
            self.edict_mut(pusher).set_float(ev::SOLID, SOLID_NOT as f32);
            let pushed = self.push_entity(check, &mv);
            self.edict_mut(pusher).set_float(ev::SOLID, solid);
            pushed?;

            // if it is still inside the pusher, block
            if self.test_entity_position(check)?.is_none() {
                continue;
            }

            // fail the move
            let c = self.edict_mut(check);
            let (mut cmins, cmaxs) = (c.vector(ev::MINS), c.vector(ev::MAXS));
            if cmins[0] == cmaxs[0] {
                continue;
            }
            if c.solid() == SOLID_NOT || c.solid() == SOLID_TRIGGER {
                // corpse
                cmins[0] = 0.0;
                cmins[1] = 0.0;
                c.set_vector(ev::MINS, &cmins);
                c.set_vector(ev::MAXS, &cmins);
                continue;
            }

            c.set_vector(ev::ORIGIN, &entorig);
            self.link_edict(check, true)?;

            let p = self.edict_mut(pusher);
            p.set_vector(ev::ORIGIN, &pushorig);
            let ltime = p.float(ev::LTIME);
            p.set_float(ev::LTIME, ltime - movetime);
            self.link_edict(pusher, false)?;

            // if the pusher has a "blocked" function, call it
            // otherwise, just stay in place until the obstacle is gone
            let blocked = self.edict(pusher).function(ev::BLOCKED);
            if blocked != 0 {
                self.pr.set_g_edict(gv::SELF, pusher);
                self.pr.set_g_edict(gv::OTHER, check);
                self.execute_program(blocked)?;
            }

            // move back any entities we already moved
            for (ent, from) in moved {
                self.edict_mut(ent).set_vector(ev::ORIGIN, &from);
                self.link_edict(ent, false)?;
            }
            return Ok(());
        }
        Ok(())
    }

    fn physics_pusher(&mut self, e: usize) -> Result<(), VmError> {
        let frametime = self.host_frametime as f32;
        let oldltime = self.edict(e).float(ev::LTIME);
        let thinktime = self.edict(e).float(ev::NEXTTHINK);

        let movetime = if thinktime < oldltime + frametime {
            (thinktime - oldltime).max(0.0)
        } else {
            frametime
        };

        if movetime != 0.0 {
            self.push_move(e, movetime)?; // advances ltime if not blocked
        }

        if thinktime > oldltime && thinktime <= self.edict(e).float(ev::LTIME) {
            let think = self.edict(e).function(ev::THINK);
            self.edict_mut(e).set_float(ev::NEXTTHINK, 0.0);
            self.pr.set_g_float(gv::TIME, self.sv.time as f32);
            self.pr.set_g_edict(gv::SELF, e);
            self.pr.set_g_edict(gv::OTHER, 0);
            self.execute_program(think)?;
        }
        Ok(())
    }

    // ============================================================
    // CLIENT MOVEMENT
    // ============================================================

    /// This is a big hack to try and fix the rare case of getting stuck in
    /// the world clipping hull.
    fn check_stuck(&mut self, e: usize) -> Result<(), VmError> {
        if self.test_entity_position(e)?.is_none() {
            let origin = self.edict(e).origin();
            self.edict_mut(e).set_vector(ev::OLDORIGIN, &origin);
            return Ok(());
        }

        let org = self.edict(e).origin();
        let oldorigin = self.edict(e).vector(ev::OLDORIGIN);
        self.edict_mut(e).set_vector(ev::ORIGIN, &oldorigin);
        if self.test_entity_position(e)?.is_none() {
            com_dprintf("Unstuck.\n");
            self.link_edict(e, true)?;
            return Ok(());
        }

        for z in 0..18 {
            for i in -1..=1 {
                for j in -1..=1 {
                    let origin = [org[0] + i as f32, org[1] + j as f32, org[2] + z as f32];
                    self.edict_mut(e).set_vector(ev::ORIGIN, &origin);
                    if self.test_entity_position(e)?.is_none() {
                        com_dprintf("Unstuck.\n");
                        self.link_edict(e, true)?;
                        return Ok(());
                    }
                }
            }
        }

        self.edict_mut(e).set_vector(ev::ORIGIN, &org);
        com_dprintf("player is stuck.\n");
        Ok(())
    }

    fn check_water(&mut self, e: usize) -> bool {
        let ent = self.edict(e);
        let origin = ent.origin();
        let (mins, maxs) = (ent.vector(ev::MINS), ent.vector(ev::MAXS));
        let view_ofs = ent.vector(ev::VIEW_OFS);

        let mut waterlevel = 0.0;
        let mut watertype = CONTENTS_EMPTY;

        let mut point = [origin[0], origin[1], origin[2] + mins[2] + 1.0];
        let cont = self.point_contents(&point);
        if cont <= CONTENTS_WATER {
            watertype = cont;
            waterlevel = 1.0;
            point[2] = origin[2] + (mins[2] + maxs[2]) * 0.5;
            if self.point_contents(&point) <= CONTENTS_WATER {
                waterlevel = 2.0;
                point[2] = origin[2] + view_ofs[2];
                if self.point_contents(&point) <= CONTENTS_WATER {
                    waterlevel = 3.0;
                }
            }
        }

        let ent = self.edict_mut(e);
        ent.set_float(ev::WATERLEVEL, waterlevel);
        ent.set_float(ev::WATERTYPE, watertype as f32);
        waterlevel > 1.0
    }

    fn wall_friction(&mut self, e: usize, trace: &Trace) {
        let ent = self.edict_mut(e);
        let (forward, _right, _up) = angle_vectors(&ent.vector(ev::V_ANGLE));
        let d = dot_product(&trace.plane.normal, &forward) + 0.5;
        if d >= 0.0 {
            return;
        }

        // cut the tangential velocity
        let mut velocity = ent.vector(ev::VELOCITY);
        let i = dot_product(&trace.plane.normal, &velocity);
        let into = vector_scale(&trace.plane.normal, i);
        let side = vector_subtract(&velocity, &into);

        velocity[0] = side[0] * (1.0 + d);
        velocity[1] = side[1] * (1.0 + d);
        ent.set_vector(ev::VELOCITY, &velocity);
    }

    /// Player has come to a dead stop, possibly due to the problem with
    /// limited float precision at some angle joins in the BSP hull.
    ///
    /// Try fixing by pushing one pixel in each direction. This is a hack,
    /// but in the interest of good gameplay...
    fn try_unstick(&mut self, e: usize, oldvel: &Vec3) -> Result<i32, VmError> {
        let oldorg = self.edict(e).origin();
        let dirs: [Vec3; 8] = [
            [2.0, 0.0, 0.0],
            [0.0, 2.0, 0.0],
            [-2.0, 0.0, 0.0],
            [0.0, -2.0, 0.0],
            [2.0, 2.0, 0.0],
            [-2.0, 2.0, 0.0],
            [2.0, -2.0, 0.0],
            [-2.0, -2.0, 0.0],
        ];

        for dir in dirs.iter() {
            // try pushing a little in an axial direction
            self.push_entity(e, dir)?;

            // retry the original move
            self.edict_mut(e).set_vector(ev::VELOCITY, &[oldvel[0], oldvel[1], 0.0]);
            let mut steptrace = Trace::default();
            let clip = self.fly_move(e, 0.1, Some(&mut steptrace))?;

            let origin = self.edict(e).origin();
            if (oldorg[1] - origin[1]).abs() > 4.0 || (oldorg[0] - origin[0]).abs() > 4.0 {
                return Ok(clip);
            }

            // go back to the original pos and try again
            self.edict_mut(e).set_vector(ev::ORIGIN, &oldorg);
        }

        self.edict_mut(e).set_vector(ev::VELOCITY, &VEC3_ORIGIN);
        Ok(7) // still not moving
    }

    /// Only used by players.
    fn walk_move(&mut self, e: usize) -> Result<(), VmError> {
        let frametime = self.host_frametime as f32;

        // do a regular slide move unless it looks like you ran into a step
        let flags = self.edict_flags(e);
        let oldonground = flags.contains(EdictFlags::ONGROUND);
        self.set_edict_flags(e, flags - EdictFlags::ONGROUND);

        let oldorg = self.edict(e).origin();
        let oldvel = self.edict(e).vector(ev::VELOCITY);

        let mut steptrace = Trace::default();
        let clip = self.fly_move(e, frametime, Some(&mut steptrace))?;

        if clip & 2 == 0 {
            return Ok(()); // move didn't block on a step
        }
        if !oldonground && self.edict(e).float(ev::WATERLEVEL) == 0.0 {
            return Ok(()); // don't stair up while jumping
        }
        if self.edict(e).movetype() != MOVETYPE_WALK {
            return Ok(()); // gibbed by a trigger
        }
        if self.cvar("sv_nostep") != 0.0 {
            return Ok(());
        }
        if self.edict_flags(e).contains(EdictFlags::WATERJUMP) {
            return Ok(());
        }

        let nosteporg = self.edict(e).origin();
        let nostepvel = self.edict(e).vector(ev::VELOCITY);

        // try moving up and forward to go up a step
        self.edict_mut(e).set_vector(ev::ORIGIN, &oldorg); // back to start pos

        let upmove = [0.0, 0.0, STEPSIZE];
        let downmove = [0.0, 0.0, -STEPSIZE + oldvel[2] * frametime];

        // move up
        self.push_entity(e, &upmove)?;

        // move forward
        self.edict_mut(e).set_vector(ev::VELOCITY, &[oldvel[0], oldvel[1], 0.0]);
        let mut clip = self.fly_move(e, frametime, Some(&mut steptrace))?;

        // check for stuckness, possibly due to the limited precision of
        // floats in the clipping hulls
        if clip != 0 {
            let origin = self.edict(e).origin();
            if (oldorg[1] - origin[1]).abs() < 0.03125 && (oldorg[0] - origin[0]).abs() < 0.03125 {
                // stepping up didn't make any progress
                clip = self.try_unstick(e, &oldvel)?;
            }
        }

        // extra friction based on view angle
        if clip & 2 != 0 {
            self.wall_friction(e, &steptrace);
        }

        // move down
        let downtrace = self.push_entity(e, &downmove)?;

        if downtrace.plane.normal[2] > 0.7 {
            if self.edict(e).solid() == SOLID_BSP {
                let flags = self.edict_flags(e) | EdictFlags::ONGROUND;
                self.set_edict_flags(e, flags);
                self.edict_mut(e).set_entity(ev::GROUNDENTITY, downtrace.ent.unwrap_or(0));
            }
        } else {
            // if the push down didn't end up on good ground, use the move
            // without the step up. This happens near wall / slope
            // combinations, and can cause players to hop up higher on a
            // slope
            let ent = self.edict_mut(e);
            ent.set_vector(ev::ORIGIN, &nosteporg);
            ent.set_vector(ev::VELOCITY, &nostepvel);
        }
        Ok(())
    }

    /// Player character actions.
    fn physics_client(&mut self, e: usize) -> Result<(), VmError> {
        let active = self.edict_client(e).and_then(|c| self.svs.client(c)).map_or(false, |c| c.active);
        if !active {
            return Ok(()); // unconnected slot
        }

        // call standard client pre-think
        self.pr.set_g_float(gv::TIME, self.sv.time as f32);
        self.pr.set_g_edict(gv::SELF, e);
        self.execute_program(self.pr.g_int(gv::PLAYER_PRE_THINK))?;

        // do a move
        self.check_velocity(e);

        // decide which move function to call
        match self.edict(e).movetype() {
            MOVETYPE_NONE => {
                if !self.run_think(e)? {
                    return Ok(());
                }
            }
            MOVETYPE_WALK => {
                if !self.run_think(e)? {
                    return Ok(());
                }
                if !self.check_water(e) && !self.edict_flags(e).contains(EdictFlags::WATERJUMP) {
                    self.add_gravity(e);
                }
                self.check_stuck(e)?;
                self.walk_move(e)?;
            }
            MOVETYPE_TOSS | MOVETYPE_BOUNCE => self.physics_toss(e)?,
            MOVETYPE_FLY => {
                if !self.run_think(e)? {
                    return Ok(());
                }
                let frametime = self.host_frametime as f32;
                self.fly_move(e, frametime, None)?;
            }
            MOVETYPE_NOCLIP => {
                if !self.run_think(e)? {
                    return Ok(());
                }
                let frametime = self.host_frametime as f32;
                let ent = self.edict_mut(e);
                let origin = vector_ma(&ent.origin(), frametime, &ent.vector(ev::VELOCITY));
                ent.set_vector(ev::ORIGIN, &origin);
            }
            other => {
                return Err(self.run_error(VmFault::Script(format!("SV_Physics_client: bad movetype {}", other))));
            }
        }

        // call standard player post-think
        self.link_edict(e, true)?;

        self.pr.set_g_float(gv::TIME, self.sv.time as f32);
        self.pr.set_g_edict(gv::SELF, e);
        self.execute_program(self.pr.g_int(gv::PLAYER_POST_THINK))?;
        Ok(())
    }

    // ============================================================
    // Non-player movement
    // ============================================================

    /// Non moving objects can only think.
    fn physics_none(&mut self, e: usize) -> Result<(), VmError> {
        self.run_think(e)?;
        Ok(())
    }

    /// A moving object that doesn't obey physics.
    fn physics_noclip(&mut self, e: usize) -> Result<(), VmError> {
        if !self.run_think(e)? {
            return Ok(());
        }
        let frametime = self.host_frametime as f32;
        let ent = self.edict_mut(e);
        let angles = vector_ma(&ent.vector(ev::ANGLES), frametime, &ent.vector(ev::AVELOCITY));
        let origin = vector_ma(&ent.origin(), frametime, &ent.vector(ev::VELOCITY));
        ent.set_vector(ev::ANGLES, &angles);
        ent.set_vector(ev::ORIGIN, &origin);
        self.link_edict(e, false)
    }

    fn check_water_transition(&mut self, e: usize) -> Result<(), VmError> {
        let cont = self.point_contents(&self.edict(e).origin());
        let watertype = self.edict(e).float(ev::WATERTYPE);

        if watertype == 0.0 {
            // just spawned here
            let ent = self.edict_mut(e);
            ent.set_float(ev::WATERTYPE, cont as f32);
            ent.set_float(ev::WATERLEVEL, 1.0);
            return Ok(());
        }

        if cont <= CONTENTS_WATER {
            if watertype == CONTENTS_EMPTY as f32 {
                // just crossed into water
                self.start_sound(e, 0, "misc/h2ohit1.wav", 255, 1.0)?;
            }
            let ent = self.edict_mut(e);
            ent.set_float(ev::WATERTYPE, cont as f32);
            ent.set_float(ev::WATERLEVEL, 1.0);
        } else {
            if watertype != CONTENTS_EMPTY as f32 {
                // just crossed out of water
                self.start_sound(e, 0, "misc/h2ohit1.wav", 255, 1.0)?;
            }
            let ent = self.edict_mut(e);
            ent.set_float(ev::WATERTYPE, CONTENTS_EMPTY as f32);
            ent.set_float(ev::WATERLEVEL, cont as f32);
        }
        Ok(())
    }

    /// Toss, bounce, and fly movement. When onground, do nothing.
    fn physics_toss(&mut self, e: usize) -> Result<(), VmError> {
        // regular thinking
        if !self.run_think(e)? {
            return Ok(());
        }

        // if onground, return without moving
        if self.edict_flags(e).contains(EdictFlags::ONGROUND) {
            return Ok(());
        }

        self.check_velocity(e);

        // add gravity
        let movetype = self.edict(e).movetype();
        if movetype != MOVETYPE_FLY && movetype != MOVETYPE_FLYMISSILE {
            self.add_gravity(e);
        }

        // move angles
        let frametime = self.host_frametime as f32;
        let ent = self.edict_mut(e);
        let angles = vector_ma(&ent.vector(ev::ANGLES), frametime, &ent.vector(ev::AVELOCITY));
        ent.set_vector(ev::ANGLES, &angles);

        // move origin
        let mv = vector_scale(&ent.vector(ev::VELOCITY), frametime);
        let trace = self.push_entity(e, &mv)?;
        if trace.fraction == 1.0 {
            return Ok(());
        }
        if self.edict(e).free {
            return Ok(());
        }

        let backoff = if movetype == MOVETYPE_BOUNCE { 1.5 } else { 1.0 };
        let (velocity, _) = clip_velocity(&self.edict(e).vector(ev::VELOCITY), &trace.plane.normal, backoff);
        self.edict_mut(e).set_vector(ev::VELOCITY, &velocity);

        // stop if on ground
        if trace.plane.normal[2] > 0.7 && (velocity[2] < 60.0 || movetype != MOVETYPE_BOUNCE) {
            let flags = self.edict_flags(e) | EdictFlags::ONGROUND;
            self.set_edict_flags(e, flags);
            let ent = self.edict_mut(e);
            ent.set_entity(ev::GROUNDENTITY, trace.ent.unwrap_or(0));
            ent.set_vector(ev::VELOCITY, &VEC3_ORIGIN);
            ent.set_vector(ev::AVELOCITY, &VEC3_ORIGIN);
        }

        // check for in water
        self.check_water_transition(e)
    }

    // ============================================================
    // STEPPING MOVEMENT
    // ============================================================

    /// Monsters freefall when they don't have a ground entity, otherwise
    /// all movement is done with discrete steps.
    ///
    /// This is also used for objects that have become still on the ground,
    /// but will fall if the floor is pulled out from under them.
    fn physics_step(&mut self, e: usize) -> Result<(), VmError> {
        // freefall if not onground
        if !self
            .edict_flags(e)
            .intersects(EdictFlags::ONGROUND | EdictFlags::FLY | EdictFlags::SWIM)
        {
            let hitsound = self.edict(e).vector(ev::VELOCITY)[2] < self.cvar("sv_gravity") * -0.1;

            self.add_gravity(e);
            self.check_velocity(e);
            let frametime = self.host_frametime as f32;
            self.fly_move(e, frametime, None)?;
            self.link_edict(e, true)?;

            // just hit ground
            if self.edict_flags(e).contains(EdictFlags::ONGROUND) && hitsound {
                self.start_sound(e, 0, "demon/dland2.wav", 255, 1.0)?;
            }
        }

        // regular thinking
        self.run_think(e)?;

        self.check_water_transition(e)
    }

    fn physics_entity(&mut self, e: usize) -> Result<(), VmError> {
        if e > 0 && e <= self.svs.maxclients {
            return self.physics_client(e);
        }
        match self.edict(e).movetype() {
            MOVETYPE_PUSH => self.physics_pusher(e),
            MOVETYPE_NONE => self.physics_none(e),
            MOVETYPE_NOCLIP => self.physics_noclip(e),
            MOVETYPE_STEP => self.physics_step(e),
            MOVETYPE_TOSS | MOVETYPE_BOUNCE | MOVETYPE_FLY | MOVETYPE_FLYMISSILE => self.physics_toss(e),
            other => Err(self.run_error(VmFault::Script(format!("SV_Physics: bad movetype {}", other)))),
        }
    }

    /// Run one frame of physics for every entity and advance the level
    /// clock.
    pub fn physics(&mut self) -> Result<(), HostError> {
        // let the progs know that a new frame has started
        self.pr.set_g_edict(gv::SELF, 0);
        self.pr.set_g_edict(gv::OTHER, 0);
        self.pr.set_g_float(gv::TIME, self.sv.time as f32);
        let start_frame = self.pr.g_int(gv::START_FRAME);
        let result = self.execute_program(start_frame);
        self.contain_fault(result)?;

        // treat each object in turn; entities spawned this frame are run
        // too
        let mut e = 0;
        while e < self.sv.num_edicts() {
            if !self.edict(e).free {
                if self.pr.g_float(gv::FORCE_RETOUCH) != 0.0 {
                    // force retouch even for stationary
                    let result = self.link_edict(e, true);
                    self.contain_fault(result)?;
                }
                let result = self.physics_entity(e);
                self.contain_fault(result)?;
            }
            e += 1;
        }

        let retouch = self.pr.g_float(gv::FORCE_RETOUCH);
        if retouch != 0.0 {
            self.pr.set_g_float(gv::FORCE_RETOUCH, retouch - 1.0);
        }

        self.sv.time += self.host_frametime;
        Ok(())
    }
}
