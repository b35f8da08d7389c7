// sv_move.rs — monster movement
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::q_shared::*;

use crate::pr_exec::VmError;
use crate::progs::{ev, gv, OFS_RETURN};
use crate::server::*;
use crate::sv_world::{MOVE_NOMONSTERS, MOVE_NORMAL};

const STEPSIZE: f32 = 18.0;
const DI_NODIR: f32 = -1.0;

impl ServerContext {
    // ============================================================
    // SV_CheckBottom
    //
    // Returns false if any part of the bottom of the entity is off an
    // edge that is not a staircase.
    // ============================================================

    pub fn check_bottom(&self, e: usize) -> Result<bool, VmError> {
        let ed = self.edict(e);
        let mins = vector_add(&ed.origin(), &ed.vector(ev::MINS));
        let maxs = vector_add(&ed.origin(), &ed.vector(ev::MAXS));

        // if all of the points under the corners are solid world, don't
        // bother with the tougher checks
        // the corners must be within 16 of the midpoint
        let mut start = [0.0f32, 0.0, mins[2] - 1.0];
        let mut all_solid = true;
        'corners: for x in 0..=1 {
            for y in 0..=1 {
                start[0] = if x != 0 { maxs[0] } else { mins[0] };
                start[1] = if y != 0 { maxs[1] } else { mins[1] };
                if self.point_contents(&start) != CONTENTS_SOLID {
                    all_solid = false;
                    break 'corners;
                }
            }
        }
        if all_solid {
            return Ok(true); // we got out easy
        }

        // check it for real...
        start[2] = mins[2];

        // the midpoint must be within 16 of the bottom
        start[0] = (mins[0] + maxs[0]) * 0.5;
        start[1] = (mins[1] + maxs[1]) * 0.5;
        let mut stop = [start[0], start[1], start[2] - 2.0 * STEPSIZE];
        let trace = self.sv_move(&start, &VEC3_ORIGIN, &VEC3_ORIGIN, &stop, MOVE_NOMONSTERS, Some(e))?;

        if trace.fraction == 1.0 {
            return Ok(false);
        }
        let mid = trace.endpos[2];

        // the corners must be within 16 of the midpoint
        for x in 0..=1 {
            for y in 0..=1 {
                start[0] = if x != 0 { maxs[0] } else { mins[0] };
                start[1] = if y != 0 { maxs[1] } else { mins[1] };
                stop[0] = start[0];
                stop[1] = start[1];

                let trace = self.sv_move(&start, &VEC3_ORIGIN, &VEC3_ORIGIN, &stop, MOVE_NOMONSTERS, Some(e))?;
                if trace.fraction == 1.0 || mid - trace.endpos[2] > STEPSIZE {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    // ============================================================
    // SV_movestep
    //
    // Called by monster program code.
    // The move will be adjusted for slopes and stairs, but if the move
    // isn't possible, no move is done and false is returned.
    // ============================================================

    pub fn movestep(&mut self, e: usize, mv: &Vec3, relink: bool) -> Result<bool, VmError> {
        let ed = self.edict(e);
        let oldorg = ed.origin();
        let mins = ed.vector(ev::MINS);
        let maxs = ed.vector(ev::MAXS);
        let enemy = self.entity_field_checked(e, ev::ENEMY)?;
        let flags = self.edict_flags(e);

        // flying monsters don't step up
        if flags.intersects(EdictFlags::SWIM | EdictFlags::FLY) {
            // try one move with vertical motion, then one without
            for i in 0..2 {
                let origin = self.edict(e).origin();
                let mut neworg = vector_add(&origin, mv);
                if i == 0 && enemy != 0 {
                    let dz = origin[2] - self.edict(enemy).origin()[2];
                    if dz > 40.0 {
                        neworg[2] -= 8.0;
                    }
                    if dz < 30.0 {
                        neworg[2] += 8.0;
                    }
                }
                let trace = self.sv_move(&origin, &mins, &maxs, &neworg, MOVE_NORMAL, Some(e))?;

                if trace.fraction == 1.0 {
                    if flags.contains(EdictFlags::SWIM)
                        && self.point_contents(&trace.endpos) == CONTENTS_EMPTY
                    {
                        return Ok(false); // swim monster left water
                    }
                    self.edict_mut(e).set_vector(ev::ORIGIN, &trace.endpos);
                    if relink {
                        self.link_edict(e, true)?;
                    }
                    return Ok(true);
                }

                if enemy == 0 {
                    break;
                }
            }
            return Ok(false);
        }

        // push down from a step height above the wished position
        let mut neworg = vector_add(&oldorg, mv);
        neworg[2] += STEPSIZE;
        let mut end = neworg;
        end[2] -= STEPSIZE * 2.0;

        let mut trace = self.sv_move(&neworg, &mins, &maxs, &end, MOVE_NORMAL, Some(e))?;
        if trace.allsolid {
            return Ok(false);
        }
        if trace.startsolid {
            neworg[2] -= STEPSIZE;
            trace = self.sv_move(&neworg, &mins, &maxs, &end, MOVE_NORMAL, Some(e))?;
            if trace.allsolid || trace.startsolid {
                return Ok(false);
            }
        }

        if trace.fraction == 1.0 {
            // if monster had the ground pulled out, go ahead and fall
            if flags.contains(EdictFlags::PARTIALGROUND) {
                let origin = vector_add(&oldorg, mv);
                self.edict_mut(e).set_vector(ev::ORIGIN, &origin);
                if relink {
                    self.link_edict(e, true)?;
                }
                self.set_edict_flags(e, self.edict_flags(e) - EdictFlags::ONGROUND);
                return Ok(true);
            }
            return Ok(false); // walked off an edge
        }

        // check point traces down for dangling corners
        self.edict_mut(e).set_vector(ev::ORIGIN, &trace.endpos);

        if !self.check_bottom(e)? {
            if flags.contains(EdictFlags::PARTIALGROUND) {
                // entity had floor mostly pulled out from underneath it
                // and is trying to correct
                if relink {
                    self.link_edict(e, true)?;
                }
                return Ok(true);
            }
            self.edict_mut(e).set_vector(ev::ORIGIN, &oldorg);
            return Ok(false);
        }

        if flags.contains(EdictFlags::PARTIALGROUND) {
            self.set_edict_flags(e, self.edict_flags(e) - EdictFlags::PARTIALGROUND);
        }
        self.edict_mut(e).set_entity(ev::GROUNDENTITY, trace.ent.unwrap_or(0));

        // the move is ok
        if relink {
            self.link_edict(e, true)?;
        }
        Ok(true)
    }

    /// Turn `e` toward its ideal yaw, at most `yaw_speed` degrees.
    pub fn change_yaw(&mut self, e: usize) {
        let ed = self.edict_mut(e);
        let mut angles = ed.vector(ev::ANGLES);
        let current = anglemod(angles[YAW]);
        let ideal = ed.float(ev::IDEAL_YAW);
        let speed = ed.float(ev::YAW_SPEED);

        if current == ideal {
            return;
        }
        let mut mv = ideal - current;
        if ideal > current {
            if mv >= 180.0 {
                mv -= 360.0;
            }
        } else if mv <= -180.0 {
            mv += 360.0;
        }
        if mv > 0.0 {
            if mv > speed {
                mv = speed;
            }
        } else if mv < -speed {
            mv = -speed;
        }

        angles[YAW] = anglemod(current + mv);
        ed.set_vector(ev::ANGLES, &angles);
    }

    // ============================================================
    // SV_StepDirection
    //
    // Turns to the movement direction, and walks the current distance
    // if facing it.
    // ============================================================

    fn step_direction(&mut self, e: usize, yaw: f32, dist: f32) -> Result<bool, VmError> {
        self.edict_mut(e).set_float(ev::IDEAL_YAW, yaw);
        self.change_yaw(e);

        let rad = yaw.to_radians();
        let mv = [rad.cos() * dist, rad.sin() * dist, 0.0];

        let oldorigin = self.edict(e).origin();
        if self.movestep(e, &mv, false)? {
            let ed = self.edict_mut(e);
            let delta = ed.vector(ev::ANGLES)[YAW] - ed.float(ev::IDEAL_YAW);
            if delta > 45.0 && delta < 315.0 {
                // not turned far enough, so don't take the step
                ed.set_vector(ev::ORIGIN, &oldorigin);
            }
            self.link_edict(e, true)?;
            return Ok(true);
        }
        self.link_edict(e, true)?;
        Ok(false)
    }

    fn new_chase_dir(&mut self, actor: usize, enemy: usize, dist: f32) -> Result<(), VmError> {
        let olddir = anglemod(((self.edict(actor).float(ev::IDEAL_YAW) / 45.0) as i32 * 45) as f32);
        let turnaround = anglemod(olddir - 180.0);

        let delta = vector_subtract(&self.edict(enemy).origin(), &self.edict(actor).origin());
        let (deltax, deltay) = (delta[0], delta[1]);
        let mut d = [
            0.0,
            if deltax > 10.0 {
                0.0
            } else if deltax < -10.0 {
                180.0
            } else {
                DI_NODIR
            },
            if deltay < -10.0 {
                270.0
            } else if deltay > 10.0 {
                90.0
            } else {
                DI_NODIR
            },
        ];

        // try direct route
        if d[1] != DI_NODIR && d[2] != DI_NODIR {
            let tdir = if d[1] == 0.0 {
                if d[2] == 90.0 { 45.0 } else { 315.0 }
            } else if d[2] == 90.0 {
                135.0
            } else {
                215.0
            };
            if tdir != turnaround && self.step_direction(actor, tdir, dist)? {
                return Ok(());
            }
        }

        // try other directions
        if rand::random::<u32>() & 1 != 0 || deltay.abs() > deltax.abs() {
            d.swap(1, 2);
        }

        for dir in [d[1], d[2]] {
            if dir != DI_NODIR && dir != turnaround && self.step_direction(actor, dir, dist)? {
                return Ok(());
            }
        }

        // there is no direct path to the player, so pick another direction
        if olddir != DI_NODIR && self.step_direction(actor, olddir, dist)? {
            return Ok(());
        }

        // randomly determine direction of search
        let mut dirs: Vec<f32> = (0..8).map(|i| (i * 45) as f32).collect();
        if rand::random::<bool>() {
            dirs.reverse();
        }
        for tdir in dirs {
            if tdir != turnaround && self.step_direction(actor, tdir, dist)? {
                return Ok(());
            }
        }

        if turnaround != DI_NODIR && self.step_direction(actor, turnaround, dist)? {
            return Ok(());
        }

        self.edict_mut(actor).set_float(ev::IDEAL_YAW, olddir); // can't move

        // if a bridge was pulled out from underneath a monster, it may not
        // have a valid standing position at all
        if !self.check_bottom(actor)? {
            let flags = self.edict_flags(actor) | EdictFlags::PARTIALGROUND;
            self.set_edict_flags(actor, flags);
        }
        Ok(())
    }

    fn close_enough(&self, e: usize, goal: usize, dist: f32) -> bool {
        let (ed, g) = (self.edict(e), self.edict(goal));
        let (absmin, absmax) = (ed.vector(ev::ABSMIN), ed.vector(ev::ABSMAX));
        let (gmin, gmax) = (g.vector(ev::ABSMIN), g.vector(ev::ABSMAX));
        (0..3).all(|i| gmin[i] <= absmax[i] + dist && gmax[i] >= absmin[i] - dist)
    }

    // ============================================================
    // SV_MoveToGoal
    //
    // Steps self toward its goalentity, picking a new chase direction
    // when blocked.
    // ============================================================

    pub fn move_to_goal(&mut self, dist: f32) -> Result<(), VmError> {
        let ent = self.self_checked()?;
        let goal = self.entity_field_checked(ent, ev::GOALENTITY)?;

        let flags = self.edict_flags(ent);
        if !flags.intersects(EdictFlags::ONGROUND | EdictFlags::FLY | EdictFlags::SWIM) {
            self.pr.set_g_float(OFS_RETURN, 0.0);
            return Ok(());
        }

        // if the next step hits the enemy, return immediately
        if self.edict(ent).entity(ev::ENEMY) != 0 && self.close_enough(ent, goal, dist) {
            return Ok(());
        }

        // bump around...
        let ideal_yaw = self.edict(ent).float(ev::IDEAL_YAW);
        if rand::random::<u32>() & 3 == 1 || !self.step_direction(ent, ideal_yaw, dist)? {
            self.new_chase_dir(ent, goal, dist)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use assert_approx_eq::assert_approx_eq;
    use myq1_common::cmodel::BrushModel;
    use std::sync::Arc;

    fn room_context() -> ServerContext {
        let mut ctx = context_with(&ProgsBuilder::new());
        let room = BrushModel::room("maps/test.bsp", &[-256.0; 3], &[256.0; 3]);
        ctx.sv.worldmodel = Arc::new(room.clone());
        ctx.sv.model_precache = vec![String::new(), "maps/test.bsp".into()];
        ctx.sv.models = vec![None, Some(ServerModel::Brush(Arc::new(room)))];
        ctx.clear_world();
        let world = ctx.edict_mut(0);
        world.set_float(ev::SOLID, SOLID_BSP as f32);
        world.set_float(ev::MOVETYPE, MOVETYPE_PUSH as f32);
        world.set_float(ev::MODELINDEX, 1.0);
        ctx
    }

    fn monster(ctx: &mut ServerContext, origin: Vec3) -> usize {
        let e = ctx.ed_alloc().unwrap();
        let ed = ctx.edict_mut(e);
        ed.set_vector(ev::ORIGIN, &origin);
        ed.set_vector(ev::MINS, &[-16.0, -16.0, -24.0]);
        ed.set_vector(ev::MAXS, &[16.0, 16.0, 40.0]);
        ed.set_float(ev::SOLID, SOLID_SLIDEBOX as f32);
        ed.set_float(ev::MOVETYPE, MOVETYPE_STEP as f32);
        ed.set_float(ev::YAW_SPEED, 20.0);
        ctx.set_edict_flags(e, EdictFlags::ONGROUND);
        ctx.link_edict(e, false).unwrap();
        e
    }

    #[test]
    fn test_check_bottom_on_floor() {
        let mut ctx = room_context();
        // standing exactly on the floor, corners are just above solid
        let e = monster(&mut ctx, [0.0, 0.0, -232.0]);
        assert!(ctx.check_bottom(e).unwrap());

        // hanging in the air
        ctx.edict_mut(e).set_vector(ev::ORIGIN, &[0.0, 0.0, 0.0]);
        assert!(!ctx.check_bottom(e).unwrap());
    }

    #[test]
    fn test_movestep_walks_along_floor() {
        let mut ctx = room_context();
        let e = monster(&mut ctx, [0.0, 0.0, -232.0]);
        assert!(ctx.movestep(e, &[10.0, 0.0, 0.0], true).unwrap());
        let org = ctx.edict(e).origin();
        assert_approx_eq!(org[0], 10.0, 0.01);
        assert_approx_eq!(org[2], -232.0, 0.1);
        assert_eq!(ctx.edict(e).entity(ev::GROUNDENTITY), 0);

        // into the wall: no move
        let before = ctx.edict(e).origin();
        assert!(!ctx.movestep(e, &[400.0, 0.0, 0.0], true).unwrap());
        assert_eq!(ctx.edict(e).origin(), before);
    }

    #[test]
    fn test_walking_off_into_air_fails() {
        let mut ctx = room_context();
        let e = monster(&mut ctx, [0.0, 0.0, 100.0]);
        assert!(!ctx.movestep(e, &[10.0, 0.0, 0.0], true).unwrap());
        assert_eq!(ctx.edict(e).origin(), [0.0, 0.0, 100.0]);
    }

    #[test]
    fn test_flyer_moves_freely() {
        let mut ctx = room_context();
        let e = monster(&mut ctx, [0.0, 0.0, 0.0]);
        ctx.set_edict_flags(e, EdictFlags::FLY);
        assert!(ctx.movestep(e, &[0.0, 20.0, 0.0], true).unwrap());
        let org = ctx.edict(e).origin();
        assert_approx_eq!(org[1], 20.0, 0.01);
        assert_approx_eq!(org[2], 0.0, 0.01);
    }

    #[test]
    fn test_change_yaw_limited_by_speed() {
        let mut ctx = room_context();
        let e = monster(&mut ctx, [0.0, 0.0, -232.0]);
        ctx.edict_mut(e).set_float(ev::IDEAL_YAW, 90.0);
        ctx.change_yaw(e);
        assert_approx_eq!(ctx.edict(e).vector(ev::ANGLES)[YAW], 20.0, 0.01);

        // shortest way round crosses zero
        ctx.edict_mut(e).set_vector(ev::ANGLES, &[0.0, 10.0, 0.0]);
        ctx.edict_mut(e).set_float(ev::IDEAL_YAW, 350.0);
        ctx.change_yaw(e);
        assert_approx_eq!(ctx.edict(e).vector(ev::ANGLES)[YAW], 350.0, 0.05);
    }

    #[test]
    fn test_move_to_goal_requires_footing() {
        let mut ctx = room_context();
        let e = monster(&mut ctx, [0.0, 0.0, -232.0]);
        let goal = monster(&mut ctx, [128.0, 0.0, -232.0]);
        ctx.edict_mut(e).set_entity(ev::GOALENTITY, goal);
        ctx.pr.set_g_edict(gv::SELF, e);

        ctx.set_edict_flags(e, EdictFlags::empty());
        ctx.move_to_goal(8.0).unwrap();
        assert_eq!(ctx.edict(e).origin(), [0.0, 0.0, -232.0]);

        ctx.set_edict_flags(e, EdictFlags::ONGROUND);
        ctx.edict_mut(e).set_vector(ev::ANGLES, &[0.0, 0.0, 0.0]);
        for _ in 0..10 {
            ctx.move_to_goal(8.0).unwrap();
        }
        let moved = vector_length(&vector_subtract(&ctx.edict(e).origin(), &[0.0, 0.0, -232.0]));
        assert!(moved > 0.0);
    }
}
