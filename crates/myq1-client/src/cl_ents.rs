// cl_ents.rs — entity interpolation between server messages
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.
//
// The server sends entity positions at its own tick rate. The client
// keeps the last two samples of every entity and draws it at a point
// between them chosen from the client clock, so motion stays smooth
// between snapshots. Nothing here feeds back into gameplay.

use myq1_common::q_shared::*;

use crate::client::*;

impl ClientContext {
    /// Determines the fraction between the last two messages that the
    /// objects should be put at.
    pub fn lerp_point(&mut self) -> f32 {
        let mut f = self.cl.mtime[0] - self.cl.mtime[1];

        if f == 0.0 || self.cvar("cl_nolerp") != 0.0 {
            self.cl.time = self.cl.mtime[0];
            return 1.0;
        }

        if f > MAX_LERP_GAP {
            // dropped packet, or start of demo
            self.cl.mtime[1] = self.cl.mtime[0] - MAX_LERP_GAP;
            f = MAX_LERP_GAP;
        }
        let frac = (self.cl.time - self.cl.mtime[1]) / f;

        if frac < 0.0 {
            if frac < -0.01 {
                log::trace!("lerp frac {:.3} behind the server", frac);
                self.cl.time = self.cl.mtime[1];
            }
            0.0
        } else if frac > 1.0 {
            if frac > 1.01 {
                log::trace!("lerp frac {:.3} ahead of the server", frac);
                self.cl.time = self.cl.mtime[0];
            }
            1.0
        } else {
            frac as f32
        }
    }

    /// Move every entity to its interpolated position and build the list
    /// of entities to draw.
    pub fn relink_entities(&mut self) {
        // determine partial update time
        let frac = self.lerp_point();

        self.cl.visedicts.clear();

        // interpolate player info
        let mv = self.cl.mvelocity;
        for i in 0..3 {
            self.cl.velocity[i] = mv[1][i] + frac * (mv[0][i] - mv[1][i]);
        }

        let mtime = self.cl.mtime[0];
        let viewentity = self.cl.viewentity;
        let mut lights = Vec::new();

        // start on the entity after the world
        for i in 1..self.cl.num_entities {
            let ent = &mut self.cl.entities[i];
            if !ent.has_model() {
                // empty slot
                continue;
            }

            // if the object wasn't included in the last packet, remove it
            if ent.msgtime != mtime {
                ent.modelindex = 0;
                continue;
            }

            if ent.forcelink {
                // the entity was not updated in the last message so move
                // to the final spot
                ent.origin = ent.msg_origins[0];
                ent.angles = ent.msg_angles[0];
            } else {
                // if the delta is large, assume a teleport and don't lerp
                let mut f = frac;
                let delta = vector_subtract(&ent.msg_origins[0], &ent.msg_origins[1]);
                if delta.iter().any(|d| d.abs() > TELEPORT_DELTA) {
                    f = 1.0; // assume a teleportation, not a motion
                }

                // interpolate the origin and angles
                for j in 0..3 {
                    ent.origin[j] = ent.msg_origins[1][j] + f * delta[j];

                    let mut d = ent.msg_angles[0][j] - ent.msg_angles[1][j];
                    if d > 180.0 {
                        d -= 360.0;
                    } else if d < -180.0 {
                        d += 360.0;
                    }
                    ent.angles[j] = ent.msg_angles[1][j] + f * d;
                }
            }

            if ent.effects & EF_MUZZLEFLASH != 0 {
                let (fv, _, _) = angle_vectors(&ent.angles);
                let mut org = ent.origin;
                org[2] += 16.0;
                let org = vector_ma(&org, 18.0, &fv);
                lights.push((i, org, 200.0 + (rand::random::<u32>() & 31) as f32, 0.1, 32.0));
            }
            if ent.effects & EF_BRIGHTLIGHT != 0 {
                let mut org = ent.origin;
                org[2] += 16.0;
                lights.push((i, org, 400.0 + (rand::random::<u32>() & 31) as f32, 0.001, 0.0));
            }
            if ent.effects & EF_DIMLIGHT != 0 {
                lights.push((i, ent.origin, 200.0 + (rand::random::<u32>() & 31) as f32, 0.001, 0.0));
            }

            ent.forcelink = false;

            if i == viewentity {
                continue;
            }
            if self.cl.visedicts.len() < MAX_VISEDICTS {
                self.cl.visedicts.push(i);
            }
        }

        for (key, org, radius, duration, minlight) in lights {
            let dl = self.alloc_dlight(key, org, radius, duration);
            dl.minlight = minlight;
        }
    }

    /// A light keyed to an entity replaces that entity's previous light.
    pub fn alloc_dlight(&mut self, key: usize, origin: Vec3, radius: f32, duration: f64) -> &mut DLight {
        let light = DLight { key, origin, radius, die: self.cl.time + duration, minlight: 0.0 };
        let now = self.cl.time;
        let dlights = &mut self.cl.dlights;

        // first look for an exact key match, then any dead light
        let slot = if key != 0 {
            dlights.iter().position(|dl| dl.key == key)
        } else {
            None
        }
        .or_else(|| dlights.iter().position(|dl| dl.die < now));

        let idx = match slot {
            Some(idx) => idx,
            None if dlights.len() < MAX_DLIGHTS => {
                dlights.push(light);
                dlights.len() - 1
            }
            None => 0,
        };
        dlights[idx] = light;
        &mut dlights[idx]
    }

    /// Drop lights and beams whose time is up.
    pub fn expire_effects(&mut self) {
        let now = self.cl.time;
        self.cl.dlights.retain(|dl| dl.die >= now);
        self.cl.beams.retain(|b| b.endtime >= now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn moving_entity(ctx: &mut ClientContext, num: usize, from: Vec3, to: Vec3) {
        ctx.cl.num_entities = ctx.cl.num_entities.max(num + 1);
        let ent = &mut ctx.cl.entities[num];
        ent.modelindex = 2;
        ent.msgtime = ctx.cl.mtime[0];
        ent.msg_origins = [to, from];
        ent.forcelink = false;
    }

    #[test]
    fn test_lerp_point() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.05;
        assert_approx_eq!(ctx.lerp_point(), 0.5, 0.001);

        // behind the older message: hold at the start and catch the clock up
        ctx.cl.time = 0.9;
        assert_eq!(ctx.lerp_point(), 0.0);
        assert_eq!(ctx.cl.time, 1.0);

        // ahead of the newest message
        ctx.cl.time = 1.3;
        assert_eq!(ctx.lerp_point(), 1.0);
        assert_eq!(ctx.cl.time, 1.1);
    }

    #[test]
    fn test_lerp_point_caps_long_gaps() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [2.0, 1.0];
        ctx.cl.time = 1.95;
        assert_approx_eq!(ctx.lerp_point(), 0.5, 0.001);
        assert_approx_eq!(ctx.cl.mtime[1], 1.9);

        ctx.cl.mtime = [2.0, 2.0];
        ctx.cl.time = 1.5;
        assert_eq!(ctx.lerp_point(), 1.0);
        assert_eq!(ctx.cl.time, 2.0);
    }

    #[test]
    fn test_nolerp_snaps() {
        let mut ctx = ClientContext::new();
        ctx.cvars.set("cl_nolerp", "1");
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.05;
        assert_eq!(ctx.lerp_point(), 1.0);
        assert_eq!(ctx.cl.time, 1.1);
    }

    #[test]
    fn test_relink_interpolates_between_samples() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.025;
        moving_entity(&mut ctx, 3, [0.0, 0.0, 0.0], [40.0, -8.0, 0.0]);
        ctx.cl.entities[3].msg_angles = [[0.0, 10.0, 0.0], [0.0, 350.0, 0.0]];

        ctx.relink_entities();
        let ent = &ctx.cl.entities[3];
        assert_approx_eq!(ent.origin[0], 10.0, 0.01);
        assert_approx_eq!(ent.origin[1], -2.0, 0.01);
        // yaw goes the short way round, 350 -> 10 via 360
        assert_approx_eq!(ent.angles[1], 355.0, 0.01);
        assert_eq!(ctx.cl.visedicts, vec![3]);
    }

    #[test]
    fn test_teleports_are_not_interpolated() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.05;
        moving_entity(&mut ctx, 1, [0.0; 3], [0.0, 500.0, 0.0]);
        ctx.relink_entities();
        assert_eq!(ctx.cl.entities[1].origin, [0.0, 500.0, 0.0]);
    }

    #[test]
    fn test_forcelink_and_stale_entities() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.05;
        moving_entity(&mut ctx, 1, [0.0; 3], [64.0, 0.0, 0.0]);
        ctx.cl.entities[1].forcelink = true;
        moving_entity(&mut ctx, 2, [0.0; 3], [64.0, 0.0, 0.0]);
        ctx.cl.entities[2].msgtime = 1.0; // missing from the last packet

        ctx.relink_entities();
        assert_eq!(ctx.cl.entities[1].origin, [64.0, 0.0, 0.0]);
        assert!(!ctx.cl.entities[1].forcelink);
        assert!(!ctx.cl.entities[2].has_model(), "stale entity is removed");
        assert_eq!(ctx.cl.visedicts, vec![1]);
    }

    #[test]
    fn test_view_entity_is_not_drawn() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.1;
        moving_entity(&mut ctx, 1, [0.0; 3], [1.0, 0.0, 0.0]);
        moving_entity(&mut ctx, 2, [0.0; 3], [1.0, 0.0, 0.0]);
        ctx.cl.viewentity = 1;
        ctx.relink_entities();
        assert_eq!(ctx.cl.visedicts, vec![2]);

        let snapshot = ctx.render_entities();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].num, 2);
        assert_eq!(snapshot[0].origin, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_velocity_interpolation() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.075;
        ctx.cl.mvelocity = [[320.0, 0.0, 0.0], [0.0, 0.0, -160.0]];
        ctx.relink_entities();
        assert_approx_eq!(ctx.cl.velocity[0], 240.0, 0.1);
        assert_approx_eq!(ctx.cl.velocity[2], -40.0, 0.1);
    }

    #[test]
    fn test_entity_lights() {
        let mut ctx = ClientContext::new();
        ctx.cl.mtime = [1.1, 1.0];
        ctx.cl.time = 1.1;
        moving_entity(&mut ctx, 4, [0.0; 3], [0.0; 3]);
        ctx.cl.entities[4].effects = EF_DIMLIGHT;
        ctx.relink_entities();
        ctx.relink_entities();
        assert_eq!(ctx.cl.dlights.len(), 1, "keyed light is reused");
        let dl = ctx.cl.dlights[0];
        assert_eq!(dl.key, 4);
        assert!((200.0..232.0).contains(&dl.radius));

        ctx.cl.time = 1.2;
        ctx.expire_effects();
        assert!(ctx.cl.dlights.is_empty());
    }
}
