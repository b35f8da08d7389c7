// sv_user.rs — server code for moving users
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::pr_exec::VmError;
use crate::progs::ev;
use crate::server::*;
use crate::sv_world::{MOVE_NOMONSTERS, MOVE_NORMAL};

const MAX_FORWARD: usize = 6;
const ON_EPSILON: f32 = 0.1;

/// Per-think movement state of the player being moved.
struct PlayerMove {
    e: usize,
    cmd: UserCmd,
    onground: bool,
    wishdir: Vec3,
    wishspeed: f32,
}

impl ServerContext {
    // ============================================================
    // SV_SetIdealPitch
    // ============================================================

    /// Look up or down ahead of a player walking on a slope.
    pub fn set_ideal_pitch(&mut self, e: usize) -> Result<(), VmError> {
        if !self.edict_flags(e).contains(EdictFlags::ONGROUND) {
            return Ok(());
        }

        let ent = self.edict(e);
        let origin = ent.origin();
        let view_ofs = ent.vector(ev::VIEW_OFS);
        let angleval = ent.vector(ev::ANGLES)[YAW].to_radians();
        let (sinval, cosval) = angleval.sin_cos();

        let mut z = [0.0f32; MAX_FORWARD];
        for (i, zi) in z.iter_mut().enumerate() {
            let step = (i + 3) as f32 * 12.0;
            let top = [origin[0] + cosval * step, origin[1] + sinval * step, origin[2] + view_ofs[2]];
            let bottom = [top[0], top[1], top[2] - 160.0];

            let tr = self.sv_move(&top, &VEC3_ORIGIN, &VEC3_ORIGIN, &bottom, MOVE_NOMONSTERS, Some(e))?;
            if tr.allsolid {
                return Ok(()); // looking at a wall, leave ideal the way it was
            }
            if tr.fraction == 1.0 {
                return Ok(()); // near a dropoff
            }
            *zi = top[2] + tr.fraction * (bottom[2] - top[2]);
        }

        let mut dir = 0.0f32;
        let mut steps = 0;
        for j in 1..MAX_FORWARD {
            let step = z[j] - z[j - 1];
            if step > -ON_EPSILON && step < ON_EPSILON {
                continue;
            }
            if dir != 0.0 && (step - dir > ON_EPSILON || step - dir < -ON_EPSILON) {
                return Ok(()); // mixed changes
            }
            steps += 1;
            dir = step;
        }

        if dir == 0.0 {
            self.edict_mut(e).set_float(ev::IDEALPITCH, 0.0);
            return Ok(());
        }
        if steps < 2 {
            return Ok(());
        }
        let scale = self.cvar("sv_idealpitchscale");
        self.edict_mut(e).set_float(ev::IDEALPITCH, -dir * scale);
        Ok(())
    }

    fn user_friction(&mut self, e: usize) -> Result<(), VmError> {
        let ent = self.edict(e);
        let mut vel = ent.vector(ev::VELOCITY);
        let origin = ent.origin();
        let mins = ent.vector(ev::MINS);

        let speed = (vel[0] * vel[0] + vel[1] * vel[1]).sqrt();
        if speed == 0.0 {
            return Ok(());
        }

        // if the leading edge is over a dropoff, increase friction
        let start = [origin[0] + vel[0] / speed * 16.0, origin[1] + vel[1] / speed * 16.0, origin[2] + mins[2]];
        let stop = [start[0], start[1], start[2] - 34.0];

        let trace = self.sv_move(&start, &VEC3_ORIGIN, &VEC3_ORIGIN, &stop, MOVE_NOMONSTERS, Some(e))?;

        let friction = if trace.fraction == 1.0 {
            self.cvar("sv_friction") * self.cvar("edgefriction")
        } else {
            self.cvar("sv_friction")
        };

        // apply friction
        let stopspeed = self.cvar("sv_stopspeed");
        let control = if speed < stopspeed { stopspeed } else { speed };
        let mut newspeed = speed - self.host_frametime as f32 * control * friction;
        if newspeed < 0.0 {
            newspeed = 0.0;
        }
        newspeed /= speed;

        vel = vector_scale(&vel, newspeed);
        self.edict_mut(e).set_vector(ev::VELOCITY, &vel);
        Ok(())
    }

    fn accelerate(&mut self, pm: &PlayerMove) {
        let mut velocity = self.edict(pm.e).vector(ev::VELOCITY);
        let currentspeed = dot_product(&velocity, &pm.wishdir);
        let addspeed = pm.wishspeed - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        let mut accelspeed = self.cvar("sv_accelerate") * self.host_frametime as f32 * pm.wishspeed;
        if accelspeed > addspeed {
            accelspeed = addspeed;
        }
        velocity = vector_ma(&velocity, accelspeed, &pm.wishdir);
        self.edict_mut(pm.e).set_vector(ev::VELOCITY, &velocity);
    }

    fn air_accelerate(&mut self, pm: &PlayerMove, wishveloc: &Vec3) {
        let mut wishveloc = *wishveloc;
        let mut wishspd = vector_normalize(&mut wishveloc);
        if wishspd > 30.0 {
            wishspd = 30.0;
        }
        let mut velocity = self.edict(pm.e).vector(ev::VELOCITY);
        let currentspeed = dot_product(&velocity, &wishveloc);
        let addspeed = wishspd - currentspeed;
        if addspeed <= 0.0 {
            return;
        }
        // the full wish speed sets the acceleration rate
        let mut accelspeed = self.cvar("sv_accelerate") * pm.wishspeed * self.host_frametime as f32;
        if accelspeed > addspeed {
            accelspeed = addspeed;
        }
        velocity = vector_ma(&velocity, accelspeed, &wishveloc);
        self.edict_mut(pm.e).set_vector(ev::VELOCITY, &velocity);
    }

    fn drop_punch_angle(&mut self, e: usize) {
        let frametime = self.host_frametime as f32;
        let ent = self.edict_mut(e);
        let mut punch = ent.vector(ev::PUNCHANGLE);
        let mut len = vector_normalize(&mut punch);
        len -= 10.0 * frametime;
        if len < 0.0 {
            len = 0.0;
        }
        ent.set_vector(ev::PUNCHANGLE, &vector_scale(&punch, len));
    }

    fn water_move(&mut self, pm: &PlayerMove) {
        let frametime = self.host_frametime as f32;
        let maxspeed = self.cvar("sv_maxspeed");
        let friction = self.cvar("sv_friction");
        let accelerate = self.cvar("sv_accelerate");
        let cmd = &pm.cmd;

        // user intentions
        let ent = self.edict(pm.e);
        let (forward, right, _up) = angle_vectors(&ent.vector(ev::V_ANGLE));
        let mut wishvel = [0.0f32; 3];
        for i in 0..3 {
            wishvel[i] = forward[i] * cmd.forwardmove + right[i] * cmd.sidemove;
        }
        if cmd.forwardmove == 0.0 && cmd.sidemove == 0.0 && cmd.upmove == 0.0 {
            wishvel[2] -= 60.0; // drift towards bottom
        } else {
            wishvel[2] += cmd.upmove;
        }

        let mut wishspeed = vector_length(&wishvel);
        if wishspeed > maxspeed {
            wishvel = vector_scale(&wishvel, maxspeed / wishspeed);
            wishspeed = maxspeed;
        }
        wishspeed *= 0.7;

        // water friction
        let mut velocity = ent.vector(ev::VELOCITY);
        let speed = vector_length(&velocity);
        let newspeed = if speed != 0.0 {
            let newspeed = (speed - frametime * speed * friction).max(0.0);
            velocity = vector_scale(&velocity, newspeed / speed);
            newspeed
        } else {
            0.0
        };

        // water acceleration
        if wishspeed != 0.0 {
            let addspeed = wishspeed - newspeed;
            if addspeed > 0.0 {
                vector_normalize(&mut wishvel);
                let mut accelspeed = accelerate * wishspeed * frametime;
                if accelspeed > addspeed {
                    accelspeed = addspeed;
                }
                velocity = vector_ma(&velocity, accelspeed, &wishvel);
            }
        }
        self.edict_mut(pm.e).set_vector(ev::VELOCITY, &velocity);
    }

    fn water_jump(&mut self, e: usize) {
        let time = self.sv.time as f32;
        let ent = self.edict(e);
        if time > ent.float(ev::TELEPORT_TIME) || ent.float(ev::WATERLEVEL) == 0.0 {
            let flags = self.edict_flags(e) - EdictFlags::WATERJUMP;
            self.set_edict_flags(e, flags);
            self.edict_mut(e).set_float(ev::TELEPORT_TIME, 0.0);
        }
        let ent = self.edict_mut(e);
        let movedir = ent.vector(ev::MOVEDIR);
        let mut velocity = ent.vector(ev::VELOCITY);
        velocity[0] = movedir[0];
        velocity[1] = movedir[1];
        ent.set_vector(ev::VELOCITY, &velocity);
    }

    fn air_move(&mut self, pm: &mut PlayerMove) -> Result<(), VmError> {
        let maxspeed = self.cvar("sv_maxspeed");
        let ent = self.edict(pm.e);
        let (forward, right, _up) = angle_vectors(&ent.vector(ev::ANGLES));

        let mut fmove = pm.cmd.forwardmove;
        let smove = pm.cmd.sidemove;

        // hack to not let you back into teleporter
        if (self.sv.time as f32) < ent.float(ev::TELEPORT_TIME) && fmove < 0.0 {
            fmove = 0.0;
        }

        let mut wishvel = [0.0f32; 3];
        for i in 0..3 {
            wishvel[i] = forward[i] * fmove + right[i] * smove;
        }
        wishvel[2] = if ent.movetype() != MOVETYPE_WALK { pm.cmd.upmove } else { 0.0 };

        pm.wishdir = wishvel;
        pm.wishspeed = vector_normalize(&mut pm.wishdir);
        if pm.wishspeed > maxspeed {
            wishvel = vector_scale(&wishvel, maxspeed / pm.wishspeed);
            pm.wishspeed = maxspeed;
        }

        if ent.movetype() == MOVETYPE_NOCLIP {
            // noclip
            self.edict_mut(pm.e).set_vector(ev::VELOCITY, &wishvel);
        } else if pm.onground {
            self.user_friction(pm.e)?;
            self.accelerate(pm);
        } else {
            // not on ground, so little effect on velocity
            self.air_accelerate(pm, &wishvel);
        }
        Ok(())
    }

    /// The roll that a sideways velocity puts on the view.
    pub fn calc_roll(&self, angles: &Vec3, velocity: &Vec3) -> f32 {
        let (_forward, right, _up) = angle_vectors(angles);
        let mut side = dot_product(velocity, &right);
        let sign = if side < 0.0 { -1.0 } else { 1.0 };
        side = side.abs();

        let value = self.cvar("cl_rollangle");
        let rollspeed = self.cvar("cl_rollspeed");
        if side < rollspeed {
            side = side * value / rollspeed;
        } else {
            side = value;
        }
        side * sign
    }

    /// Turn the client's last move command into velocity on its edict.
    /// The physics pass does the actual moving.
    pub fn client_think(&mut self, slot: usize) -> Result<(), VmError> {
        let e = ServerContext::client_edict(slot);
        let Some(cmd) = self.svs.client(slot).map(|c| c.cmd) else {
            return Ok(());
        };
        if self.edict(e).movetype() == MOVETYPE_NONE {
            return Ok(());
        }

        let mut pm = PlayerMove {
            e,
            cmd,
            onground: self.edict_flags(e).contains(EdictFlags::ONGROUND),
            wishdir: [0.0; 3],
            wishspeed: 0.0,
        };

        self.drop_punch_angle(e);

        // if dead, behave differently
        if self.edict(e).float(ev::HEALTH) <= 0.0 {
            return Ok(());
        }

        // angles
        // show 1/3 the pitch angle and all the roll angle
        let ent = self.edict(e);
        let v_angle = vector_add(&ent.vector(ev::V_ANGLE), &ent.vector(ev::PUNCHANGLE));
        let mut angles = ent.vector(ev::ANGLES);
        angles[ROLL] = self.calc_roll(&angles, &ent.vector(ev::VELOCITY)) * 4.0;
        if ent.float(ev::FIXANGLE) == 0.0 {
            angles[PITCH] = -v_angle[PITCH] / 3.0;
            angles[YAW] = v_angle[YAW];
        }
        self.edict_mut(e).set_vector(ev::ANGLES, &angles);

        if self.edict_flags(e).contains(EdictFlags::WATERJUMP) {
            self.water_jump(e);
            return Ok(());
        }

        // walk
        let ent = self.edict(e);
        if ent.float(ev::WATERLEVEL) >= 2.0 && ent.movetype() != MOVETYPE_NOCLIP {
            self.water_move(&pm);
            return Ok(());
        }

        self.air_move(&mut pm)?;
        if let Some(cl) = self.svs.client_mut(slot) {
            cl.wishdir = pm.wishdir;
        }
        Ok(())
    }

    // ============================================================
    // Client input
    // ============================================================

    fn read_client_move(&mut self, slot: usize, msg: &mut SizeBuf) {
        let e = ServerContext::client_edict(slot);
        let sv_time = self.sv.time;

        // read ping time
        let sent = msg_read_float(msg) as f64;
        let angles = [msg_read_angle(msg), msg_read_angle(msg), msg_read_angle(msg)];
        let cmd = UserCmd {
            viewangles: angles,
            forwardmove: msg_read_short(msg) as f32,
            sidemove: msg_read_short(msg) as f32,
            upmove: msg_read_short(msg) as f32,
        };
        let bits = msg_read_byte(msg);
        let impulse = msg_read_byte(msg);
        if msg.badread {
            return;
        }

        let Some(cl) = self.svs.client_mut(slot) else {
            return;
        };
        cl.ping_times[cl.num_pings % NUM_PING_TIMES] = (sv_time - sent) as f32;
        cl.num_pings += 1;
        cl.cmd = cmd;

        let ent = self.edict_mut(e);
        ent.set_vector(ev::V_ANGLE, &angles);
        ent.set_float(ev::BUTTON0, (bits & 1) as f32);
        ent.set_float(ev::BUTTON2, ((bits & 2) >> 1) as f32);
        if impulse != 0 {
            ent.set_float(ev::IMPULSE, impulse as f32);
        }
    }

    /// Apply every packet queued for the client. Returns false if the
    /// client should be dropped.
    pub fn read_client_message(&mut self, slot: usize) -> Result<bool, HostError> {
        let packets = match self.svs.client_mut(slot) {
            Some(cl) => std::mem::take(&mut cl.incoming),
            None => return Ok(false),
        };

        for mut msg in packets {
            loop {
                if !self.svs.client(slot).map_or(false, |c| c.active) {
                    return Ok(false); // a command caused an error
                }
                if msg.badread {
                    com_printf("SV_ReadClientMessage: badread\n");
                    return Ok(false);
                }

                let cmd = msg_read_char(&mut msg);
                if cmd == -1 {
                    break; // end of message
                }
                match cmd as u8 {
                    CLC_NOP => {}
                    CLC_STRINGCMD => {
                        let s = msg_read_string(&mut msg);
                        self.client_command(slot, &s)?;
                    }
                    CLC_DISCONNECT => return Ok(false),
                    CLC_MOVE => self.read_client_move(slot, &mut msg),
                    _ => {
                        com_printf("SV_ReadClientMessage: unknown command char\n");
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Apply queued input and think for every client.
    pub fn run_clients(&mut self) -> Result<(), HostError> {
        for slot in 0..self.svs.maxclients {
            if !self.svs.client(slot).map_or(false, |c| c.active) {
                continue;
            }
            self.host_client = Some(slot);

            if !self.read_client_message(slot)? {
                self.drop_client(slot, false)?;
                continue;
            }

            let Some(cl) = self.svs.client_mut(slot) else {
                continue;
            };
            if !cl.spawned {
                // clear client movement until a new packet is received
                cl.cmd = UserCmd::default();
                continue;
            }

            if !self.sv.paused {
                let result = self.client_think(slot);
                self.contain_fault(result)?;
            }
        }
        self.host_client = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use assert_approx_eq::assert_approx_eq;
    use myq1_common::cmodel::BrushModel;
    use myq1_common::net::NetAdr;
    use myq1_common::net_chan::{NetChan, NetSrc};
    use std::sync::Arc;

    fn player_context() -> ServerContext {
        let mut ctx = context_with(&ProgsBuilder::new());
        let room = BrushModel::room("maps/test.bsp", &[-256.0; 3], &[256.0; 3]);
        ctx.sv.worldmodel = Arc::new(room);
        ctx.clear_world();
        ctx.host_frametime = 0.1;
        let chan = NetChan::new(NetSrc::Server, NetAdr::Loopback(2), 0, 0.0);
        let mut cl = Client::new(chan, 1);
        cl.spawned = true;
        ctx.svs.clients[0] = Some(cl);

        let ent = ctx.edict_mut(1);
        ent.set_vector(ev::ORIGIN, &[0.0, 0.0, -232.0]);
        ent.set_vector(ev::MINS, &[-16.0, -16.0, -24.0]);
        ent.set_vector(ev::MAXS, &[16.0, 16.0, 32.0]);
        ent.set_vector(ev::VIEW_OFS, &[0.0, 0.0, 22.0]);
        ent.set_float(ev::HEALTH, 100.0);
        ent.set_float(ev::MOVETYPE, MOVETYPE_WALK as f32);
        ent.set_float(ev::SOLID, SOLID_SLIDEBOX as f32);
        ctx.set_edict_flags(1, EdictFlags::ONGROUND | EdictFlags::CLIENT);
        ctx
    }

    fn move_packet(forward: i32, impulse: i32) -> SizeBuf {
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, CLC_MOVE as i32);
        msg_write_float(&mut msg, 0.5);
        for a in [0.0, 90.0, 0.0] {
            msg_write_angle(&mut msg, a);
        }
        msg_write_short(&mut msg, forward);
        msg_write_short(&mut msg, 0);
        msg_write_short(&mut msg, 0);
        msg_write_byte(&mut msg, 3);
        msg_write_byte(&mut msg, impulse);
        msg
    }

    #[test]
    fn test_read_client_move() {
        let mut ctx = player_context();
        ctx.sv.time = 1.0;
        ctx.svs.client_mut(0).unwrap().incoming.push(move_packet(200, 7));
        assert!(ctx.read_client_message(0).unwrap());

        let cl = ctx.svs.client(0).unwrap();
        assert_eq!(cl.cmd.forwardmove, 200.0);
        assert_eq!(cl.num_pings, 1);
        assert_approx_eq!(cl.ping_times[0], 0.5);
        let ent = ctx.edict(1);
        assert_approx_eq!(ent.vector(ev::V_ANGLE)[YAW], 90.0, 1.5);
        assert_eq!(ent.float(ev::BUTTON0), 1.0);
        assert_eq!(ent.float(ev::BUTTON2), 1.0);
        assert_eq!(ent.float(ev::IMPULSE), 7.0);
    }

    #[test]
    fn test_disconnect_and_garbage_end_the_client() {
        let mut ctx = player_context();
        let mut msg = SizeBuf::new(16);
        msg_write_byte(&mut msg, CLC_DISCONNECT as i32);
        ctx.svs.client_mut(0).unwrap().incoming.push(msg);
        assert!(!ctx.read_client_message(0).unwrap());

        let mut msg = SizeBuf::new(16);
        msg_write_byte(&mut msg, 99);
        ctx.svs.client_mut(0).unwrap().incoming.push(msg);
        assert!(!ctx.read_client_message(0).unwrap());

        let mut msg = SizeBuf::new(16);
        msg_write_byte(&mut msg, CLC_NOP as i32);
        ctx.svs.client_mut(0).unwrap().incoming.push(msg);
        assert!(ctx.read_client_message(0).unwrap());
    }

    #[test]
    fn test_walking_accelerates_along_view() {
        let mut ctx = player_context();
        ctx.edict_mut(1).set_vector(ev::V_ANGLE, &[0.0, 0.0, 0.0]);
        ctx.svs.client_mut(0).unwrap().cmd.forwardmove = 200.0;
        ctx.client_think(0).unwrap();

        let vel = ctx.edict(1).vector(ev::VELOCITY);
        // accelerate 10 * 0.1 * 200 = 200, capped by the wish speed
        assert_approx_eq!(vel[0], 200.0, 0.01);
        assert_approx_eq!(vel[1], 0.0, 0.01);
        assert_eq!(vel[2], 0.0);
    }

    #[test]
    fn test_friction_slows_a_standing_player() {
        let mut ctx = player_context();
        ctx.edict_mut(1).set_vector(ev::VELOCITY, &[200.0, 0.0, 0.0]);
        ctx.client_think(0).unwrap();
        // 200 - 0.1 * 200 * 4
        assert_approx_eq!(ctx.edict(1).vector(ev::VELOCITY)[0], 120.0, 0.01);
    }

    #[test]
    fn test_dead_players_only_lose_punch() {
        let mut ctx = player_context();
        let ent = ctx.edict_mut(1);
        ent.set_float(ev::HEALTH, 0.0);
        ent.set_vector(ev::PUNCHANGLE, &[-4.0, 0.0, 0.0]);
        ctx.svs.client_mut(0).unwrap().cmd.forwardmove = 200.0;
        ctx.client_think(0).unwrap();
        assert_eq!(ctx.edict(1).vector(ev::VELOCITY), [0.0; 3]);
        assert_approx_eq!(ctx.edict(1).vector(ev::PUNCHANGLE)[0], -3.0, 0.001);
    }

    #[test]
    fn test_water_drift() {
        let mut ctx = player_context();
        ctx.edict_mut(1).set_float(ev::WATERLEVEL, 2.0);
        ctx.client_think(0).unwrap();
        // sink at 0.7 * 60, limited by one frame of acceleration
        let vel = ctx.edict(1).vector(ev::VELOCITY);
        assert!(vel[2] < 0.0);
        assert_approx_eq!(vel[2], -42.0, 0.01);
    }

    #[test]
    fn test_ideal_pitch_flat_floor() {
        let mut ctx = player_context();
        ctx.edict_mut(1).set_float(ev::IDEALPITCH, 15.0);
        ctx.set_ideal_pitch(1).unwrap();
        assert_eq!(ctx.edict(1).float(ev::IDEALPITCH), 0.0);
    }

    #[test]
    fn test_calc_roll() {
        let ctx = player_context();
        assert_approx_eq!(ctx.calc_roll(&[0.0; 3], &[0.0, -100.0, 0.0]), 1.0, 0.001);
        assert_approx_eq!(ctx.calc_roll(&[0.0; 3], &[0.0, 400.0, 0.0]), -2.0, 0.001);
    }
}
