// cl_input.rs — builds an intended movement command to send to the server
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::client::*;

// ============================================================
// KEY BUTTONS
//
// Continuous button event tracking is complicated by the fact that two
// different input sources (say, mouse button 1 and the control key) can
// both press the same button, but the button should only be released
// when both of the pressing keys have been released.
//
// When a key event issues a button command (+forward, +attack, etc), it
// appends its key number so it can be matched up with the release.
//
// state bit 0 is the current state of the key
// state bit 1 is edge triggered on the up to down transition
// state bit 2 is edge triggered on the down to up transition
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct KButton {
    pub down: [i32; 2], // key nums holding it down
    pub state: i32,
}

impl KButton {
    /// `key` is -1 when typed at the console for continuous down.
    pub fn key_down(&mut self, key: i32) {
        if key == self.down[0] || key == self.down[1] {
            return; // repeating key
        }

        if self.down[0] == 0 {
            self.down[0] = key;
        } else if self.down[1] == 0 {
            self.down[1] = key;
        } else {
            com_printf("Three keys down for a button!\n");
            return;
        }

        if self.state & 1 != 0 {
            return; // still down
        }
        self.state |= 1 + 2; // down + impulse down
    }

    /// `key` of -1 releases the button no matter what holds it.
    pub fn key_up(&mut self, key: i32) {
        if key == -1 {
            // typed manually at the console, assume for unsticking, so clear all
            self.down = [0, 0];
            self.state = 4; // impulse up
            return;
        }

        if self.down[0] == key {
            self.down[0] = 0;
        } else if self.down[1] == key {
            self.down[1] = 0;
        } else {
            return; // key up without coresponding down (menu pass through)
        }
        if self.down[0] != 0 || self.down[1] != 0 {
            return; // some other key is still holding it down
        }

        if self.state & 1 == 0 {
            return; // still up (this should not happen)
        }
        self.state &= !1; // now up
        self.state |= 4; // impulse up
    }

    /// Fraction of the frame the key was down: 0.25 for a tap, 0.5 for a
    /// fresh press, 1.0 for a key held all frame. Clears the impulses.
    pub fn key_state(&mut self) -> f32 {
        let impulsedown = self.state & 2 != 0;
        let impulseup = self.state & 4 != 0;
        let down = self.state & 1 != 0;

        let val = match (impulsedown, impulseup, down) {
            // pressed and held this frame
            (true, false, true) => 0.5,
            // released this frame
            (false, true, false) => 0.0,
            // held the entire frame
            (false, false, true) => 1.0,
            // up the entire frame
            (false, false, false) => 0.0,
            // pressed and released this frame
            (true, true, false) => 0.25,
            // released and re-pressed this frame
            (true, true, true) => 0.75,
            _ => 0.0,
        };

        self.state &= 1; // clear impulses
        val
    }
}

/// Every continuous button the player can hold.
#[derive(Debug, Clone, Default)]
pub struct InputButtons {
    pub in_mlook: KButton,
    pub in_klook: KButton,
    pub in_left: KButton,
    pub in_right: KButton,
    pub in_forward: KButton,
    pub in_back: KButton,
    pub in_lookup: KButton,
    pub in_lookdown: KButton,
    pub in_moveleft: KButton,
    pub in_moveright: KButton,
    pub in_strafe: KButton,
    pub in_speed: KButton,
    pub in_use: KButton,
    pub in_jump: KButton,
    pub in_attack: KButton,
    pub in_up: KButton,
    pub in_down: KButton,
    pub in_impulse: i32,
}

impl InputButtons {
    /// Look up a button by its console name, without the +/- prefix.
    pub fn button_mut(&mut self, name: &str) -> Option<&mut KButton> {
        Some(match name {
            "mlook" => &mut self.in_mlook,
            "klook" => &mut self.in_klook,
            "left" => &mut self.in_left,
            "right" => &mut self.in_right,
            "forward" => &mut self.in_forward,
            "back" => &mut self.in_back,
            "lookup" => &mut self.in_lookup,
            "lookdown" => &mut self.in_lookdown,
            "moveleft" => &mut self.in_moveleft,
            "moveright" => &mut self.in_moveright,
            "strafe" => &mut self.in_strafe,
            "speed" => &mut self.in_speed,
            "use" => &mut self.in_use,
            "jump" => &mut self.in_jump,
            "attack" => &mut self.in_attack,
            "moveup" => &mut self.in_up,
            "movedown" => &mut self.in_down,
            _ => return None,
        })
    }

    /// Apply a `+name`/`-name [key]` or `impulse n` command. Returns false
    /// if the command isn't an input command.
    pub fn command(&mut self, text: &str) -> bool {
        let mut args = text.split_whitespace();
        let Some(cmd) = args.next() else {
            return false;
        };
        let key = args.next().and_then(|k| k.parse().ok()).unwrap_or(-1);

        if cmd == "impulse" {
            self.in_impulse = key.max(0);
            return true;
        }
        if let Some(name) = cmd.strip_prefix('+') {
            if let Some(b) = self.button_mut(name) {
                b.key_down(key);
                return true;
            }
        } else if let Some(name) = cmd.strip_prefix('-') {
            if let Some(b) = self.button_mut(name) {
                b.key_up(key);
                return true;
            }
        }
        false
    }
}

impl ClientContext {
    /// Moves the local angle positions.
    pub fn adjust_angles(&mut self, buttons: &mut InputButtons) {
        let frametime = self.host_frametime as f32;
        let speed = if buttons.in_speed.state & 1 != 0 {
            frametime * self.cvar("cl_anglespeedkey")
        } else {
            frametime
        };
        let yawspeed = self.cvar("cl_yawspeed");
        let pitchspeed = self.cvar("cl_pitchspeed");
        let va = &mut self.cl.viewangles;

        if buttons.in_strafe.state & 1 == 0 {
            va[YAW] -= speed * yawspeed * buttons.in_right.key_state();
            va[YAW] += speed * yawspeed * buttons.in_left.key_state();
            va[YAW] = anglemod(va[YAW]);
        }
        if buttons.in_klook.state & 1 != 0 {
            va[PITCH] -= speed * pitchspeed * buttons.in_forward.key_state();
            va[PITCH] += speed * pitchspeed * buttons.in_back.key_state();
        }

        let up = buttons.in_lookup.key_state();
        let down = buttons.in_lookdown.key_state();
        va[PITCH] -= speed * pitchspeed * up;
        va[PITCH] += speed * pitchspeed * down;

        va[PITCH] = va[PITCH].clamp(-70.0, 80.0);
        va[ROLL] = va[ROLL].clamp(-50.0, 50.0);
    }

    /// Movement intended by the held buttons.
    pub fn base_move(&mut self, buttons: &mut InputButtons) -> UserCmd {
        if self.cls.signon != SIGNONS {
            return UserCmd::default();
        }

        self.adjust_angles(buttons);

        let sidespeed = self.cvar("cl_sidespeed");
        let upspeed = self.cvar("cl_upspeed");
        let forwardspeed = self.cvar("cl_forwardspeed");
        let backspeed = self.cvar("cl_backspeed");

        let mut cmd = UserCmd { viewangles: self.cl.viewangles, ..Default::default() };

        if buttons.in_strafe.state & 1 != 0 {
            cmd.sidemove += sidespeed * buttons.in_right.key_state();
            cmd.sidemove -= sidespeed * buttons.in_left.key_state();
        }
        cmd.sidemove += sidespeed * buttons.in_moveright.key_state();
        cmd.sidemove -= sidespeed * buttons.in_moveleft.key_state();

        cmd.upmove += upspeed * buttons.in_up.key_state();
        cmd.upmove -= upspeed * buttons.in_down.key_state();

        if buttons.in_klook.state & 1 == 0 {
            cmd.forwardmove += forwardspeed * buttons.in_forward.key_state();
            cmd.forwardmove -= backspeed * buttons.in_back.key_state();
        }

        // adjust for speed key
        if buttons.in_speed.state & 1 != 0 {
            let scale = self.cvar("cl_movespeedkey");
            cmd.forwardmove *= scale;
            cmd.sidemove *= scale;
            cmd.upmove *= scale;
        }
        cmd
    }

    /// Encode a `clc_move`. The first two after a level change are
    /// dropped because they may hold input from the previous level.
    pub fn send_move(&mut self, cmd: &UserCmd, buttons: &mut InputButtons) -> Option<SizeBuf> {
        self.cl.cmd = *cmd;

        let mut buf = SizeBuf::new(128);
        msg_write_byte(&mut buf, CLC_MOVE as i32);

        // so server can get ping times
        msg_write_float(&mut buf, self.cl.mtime[0] as f32);

        for a in self.cl.viewangles {
            msg_write_angle(&mut buf, a);
        }

        msg_write_short(&mut buf, cmd.forwardmove as i32);
        msg_write_short(&mut buf, cmd.sidemove as i32);
        msg_write_short(&mut buf, cmd.upmove as i32);

        // send button bits
        let mut bits = 0;
        if buttons.in_attack.state & 3 != 0 {
            bits |= 1;
        }
        buttons.in_attack.state &= !2;
        if buttons.in_jump.state & 3 != 0 {
            bits |= 2;
        }
        buttons.in_jump.state &= !2;
        msg_write_byte(&mut buf, bits);

        msg_write_byte(&mut buf, buttons.in_impulse);
        buttons.in_impulse = 0;

        // always dump the first two messages, because they may contain
        // leftover inputs from the last level
        self.cl.movemessages += 1;
        if self.cl.movemessages <= 2 {
            return None;
        }
        Some(buf)
    }
}
