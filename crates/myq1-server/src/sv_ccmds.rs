// sv_ccmds.rs — client and operator console commands
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.

use myq1_common::common::*;
use myq1_common::q_shared::*;
use myq1_common::qcommon::*;

use crate::progs::{ev, gv};
use crate::server::*;

// items the give command can hand out
const IT_SHOTGUN: i32 = 1;

/// A tokenized command line.
pub struct CmdArgs {
    argv: Vec<String>,
    /// Everything after the command name, untokenized.
    args: String,
}

impl CmdArgs {
    pub fn tokenize(text: &str) -> Self {
        let mut argv = Vec::new();
        let mut args = String::new();
        let mut rest = Some(text);
        while let Some(data) = rest {
            if argv.len() == 1 {
                args = data.trim().to_string();
            }
            let (token, next) = com_parse(data);
            if next.is_none() && token.is_empty() {
                break;
            }
            argv.push(token);
            rest = next;
        }
        Self { argv, args }
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    pub fn argv(&self, i: usize) -> &str {
        self.argv.get(i).map_or("", String::as_str)
    }

    pub fn args(&self) -> &str {
        &self.args
    }
}

/// Split a command buffer into single commands on newlines and semicolons
/// outside of quotes.
pub fn split_commands(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut quotes = false;
    for (i, c) in text.char_indices() {
        match c {
            '"' => quotes = !quotes,
            ';' if !quotes => {
                out.push(&text[start..i]);
                start = i + 1;
            }
            '\n' => {
                out.push(&text[start..i]);
                start = i + 1;
                quotes = false;
            }
            _ => {}
        }
    }
    out.push(&text[start..]);
    out.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

type ClientCmd = fn(&mut ServerContext, usize, &CmdArgs) -> Result<(), HostError>;

/// Commands a connected client may run on the server.
static CLIENT_COMMANDS: &[(&str, ClientCmd)] = &[
    ("status", status_f),
    ("god", god_f),
    ("notarget", notarget_f),
    ("fly", fly_f),
    ("name", name_f),
    ("noclip", noclip_f),
    ("say", say_f),
    ("say_team", say_team_f),
    ("tell", tell_f),
    ("color", color_f),
    ("kill", kill_f),
    ("pause", pause_f),
    ("spawn", spawn_f),
    ("begin", begin_f),
    ("prespawn", prespawn_f),
    ("kick", kick_f),
    ("ping", ping_f),
    ("give", give_f),
    ("ban", ban_f),
];

fn status_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    ctx.status(Some(slot));
    Ok(())
}

fn say_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    ctx.say(Some(slot), cmd, false);
    Ok(())
}

fn say_team_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    ctx.say(Some(slot), cmd, true);
    Ok(())
}

fn kick_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    if !cheats_allowed(ctx) {
        return Ok(());
    }
    ctx.kick(Some(slot), cmd)
}

fn ban_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    if cheats_allowed(ctx) {
        ctx.ban(Some(slot), cmd);
    }
    Ok(())
}

/// Deathmatch keeps the operator-only and cheat commands away from
/// clients.
fn cheats_allowed(ctx: &ServerContext) -> bool {
    ctx.pr.g_float(gv::DEATHMATCH) == 0.0
}

fn toggle_flag(ctx: &mut ServerContext, slot: usize, flag: EdictFlags, what: &str) {
    let e = ServerContext::client_edict(slot);
    let flags = ctx.edict_flags(e) ^ flag;
    ctx.set_edict_flags(e, flags);
    let state = if flags.contains(flag) { "ON" } else { "OFF" };
    ctx.client_printf(slot, &format!("{} {}\n", what, state));
}

fn god_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    if cheats_allowed(ctx) {
        toggle_flag(ctx, slot, EdictFlags::GODMODE, "godmode");
    }
    Ok(())
}

fn notarget_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    if cheats_allowed(ctx) {
        toggle_flag(ctx, slot, EdictFlags::NOTARGET, "notarget");
    }
    Ok(())
}

fn toggle_movetype(ctx: &mut ServerContext, slot: usize, movetype: i32, what: &str) {
    let e = ServerContext::client_edict(slot);
    let ent = ctx.edict_mut(e);
    let on = ent.movetype() != movetype;
    let next = if on { movetype } else { MOVETYPE_WALK };
    ent.set_float(ev::MOVETYPE, next as f32);
    ctx.client_printf(slot, &format!("{} {}\n", what, if on { "ON" } else { "OFF" }));
}

fn fly_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    if cheats_allowed(ctx) {
        toggle_movetype(ctx, slot, MOVETYPE_FLY, "flymode");
    }
    Ok(())
}

fn noclip_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    if cheats_allowed(ctx) {
        toggle_movetype(ctx, slot, MOVETYPE_NOCLIP, "noclip");
    }
    Ok(())
}

fn name_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    let Some(old) = ctx.svs.client(slot).map(|cl| cl.name.clone()) else {
        return Ok(());
    };
    if cmd.argc() == 1 {
        ctx.client_printf(slot, &format!("\"name\" is \"{}\"\n", old));
        return Ok(());
    }

    let raw = if cmd.argc() == 2 { cmd.argv(1) } else { cmd.args() };
    let newname: String = raw.chars().take(15).collect();

    if !old.is_empty() && old != "unconnected" && old != newname {
        com_printf(&format!("{} renamed to {}\n", old, newname));
    }

    let netname = ctx.pr.set_string(&newname);
    ctx.edict_mut(ServerContext::client_edict(slot)).set_string(ev::NETNAME, netname);
    if let Some(cl) = ctx.svs.client_mut(slot) {
        cl.name = newname.clone();
    }

    // send notification to all clients
    let rd = &mut ctx.sv.reliable_datagram;
    msg_write_byte(rd, SVC_UPDATENAME as i32);
    msg_write_byte(rd, slot as i32);
    msg_write_string(rd, &newname);
    Ok(())
}

/// Chat lines are capped at 64 bytes including the color marker and the
/// trailing newline.
fn chat_line(prefix: &str, body: &str) -> String {
    let mut body = body.trim();
    if let Some(stripped) = body.strip_prefix('"') {
        body = stripped.strip_suffix('"').unwrap_or(stripped);
    }
    let room = 64usize.saturating_sub(2 + prefix.len());
    let body: String = body.chars().take(room).collect();
    format!("{}{}\n", prefix, body)
}

fn tell_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    if cmd.argc() < 3 {
        return Ok(());
    }
    let Some(from) = ctx.svs.client(slot).map(|cl| cl.name.clone()) else {
        return Ok(());
    };

    // the message is everything after the target name
    let (_, rest) = com_parse(cmd.args());
    let text = chat_line(&format!("{}: ", from), rest.unwrap_or(""));

    let targets: Vec<usize> = ctx
        .svs
        .active_clients()
        .filter(|&i| {
            ctx.svs
                .client(i)
                .map_or(false, |cl| cl.spawned && cl.name.eq_ignore_ascii_case(cmd.argv(1)))
        })
        .collect();
    for i in targets {
        ctx.client_printf(i, &text);
    }
    Ok(())
}

fn color_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    if cmd.argc() == 1 {
        let colors = ctx.svs.client(slot).map_or(0, |cl| cl.colors);
        ctx.client_printf(slot, &format!("\"color\" is \"{} {}\"\n", colors >> 4, colors & 0x0f));
        return Ok(());
    }

    let (top, bottom) = if cmd.argc() == 2 {
        let c = atoi(cmd.argv(1));
        (c, c)
    } else {
        (atoi(cmd.argv(1)), atoi(cmd.argv(2)))
    };
    let top = (top & 15).min(13);
    let bottom = (bottom & 15).min(13);
    let playercolor = top * 16 + bottom;

    if let Some(cl) = ctx.svs.client_mut(slot) {
        cl.colors = playercolor;
    }
    ctx.edict_mut(ServerContext::client_edict(slot)).set_float(ev::TEAM, (bottom + 1) as f32);

    // send notification to all clients
    let rd = &mut ctx.sv.reliable_datagram;
    msg_write_byte(rd, SVC_UPDATECOLORS as i32);
    msg_write_byte(rd, slot as i32);
    msg_write_byte(rd, playercolor);
    Ok(())
}

fn kill_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    let e = ServerContext::client_edict(slot);
    if ctx.edict(e).float(ev::HEALTH) <= 0.0 {
        ctx.client_printf(slot, "Can't suicide -- allready dead!\n");
        return Ok(());
    }

    ctx.pr.set_g_float(gv::TIME, ctx.sv.time as f32);
    ctx.pr.set_g_edict(gv::SELF, e);
    let client_kill = ctx.pr.g_int(gv::CLIENT_KILL);
    let result = ctx.execute_program(client_kill);
    ctx.contain_fault(result)
}

fn pause_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    if ctx.cvar("pausable") == 0.0 {
        ctx.client_printf(slot, "Pause not allowed.\n");
        return Ok(());
    }

    ctx.sv.paused = !ctx.sv.paused;
    let netname = ctx.edict(ServerContext::client_edict(slot)).string(ev::NETNAME);
    let who = ctx.pr.get_string(netname).into_owned();
    if ctx.sv.paused {
        ctx.broadcast_printf(&format!("{} paused the game\n", who));
    } else {
        ctx.broadcast_printf(&format!("{} unpaused the game\n", who));
    }

    // send notification to all clients
    let rd = &mut ctx.sv.reliable_datagram;
    msg_write_byte(rd, SVC_SETPAUSE as i32);
    msg_write_byte(rd, ctx.sv.paused as i32);
    Ok(())
}

fn prespawn_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    let Some(cl) = ctx.svs.client_mut(slot) else {
        return Ok(());
    };
    if cl.spawned {
        com_printf("prespawn not valid -- allready spawned\n");
        return Ok(());
    }

    cl.message.write(ctx.sv.signon.as_slice());
    msg_write_byte(&mut cl.message, SVC_SIGNONNUM as i32);
    msg_write_byte(&mut cl.message, 2);
    cl.sendsignon = true;
    Ok(())
}

fn spawn_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    let Some(cl) = ctx.svs.client(slot) else {
        return Ok(());
    };
    if cl.spawned {
        com_printf("Spawn not valid -- allready spawned\n");
        return Ok(());
    }
    let (name, colors, parms, connecttime) = (cl.name.clone(), cl.colors, cl.spawn_parms, cl.connecttime);

    // set up the edict
    let e = ServerContext::client_edict(slot);
    let netname = ctx.pr.set_string(&name);
    let ent = ctx.edict_mut(e);
    ent.clear();
    ent.set_float(ev::COLORMAP, e as f32);
    ent.set_float(ev::TEAM, ((colors & 15) + 1) as f32);
    ent.set_string(ev::NETNAME, netname);

    // copy spawn parms out of the client
    ctx.pr.set_spawn_parms(&parms);

    // call the spawn function
    ctx.pr.set_g_float(gv::TIME, ctx.sv.time as f32);
    ctx.pr.set_g_edict(gv::SELF, e);
    let client_connect = ctx.pr.g_int(gv::CLIENT_CONNECT);
    let result = ctx.execute_program(client_connect);
    ctx.contain_fault(result)?;

    if ctx.realtime - connecttime <= ctx.sv.time {
        log::info!("{} entered the game", name);
    }

    let put_client = ctx.pr.g_int(gv::PUT_CLIENT_IN_SERVER);
    let result = ctx.execute_program(put_client);
    ctx.contain_fault(result)?;

    // send all current names, colors, and frag counts
    let mut msg = SizeBuf::new(MAX_MSGLEN);
    msg.allow_overflow = true;

    // send time of update
    msg_write_byte(&mut msg, SVC_TIME as i32);
    msg_write_float(&mut msg, ctx.sv.time as f32);

    for i in 0..ctx.svs.maxclients {
        let (name, frags, colors) = ctx
            .svs
            .client(i)
            .map_or((String::new(), 0, 0), |c| (c.name.clone(), c.old_frags, c.colors));
        msg_write_byte(&mut msg, SVC_UPDATENAME as i32);
        msg_write_byte(&mut msg, i as i32);
        msg_write_string(&mut msg, &name);
        msg_write_byte(&mut msg, SVC_UPDATEFRAGS as i32);
        msg_write_byte(&mut msg, i as i32);
        msg_write_short(&mut msg, frags);
        msg_write_byte(&mut msg, SVC_UPDATECOLORS as i32);
        msg_write_byte(&mut msg, i as i32);
        msg_write_byte(&mut msg, colors);
    }

    // send all current light styles
    for (i, style) in ctx.sv.lightstyles.iter().enumerate() {
        msg_write_byte(&mut msg, SVC_LIGHTSTYLE as i32);
        msg_write_byte(&mut msg, i as i32);
        msg_write_string(&mut msg, style);
    }

    // send some stats
    for (stat, global) in [
        (STAT_TOTALSECRETS, gv::TOTAL_SECRETS),
        (STAT_TOTALMONSTERS, gv::TOTAL_MONSTERS),
        (STAT_SECRETS, gv::FOUND_SECRETS),
        (STAT_MONSTERS, gv::KILLED_MONSTERS),
    ] {
        msg_write_byte(&mut msg, SVC_UPDATESTAT as i32);
        msg_write_byte(&mut msg, stat as i32);
        msg_write_long(&mut msg, ctx.pr.g_float(global) as i32);
    }

    // send a fixangle; never send a roll angle, because savegames can
    // catch the server in a state where it is expecting the client to
    // correct the angle and it won't happen if the game was just loaded
    let angles = ctx.edict(e).vector(ev::ANGLES);
    msg_write_byte(&mut msg, SVC_SETANGLE as i32);
    msg_write_angle(&mut msg, angles[0]);
    msg_write_angle(&mut msg, angles[1]);
    msg_write_angle(&mut msg, 0.0);

    let result = ctx.write_client_data_to_message(e, &mut msg);
    ctx.contain_fault(result)?;

    msg_write_byte(&mut msg, SVC_SIGNONNUM as i32);
    msg_write_byte(&mut msg, 3);

    if let Some(cl) = ctx.svs.client_mut(slot) {
        cl.message = msg;
        cl.sendsignon = true;
    }
    Ok(())
}

fn begin_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    if let Some(cl) = ctx.svs.client_mut(slot) {
        cl.spawned = true;
    }
    Ok(())
}

fn ping_f(ctx: &mut ServerContext, slot: usize, _: &CmdArgs) -> Result<(), HostError> {
    let lines: Vec<String> = ctx
        .svs
        .active_clients()
        .filter_map(|i| ctx.svs.client(i))
        .map(|cl| format!("{:4} {}\n", (cl.ping() * 1000.0) as i32, cl.name))
        .collect();
    ctx.client_printf(slot, "Client ping times:\n");
    for line in lines {
        ctx.client_printf(slot, &line);
    }
    Ok(())
}

fn give_f(ctx: &mut ServerContext, slot: usize, cmd: &CmdArgs) -> Result<(), HostError> {
    if !cheats_allowed(ctx) {
        return Ok(());
    }

    let item = cmd.argv(1).chars().next().unwrap_or('\0');
    let v = atoi(cmd.argv(2)) as f32;
    let ent = ctx.edict_mut(ServerContext::client_edict(slot));

    match item {
        '0'..='9' => {
            if item >= '2' {
                let bit = IT_SHOTGUN << (item as i32 - '2' as i32);
                let items = ent.float(ev::ITEMS) as i32 | bit;
                ent.set_float(ev::ITEMS, items as f32);
            }
        }
        's' => ent.set_float(ev::AMMO_SHELLS, v),
        'n' => ent.set_float(ev::AMMO_NAILS, v),
        'r' => ent.set_float(ev::AMMO_ROCKETS, v),
        'h' => ent.set_float(ev::HEALTH, v),
        'c' => ent.set_float(ev::AMMO_CELLS, v),
        _ => {}
    }
    Ok(())
}

/// Leading integer of `s`, 0 if there is none.
fn atoi(s: &str) -> i32 {
    crate::sv_edict::atof(s) as i32
}

impl ServerContext {
    fn reply(&mut self, slot: Option<usize>, s: &str) {
        match slot {
            Some(slot) => self.client_printf(slot, s),
            None => com_printf(s),
        }
    }

    /// Run a string command from a client. Anything outside the allowed
    /// set is logged and ignored.
    pub fn client_command(&mut self, slot: usize, text: &str) -> Result<(), HostError> {
        let cmd = CmdArgs::tokenize(text);
        if cmd.argc() == 0 {
            return Ok(());
        }

        let prev = self.host_client.replace(slot);
        let result = match CLIENT_COMMANDS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(cmd.argv(0)))
        {
            Some(&(_, func)) => func(self, slot, &cmd),
            None => {
                let name = self.svs.client(slot).map_or("", |cl| cl.name.as_str());
                com_dprintf(&format!("{} tried to {}\n", name, text));
                Ok(())
            }
        };
        self.host_client = prev;
        result
    }

    /// Server and player list, to a client or the console.
    pub fn status(&mut self, slot: Option<usize>) {
        let mut lines = vec![
            format!("host:    {}\n", self.cvars.variable_string("hostname")),
            format!("version: {:4.2}\n", VERSION),
        ];
        if let Some(driver) = self.svs.driver.as_deref() {
            lines.push(format!("address: {}\n", driver.local_address()));
        }
        lines.push(format!("map:     {}\n", self.sv.name));
        lines.push(format!(
            "players: {} active ({} max)\n\n",
            self.svs.active_clients().count(),
            self.svs.maxclients
        ));

        for i in self.svs.active_clients() {
            let Some(cl) = self.svs.client(i) else { continue };
            let seconds = (self.realtime - cl.connecttime).max(0.0) as i32;
            let (hours, minutes, seconds) = (seconds / 3600, (seconds / 60) % 60, seconds % 60);
            let frags = self.edict(cl.edict).float(ev::FRAGS) as i32;
            lines.push(format!(
                "#{:<2} {:<16.16}  {:3}  {:2}:{:02}:{:02}\n",
                i + 1,
                cl.name,
                frags,
                hours,
                minutes,
                seconds
            ));
            lines.push(format!("   {}\n", cl.netchan.remote_address));
        }

        for line in lines {
            self.reply(slot, &line);
        }
    }

    /// Chat. From the console the line is tagged with the hostname.
    pub fn say(&mut self, slot: Option<usize>, cmd: &CmdArgs, teamonly: bool) {
        if cmd.argc() < 2 {
            return;
        }

        let prefix = match slot.and_then(|s| self.svs.client(s)) {
            Some(cl) => format!("\u{1}{}: ", cl.name),
            None => format!("\u{1}<{}> ", self.cvars.variable_string("hostname")),
        };
        let text = chat_line(&prefix, cmd.args());

        let team = slot.map(|s| self.edict(ServerContext::client_edict(s)).float(ev::TEAM));
        let teamplay = self.cvar("teamplay") != 0.0;
        let targets: Vec<usize> = self
            .svs
            .active_clients()
            .filter(|&i| self.svs.client(i).map_or(false, |cl| cl.spawned))
            .filter(|&i| {
                !(teamplay && teamonly)
                    || team == Some(self.edict(ServerContext::client_edict(i)).float(ev::TEAM))
            })
            .collect();
        for i in targets {
            self.client_printf(i, &text);
        }
        log::info!("{}", text[1..].trim_end());
    }

    /// `kick <name> [message]` or `kick # <slot> [message]`.
    pub fn kick(&mut self, from: Option<usize>, cmd: &CmdArgs) -> Result<(), HostError> {
        if cmd.argc() < 2 {
            return Ok(());
        }

        let (target, message) = if cmd.argc() > 2 && cmd.argv(1) == "#" {
            let n = atoi(cmd.argv(2)) - 1;
            if n < 0 || n as usize >= self.svs.maxclients {
                return Ok(());
            }
            let rest: Vec<&str> = (3..cmd.argc()).map(|i| cmd.argv(i)).collect();
            (Some(n as usize), rest.join(" "))
        } else {
            let target = self.svs.active_clients().find(|&i| {
                self.svs
                    .client(i)
                    .map_or(false, |cl| cl.name.eq_ignore_ascii_case(cmd.argv(1)))
            });
            let rest: Vec<&str> = (2..cmd.argc()).map(|i| cmd.argv(i)).collect();
            (target, rest.join(" "))
        };

        let Some(target) = target.filter(|&t| self.svs.client(t).map_or(false, |cl| cl.active)) else {
            return Ok(());
        };
        // can't kick yourself!
        if Some(target) == from {
            return Ok(());
        }

        let who = match from.and_then(|s| self.svs.client(s)) {
            Some(cl) => cl.name.clone(),
            None => "Console".to_string(),
        };
        if message.is_empty() {
            self.client_printf(target, &format!("Kicked by {}\n", who));
        } else {
            self.client_printf(target, &format!("Kicked by {}: {}\n", who, message));
        }
        self.drop_client(target, false)
    }

    /// `ban` lists, `ban off` clears, `ban <address>` adds.
    pub fn ban(&mut self, from: Option<usize>, cmd: &CmdArgs) {
        match cmd.argc() {
            1 => {
                let text = if self.svs.banned.is_empty() {
                    "Banning not active\n".to_string()
                } else {
                    format!("Banned: {}\n", self.svs.banned.join(" "))
                };
                self.reply(from, &text);
            }
            _ if cmd.argv(1).eq_ignore_ascii_case("off") => self.svs.banned.clear(),
            _ => {
                let adr = cmd.argv(1).to_string();
                if !self.svs.banned.contains(&adr) {
                    log::info!("banned {}", adr);
                    self.svs.banned.push(adr);
                }
            }
        }
    }

    /// Run one operator command from the host command buffer.
    pub fn host_command(&mut self, text: &str) -> Result<(), HostError> {
        let cmd = CmdArgs::tokenize(text);
        if cmd.argc() == 0 {
            return Ok(());
        }

        match cmd.argv(0).to_ascii_lowercase().as_str() {
            "status" => self.status(None),
            "say" => self.say(None, &cmd, false),
            "kick" => {
                if self.sv.active {
                    self.kick(None, &cmd)?;
                }
            }
            "ban" => self.ban(None, &cmd),
            "map" => {
                if cmd.argc() < 2 {
                    com_printf("map <levelname> : continue game on a new level\n");
                    return Ok(());
                }
                self.shutdown_server(false);
                self.svs.serverflags = 0; // haven't completed an episode yet
                self.spawn_server(cmd.argv(1))?;
            }
            "changelevel" => {
                if cmd.argc() != 2 {
                    com_printf("changelevel <levelname> : continue game on a new level\n");
                    return Ok(());
                }
                if !self.sv.active {
                    com_printf("Only the server may changelevel\n");
                    return Ok(());
                }
                self.save_spawn_parms()?;
                self.spawn_server(cmd.argv(1))?;
            }
            "restart" => {
                if !self.sv.active {
                    return Ok(());
                }
                let mapname = self.sv.name.clone();
                self.spawn_server(&mapname)?;
            }
            name => {
                // anything else may be a variable
                if self.cvars.find_var(name).is_none() {
                    com_printf(&format!("Unknown command \"{}\"\n", cmd.argv(0)));
                } else if cmd.argc() == 1 {
                    let value = self.cvars.variable_string(name).to_string();
                    com_printf(&format!("\"{}\" is \"{}\"\n", name, value));
                } else {
                    self.cvars.set(name, cmd.argv(1));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::{context_with, ProgsBuilder};
    use myq1_common::net::NetAdr;
    use myq1_common::net_chan::{NetChan, NetSrc};

    fn connected(maxclients: usize) -> ServerContext {
        let mut ctx = context_with(&ProgsBuilder::new());
        ctx.set_maxclients(maxclients);
        ctx.cvars.set("deathmatch", "0");
        while ctx.sv.edicts.len() <= maxclients {
            ctx.sv.edicts.push(crate::sv_edict::Edict::new(ctx.pr.entityfields()));
        }
        for i in 0..maxclients {
            let chan = NetChan::new(NetSrc::Server, NetAdr::Loopback(10 + i as u16), 0, 0.0);
            let mut cl = Client::new(chan, i + 1);
            cl.name = format!("player{}", i);
            cl.spawned = true;
            ctx.svs.clients[i] = Some(cl);
        }
        ctx.sv.active = true;
        ctx
    }

    fn printed(ctx: &mut ServerContext, slot: usize) -> Vec<String> {
        let cl = ctx.svs.client_mut(slot).unwrap();
        let mut msg = cl.message.clone();
        cl.message.clear();
        msg_begin_reading(&mut msg);
        let mut out = Vec::new();
        while msg.readcount < msg.cursize {
            if msg_read_byte(&mut msg) != SVC_PRINT as i32 {
                break;
            }
            out.push(msg_read_string(&mut msg));
        }
        out
    }

    #[test]
    fn test_tokenize_keeps_rest_of_line() {
        let cmd = CmdArgs::tokenize("say \"hello there\" all");
        assert_eq!(cmd.argc(), 3);
        assert_eq!(cmd.argv(0), "say");
        assert_eq!(cmd.argv(1), "hello there");
        assert_eq!(cmd.args(), "\"hello there\" all");
        assert_eq!(cmd.argv(7), "");
    }

    #[test]
    fn test_split_commands() {
        assert_eq!(
            split_commands("map e1m1; say \"a;b\"\nrestart\n"),
            vec!["map e1m1", "say \"a;b\"", "restart"]
        );
    }

    #[test]
    fn test_god_toggles_and_is_blocked_in_deathmatch() {
        let mut ctx = connected(1);
        ctx.client_command(0, "god").unwrap();
        assert!(ctx.edict_flags(1).contains(EdictFlags::GODMODE));
        assert_eq!(printed(&mut ctx, 0), vec!["godmode ON\n"]);
        ctx.client_command(0, "god").unwrap();
        assert!(!ctx.edict_flags(1).contains(EdictFlags::GODMODE));

        ctx.pr.set_g_float(gv::DEATHMATCH, 1.0);
        ctx.client_command(0, "noclip").unwrap();
        assert_eq!(ctx.edict(1).movetype(), MOVETYPE_NONE);
    }

    #[test]
    fn test_noclip_and_fly_toggle_movetype() {
        let mut ctx = connected(1);
        ctx.edict_mut(1).set_float(ev::MOVETYPE, MOVETYPE_WALK as f32);
        ctx.client_command(0, "noclip").unwrap();
        assert_eq!(ctx.edict(1).movetype(), MOVETYPE_NOCLIP);
        ctx.client_command(0, "fly").unwrap();
        assert_eq!(ctx.edict(1).movetype(), MOVETYPE_FLY);
        ctx.client_command(0, "fly").unwrap();
        assert_eq!(ctx.edict(1).movetype(), MOVETYPE_WALK);
    }

    #[test]
    fn test_name_truncates_and_broadcasts() {
        let mut ctx = connected(1);
        ctx.client_command(0, "name \"A very long player name\"").unwrap();
        let name = ctx.svs.client(0).unwrap().name.clone();
        assert_eq!(name, "A very long pla");
        assert_eq!(ctx.pr.get_string(ctx.edict(1).string(ev::NETNAME)), name);

        let mut rd = ctx.sv.reliable_datagram.clone();
        msg_begin_reading(&mut rd);
        assert_eq!(msg_read_byte(&mut rd), SVC_UPDATENAME as i32);
        assert_eq!(msg_read_byte(&mut rd), 0);
        assert_eq!(msg_read_string(&mut rd), name);
    }

    #[test]
    fn test_color_clamps_and_sets_team() {
        let mut ctx = connected(1);
        ctx.client_command(0, "color 15 4").unwrap();
        assert_eq!(ctx.svs.client(0).unwrap().colors, 13 * 16 + 4);
        assert_eq!(ctx.edict(1).float(ev::TEAM), 5.0);
        assert_eq!(
            ctx.sv.reliable_datagram.as_slice(),
            &[SVC_UPDATECOLORS, 0, 13 * 16 + 4]
        );
    }

    #[test]
    fn test_say_reaches_spawned_clients() {
        let mut ctx = connected(2);
        ctx.client_command(0, "say \"hi all\"").unwrap();
        assert_eq!(printed(&mut ctx, 1), vec!["\u{1}player0: hi all\n"]);
        assert_eq!(printed(&mut ctx, 0), vec!["\u{1}player0: hi all\n"]);

        ctx.svs.client_mut(1).unwrap().spawned = false;
        ctx.client_command(0, "say again").unwrap();
        assert!(printed(&mut ctx, 1).is_empty());
    }

    #[test]
    fn test_say_team_filters_by_team() {
        let mut ctx = connected(2);
        ctx.cvars.set("teamplay", "1");
        ctx.edict_mut(1).set_float(ev::TEAM, 1.0);
        ctx.edict_mut(2).set_float(ev::TEAM, 2.0);
        ctx.client_command(0, "say_team go").unwrap();
        assert!(printed(&mut ctx, 1).is_empty());
        assert_eq!(printed(&mut ctx, 0).len(), 1);
    }

    #[test]
    fn test_tell_reaches_only_target() {
        let mut ctx = connected(3);
        ctx.client_command(0, "tell PLAYER2 meet me").unwrap();
        assert_eq!(printed(&mut ctx, 2), vec!["player0: meet me\n"]);
        assert!(printed(&mut ctx, 1).is_empty());
    }

    #[test]
    fn test_kill_when_dead() {
        let mut ctx = connected(1);
        ctx.client_command(0, "kill").unwrap();
        assert_eq!(printed(&mut ctx, 0), vec!["Can't suicide -- allready dead!\n"]);
    }

    #[test]
    fn test_pause_toggles() {
        let mut ctx = connected(1);
        ctx.client_command(0, "pause").unwrap();
        assert!(ctx.sv.paused);
        assert_eq!(ctx.sv.reliable_datagram.as_slice(), &[SVC_SETPAUSE, 1]);

        ctx.sv.reliable_datagram.clear();
        ctx.cvars.set("pausable", "0");
        ctx.client_command(0, "pause").unwrap();
        assert!(ctx.sv.paused);
        assert!(ctx.sv.reliable_datagram.is_empty());
    }

    #[test]
    fn test_prespawn_sends_signon() {
        let mut ctx = connected(1);
        ctx.svs.client_mut(0).unwrap().spawned = false;
        ctx.sv.signon.write(&[SVC_NOP]);
        ctx.client_command(0, "prespawn").unwrap();
        let cl = ctx.svs.client(0).unwrap();
        assert_eq!(cl.message.as_slice(), &[SVC_NOP, SVC_SIGNONNUM, 2]);
        assert!(cl.sendsignon);
    }

    #[test]
    fn test_spawn_writes_signon_three() {
        let mut ctx = connected(1);
        ctx.svs.client_mut(0).unwrap().spawned = false;
        ctx.svs.client_mut(0).unwrap().colors = 0x34;
        ctx.sv.model_precache = vec![String::new()];
        ctx.client_command(0, "spawn").unwrap();

        assert_eq!(ctx.edict(1).float(ev::COLORMAP), 1.0);
        assert_eq!(ctx.edict(1).float(ev::TEAM), 5.0);
        let msg = ctx.svs.client(0).unwrap().message.as_slice().to_vec();
        assert_eq!(msg[0], SVC_TIME);
        assert_eq!(&msg[msg.len() - 2..], &[SVC_SIGNONNUM, 3]);

        ctx.client_command(0, "begin").unwrap();
        assert!(ctx.svs.client(0).unwrap().spawned);
    }

    #[test]
    fn test_give_items_and_ammo() {
        let mut ctx = connected(1);
        ctx.client_command(0, "give 4 0").unwrap();
        ctx.client_command(0, "give s 25").unwrap();
        ctx.client_command(0, "give h 150").unwrap();
        assert_eq!(ctx.edict(1).float(ev::ITEMS) as i32, IT_SHOTGUN << 2);
        assert_eq!(ctx.edict(1).float(ev::AMMO_SHELLS), 25.0);
        assert_eq!(ctx.edict(1).float(ev::HEALTH), 150.0);
    }

    #[test]
    fn test_unknown_command_is_ignored() {
        let mut ctx = connected(1);
        ctx.client_command(0, "quit").unwrap();
        assert!(ctx.svs.client(0).unwrap().message.is_empty());
    }

    #[test]
    fn test_ban_list() {
        let mut ctx = connected(1);
        ctx.host_command("ban 10.0.0.1").unwrap();
        ctx.host_command("ban 10.0.0.1").unwrap();
        assert_eq!(ctx.svs.banned, vec!["10.0.0.1".to_string()]);
        ctx.client_command(0, "ban").unwrap();
        assert_eq!(printed(&mut ctx, 0), vec!["Banned: 10.0.0.1\n"]);
        ctx.host_command("ban off").unwrap();
        assert!(ctx.svs.banned.is_empty());
    }

    #[test]
    fn test_host_command_sets_cvar() {
        let mut ctx = connected(1);
        ctx.host_command("sv_gravity 100").unwrap();
        assert_eq!(ctx.cvar("sv_gravity"), 100.0);
        ctx.host_command("no_such_thing").unwrap();
    }
}
