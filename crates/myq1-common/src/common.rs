// common.rs — misc functions used in client and server

use crate::q_shared::Vec3;
use crate::qcommon::{ProtocolError, SizeBuf};

use std::borrow::Cow;

// ============================================================
// Com_Printf / Com_DPrintf
// ============================================================

/// Install the `env_logger` backend. `RUST_LOG` overrides the default
/// `info` filter. Safe to call more than once.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

/// General-purpose console print.
pub fn com_printf(msg: &str) {
    log::info!("{}", msg.trim_end_matches('\n'));
}

/// Developer-only print.
pub fn com_dprintf(msg: &str) {
    log::debug!("{}", msg.trim_end_matches('\n'));
}

// ============================================================
// SizeBuf operations
// ============================================================

impl SizeBuf {
    /// Reserve `length` bytes and return the start offset.
    ///
    /// On overflow the buffer is cleared and flagged when overflow is
    /// allowed; otherwise nothing is written and `None` is returned with
    /// `overflowed` set so the owner can report the capacity error.
    pub fn get_space(&mut self, length: usize) -> Option<usize> {
        if self.cursize + length > self.maxsize {
            if !self.allow_overflow {
                log::error!("SZ_GetSpace: overflow without allowoverflow set");
                self.overflowed = true;
                return None;
            }
            if length > self.maxsize {
                log::error!("SZ_GetSpace: {} is > full buffer size", length);
                self.overflowed = true;
                return None;
            }
            com_printf("SZ_GetSpace: overflow\n");
            self.clear();
            self.overflowed = true;
        }

        let start = self.cursize;
        self.cursize += length;
        Some(start)
    }

    /// Write raw bytes into the buffer.
    pub fn write(&mut self, src: &[u8]) {
        if let Some(start) = self.get_space(src.len()) {
            self.data[start..start + src.len()].copy_from_slice(src);
        }
    }

    /// Append a null-terminated string, merging with a trailing null.
    pub fn print(&mut self, s: &str) {
        let bytes = &string_bytes(s)[..];
        if self.cursize > 0 && self.data[self.cursize - 1] == 0 {
            if let Some(start) = self.get_space(bytes.len()) {
                let dest = start - 1;
                self.data[dest..dest + bytes.len()].copy_from_slice(bytes);
                self.data[dest + bytes.len()] = 0;
            }
        } else if let Some(start) = self.get_space(bytes.len() + 1) {
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
            self.data[start + bytes.len()] = 0;
        }
    }
}

// ============================================================
// Game text
//
// Text on the wire and in program string tables is one byte per
// character, with the high half used for the game's own glyphs. In
// memory each byte is the char with the same code point (U+0000 to
// U+00FF).
// ============================================================

/// Game bytes for `s`. Chars above U+00FF have no byte and become '?'.
pub fn string_bytes(s: &str) -> Vec<u8> {
    s.chars().map(|c| u8::try_from(c).unwrap_or(b'?')).collect()
}

/// Text for game bytes, borrowed when they are plain ASCII.
pub fn bytes_string(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) if bytes.is_ascii() => Cow::Borrowed(s),
        _ => Cow::Owned(bytes.iter().map(|&b| b as char).collect()),
    }
}

// ============================================================
// MSG write functions
// ============================================================

pub fn msg_write_char(sb: &mut SizeBuf, c: i32) {
    if let Some(start) = sb.get_space(1) {
        sb.data[start] = c as i8 as u8;
    }
}

pub fn msg_write_byte(sb: &mut SizeBuf, c: i32) {
    if let Some(start) = sb.get_space(1) {
        sb.data[start] = c as u8;
    }
}

pub fn msg_write_short(sb: &mut SizeBuf, c: i32) {
    if let Some(start) = sb.get_space(2) {
        sb.data[start..start + 2].copy_from_slice(&(c as i16).to_le_bytes());
    }
}

pub fn msg_write_long(sb: &mut SizeBuf, c: i32) {
    if let Some(start) = sb.get_space(4) {
        sb.data[start..start + 4].copy_from_slice(&c.to_le_bytes());
    }
}

pub fn msg_write_float(sb: &mut SizeBuf, f: f32) {
    if let Some(start) = sb.get_space(4) {
        sb.data[start..start + 4].copy_from_slice(&f.to_le_bytes());
    }
}

pub fn msg_write_string(sb: &mut SizeBuf, s: &str) {
    sb.write(&string_bytes(s));
    sb.write(&[0]);
}

/// Coordinates travel as 13.3 fixed point.
pub fn msg_write_coord(sb: &mut SizeBuf, f: f32) {
    msg_write_short(sb, (f * 8.0) as i32);
}

pub fn msg_write_pos(sb: &mut SizeBuf, pos: &Vec3) {
    for v in pos {
        msg_write_coord(sb, *v);
    }
}

/// Angles travel as one byte, 360/256 degree steps.
pub fn msg_write_angle(sb: &mut SizeBuf, f: f32) {
    msg_write_byte(sb, ((f * 256.0 / 360.0) as i32) & 255);
}

// ============================================================
// MSG read functions
//
// Reading past the end returns -1 and sets `badread`.
// ============================================================

pub fn msg_begin_reading(msg: &mut SizeBuf) {
    msg.readcount = 0;
    msg.badread = false;
}

fn msg_take<const N: usize>(msg: &mut SizeBuf) -> Option<[u8; N]> {
    let rc = msg.readcount;
    if rc + N > msg.cursize {
        msg.badread = true;
        return None;
    }
    msg.readcount += N;
    let mut out = [0u8; N];
    out.copy_from_slice(&msg.data[rc..rc + N]);
    Some(out)
}

pub fn msg_read_char(msg: &mut SizeBuf) -> i32 {
    msg_take::<1>(msg).map_or(-1, |b| b[0] as i8 as i32)
}

pub fn msg_read_byte(msg: &mut SizeBuf) -> i32 {
    msg_take::<1>(msg).map_or(-1, |b| b[0] as i32)
}

pub fn msg_read_short(msg: &mut SizeBuf) -> i32 {
    msg_take::<2>(msg).map_or(-1, |b| i16::from_le_bytes(b) as i32)
}

pub fn msg_read_long(msg: &mut SizeBuf) -> i32 {
    msg_take::<4>(msg).map_or(-1, i32::from_le_bytes)
}

pub fn msg_read_float(msg: &mut SizeBuf) -> f32 {
    msg_take::<4>(msg).map_or(-1.0, f32::from_le_bytes)
}

pub fn msg_read_string(msg: &mut SizeBuf) -> String {
    let mut result = String::new();
    let mut l = 0;
    loop {
        let c = msg_read_byte(msg);
        if c == -1 || c == 0 {
            break;
        }
        result.push(c as u8 as char);
        l += 1;
        if l >= 2047 {
            break;
        }
    }
    result
}

pub fn msg_read_coord(msg: &mut SizeBuf) -> f32 {
    msg_read_short(msg) as f32 * (1.0 / 8.0)
}

pub fn msg_read_pos(msg: &mut SizeBuf) -> Vec3 {
    [msg_read_coord(msg), msg_read_coord(msg), msg_read_coord(msg)]
}

pub fn msg_read_angle(msg: &mut SizeBuf) -> f32 {
    msg_read_char(msg) as f32 * (360.0 / 256.0)
}

/// Fail with `ProtocolError::BadRead` if any read overran the message.
pub fn msg_check_read(msg: &SizeBuf) -> Result<(), ProtocolError> {
    if msg.badread {
        Err(ProtocolError::BadRead)
    } else {
        Ok(())
    }
}
