// q_shared.rs — types and math shared by the server and the client

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

// angle indexes
pub const PITCH: usize = 0; // up / down
pub const YAW: usize = 1; // left / right
pub const ROLL: usize = 2; // fall over

pub const MAX_QPATH: usize = 64;
pub const MAX_TOKEN_CHARS: usize = 1024;

// ============================================================
// Capacity limits
// ============================================================

pub const MAX_EDICTS: usize = 600;
pub const MAX_MODELS: usize = 256;
pub const MAX_SOUNDS: usize = 256;
pub const MAX_LIGHTSTYLES: usize = 64;
pub const MAX_SCOREBOARD: usize = 16;
pub const MAX_CL_STATS: usize = 32;
pub const MAX_MAP_HULLS: usize = 4;
pub const MAX_ENT_LEAFS: usize = 16;
pub const NUM_SPAWN_PARMS: usize = 16;

// ============================================================
// Leaf contents
//
// Stored as negative child references in clip nodes.
// ============================================================

pub const CONTENTS_EMPTY: i32 = -1;
pub const CONTENTS_SOLID: i32 = -2;
pub const CONTENTS_WATER: i32 = -3;
pub const CONTENTS_SLIME: i32 = -4;
pub const CONTENTS_LAVA: i32 = -5;
pub const CONTENTS_SKY: i32 = -6;
pub const CONTENTS_ORIGIN: i32 = -7; // removed at csg time
pub const CONTENTS_CLIP: i32 = -8; // changed to contents_solid
pub const CONTENTS_CURRENT_0: i32 = -9;
pub const CONTENTS_CURRENT_90: i32 = -10;
pub const CONTENTS_CURRENT_180: i32 = -11;
pub const CONTENTS_CURRENT_270: i32 = -12;
pub const CONTENTS_CURRENT_UP: i32 = -13;
pub const CONTENTS_CURRENT_DOWN: i32 = -14;

// ============================================================
// Stats sent to the client in svc_updatestat
// ============================================================

pub const STAT_HEALTH: usize = 0;
pub const STAT_FRAGS: usize = 1;
pub const STAT_WEAPON: usize = 2;
pub const STAT_AMMO: usize = 3;
pub const STAT_ARMOR: usize = 4;
pub const STAT_WEAPONFRAME: usize = 5;
pub const STAT_SHELLS: usize = 6;
pub const STAT_NAILS: usize = 7;
pub const STAT_ROCKETS: usize = 8;
pub const STAT_CELLS: usize = 9;
pub const STAT_ACTIVEWEAPON: usize = 10;
pub const STAT_TOTALSECRETS: usize = 11;
pub const STAT_TOTALMONSTERS: usize = 12;
pub const STAT_SECRETS: usize = 13; // bumped on client side by svc_foundsecret
pub const STAT_MONSTERS: usize = 14; // bumped by svc_killedmonster

// ============================================================
// Plane
// ============================================================

/// A map plane. `plane_type` 0-2 is axial (normal along x/y/z),
/// 3-5 is "mostly" that axis and must use the full dot product.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub dist: f32,
    pub plane_type: u8,
    pub signbits: u8,
}

pub const PLANE_X: u8 = 0;
pub const PLANE_Y: u8 = 1;
pub const PLANE_Z: u8 = 2;
pub const PLANE_ANYX: u8 = 3;
pub const PLANE_ANYY: u8 = 4;
pub const PLANE_ANYZ: u8 = 5;

impl Plane {
    /// Build a plane and classify it for the axial fast path.
    pub fn new(normal: Vec3, dist: f32) -> Self {
        let mut signbits = 0u8;
        for (j, n) in normal.iter().enumerate() {
            if *n < 0.0 {
                signbits |= 1 << j;
            }
        }
        Self {
            normal,
            dist,
            plane_type: plane_type_for_normal(&normal),
            signbits,
        }
    }

    /// Signed distance from the plane, using the axial shortcut when possible.
    #[inline]
    pub fn distance(&self, p: &Vec3) -> f32 {
        if self.plane_type < 3 {
            p[self.plane_type as usize] - self.dist
        } else {
            dot_product(&self.normal, p) - self.dist
        }
    }
}

pub fn plane_type_for_normal(normal: &Vec3) -> u8 {
    if normal[0] == 1.0 {
        return PLANE_X;
    }
    if normal[1] == 1.0 {
        return PLANE_Y;
    }
    if normal[2] == 1.0 {
        return PLANE_Z;
    }
    let ax = normal[0].abs();
    let ay = normal[1].abs();
    let az = normal[2].abs();
    if ax >= ay && ax >= az {
        PLANE_ANYX
    } else if ay >= ax && ay >= az {
        PLANE_ANYY
    } else {
        PLANE_ANYZ
    }
}

// ============================================================
// Trace
// ============================================================

/// Result of a single collision query. `ent` is the edict number that
/// blocked the move, `None` if nothing did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trace {
    pub allsolid: bool,   // if true, plane is not valid
    pub startsolid: bool, // if true, the initial point was in a solid area
    pub inopen: bool,
    pub inwater: bool,
    pub fraction: f32, // time completed, 1.0 = didn't hit anything
    pub endpos: Vec3,  // final position
    pub plane: Plane,  // surface normal at impact
    pub ent: Option<usize>,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            inopen: false,
            inwater: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: Plane::default(),
            ent: None,
        }
    }
}

// ============================================================
// MATHLIB — Vector operations
// ============================================================

#[inline]
pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
pub fn vector_add(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

/// veca + scale * vecb
#[inline]
pub fn vector_ma(veca: &Vec3, scale: f32, vecb: &Vec3) -> Vec3 {
    [
        veca[0] + scale * vecb[0],
        veca[1] + scale * vecb[1],
        veca[2] + scale * vecb[2],
    ]
}

#[inline]
pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

#[inline]
pub fn vector_length(v: &Vec3) -> f32 {
    dot_product(v, v).sqrt()
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

/// Linear interpolation between two points.
#[inline]
pub fn vector_lerp(a: &Vec3, frac: f32, b: &Vec3) -> Vec3 {
    [
        a[0] + frac * (b[0] - a[0]),
        a[1] + frac * (b[1] - a[1]),
        a[2] + frac * (b[2] - a[2]),
    ]
}

// ============================================================
// Angle functions
// ============================================================

pub fn angle_vectors(angles: &Vec3) -> (Vec3, Vec3, Vec3) {
    let (sy, cy) = angles[YAW].to_radians().sin_cos();
    let (sp, cp) = angles[PITCH].to_radians().sin_cos();
    let (sr, cr) = angles[ROLL].to_radians().sin_cos();

    let forward = [cp * cy, cp * sy, -sp];
    let right = [
        -sr * sp * cy + -cr * -sy,
        -sr * sp * sy + -cr * cy,
        -sr * cp,
    ];
    let up = [
        cr * sp * cy + -sr * -sy,
        cr * sp * sy + -sr * cy,
        cr * cp,
    ];
    (forward, right, up)
}

/// Wrap an angle into [0, 360) at 16-bit precision.
pub fn anglemod(a: f32) -> f32 {
    (360.0 / 65536.0) * (((a * (65536.0 / 360.0)) as i32) & 65535) as f32
}

/// Yaw of a direction vector, truncated to whole degrees.
pub fn vectoyaw(vec: &Vec3) -> f32 {
    if vec[1] == 0.0 && vec[0] == 0.0 {
        return 0.0;
    }
    let mut yaw = (vec[1].atan2(vec[0]).to_degrees()) as i32 as f32;
    if yaw < 0.0 {
        yaw += 360.0;
    }
    yaw
}

/// Pitch/yaw angles of a direction vector, truncated to whole degrees.
pub fn vectoangles(vec: &Vec3) -> Vec3 {
    let (pitch, yaw);
    if vec[1] == 0.0 && vec[0] == 0.0 {
        yaw = 0.0;
        pitch = if vec[2] > 0.0 { 90.0 } else { 270.0 };
    } else {
        let mut y = (vec[1].atan2(vec[0]).to_degrees()) as i32 as f32;
        if y < 0.0 {
            y += 360.0;
        }
        yaw = y;
        let forward = (vec[0] * vec[0] + vec[1] * vec[1]).sqrt();
        let mut p = (vec[2].atan2(forward).to_degrees()) as i32 as f32;
        if p < 0.0 {
            p += 360.0;
        }
        pitch = p;
    }
    [pitch, yaw, 0.0]
}

/// Box-on-plane-side test. Returns 1 (front), 2 (back) or 3 (both).
pub fn box_on_plane_side(emins: &Vec3, emaxs: &Vec3, p: &Plane) -> i32 {
    // fast axial cases
    if p.plane_type < 3 {
        let t = p.plane_type as usize;
        if p.dist <= emins[t] {
            return 1;
        }
        if p.dist >= emaxs[t] {
            return 2;
        }
        return 3;
    }

    let mut corners = [[0.0f32; 3]; 2];
    for i in 0..3 {
        if p.normal[i] < 0.0 {
            corners[0][i] = emins[i];
            corners[1][i] = emaxs[i];
        } else {
            corners[1][i] = emins[i];
            corners[0][i] = emaxs[i];
        }
    }
    let dist1 = dot_product(&p.normal, &corners[0]) - p.dist;
    let dist2 = dot_product(&p.normal, &corners[1]) - p.dist;
    let mut sides = 0;
    if dist1 >= 0.0 {
        sides = 1;
    }
    if dist2 < 0.0 {
        sides |= 2;
    }
    sides
}

// ============================================================
// Text parsing
// ============================================================

/// Parse one token from `data`, handling // comments, "quoted strings"
/// and the single-character tokens `{ } ( ) ' :`.
/// Returns `(token, remaining)`; `remaining` is `None` at end of data.
pub fn com_parse(data: &str) -> (String, Option<&str>) {
    let bytes = data.as_bytes();
    let mut i = 0;
    let mut token = String::new();

    // skip whitespace and comments
    loop {
        while i < bytes.len() && bytes[i] <= b' ' {
            i += 1;
        }
        if i >= bytes.len() {
            return (token, None);
        }
        if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        break;
    }

    // quoted string
    if bytes[i] == b'"' {
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i] != b'"' {
            i += 1;
        }
        token.extend(data[start..i].chars().take(MAX_TOKEN_CHARS));
        if i < bytes.len() {
            i += 1;
        }
        return (token, Some(&data[i..]));
    }

    // single character tokens
    if matches!(bytes[i], b'{' | b'}' | b')' | b'(' | b'\'' | b':') {
        token.push(bytes[i] as char);
        return (token, Some(&data[i + 1..]));
    }

    // regular word; delimiters are ASCII so `start..i` stays on char boundaries
    let start = i;
    while i < bytes.len() && bytes[i] > b' ' {
        if matches!(bytes[i], b'{' | b'}' | b')' | b'(' | b'\'' | b':') {
            break;
        }
        i += 1;
    }
    token.extend(data[start..i].chars().take(MAX_TOKEN_CHARS));
    (token, Some(&data[i..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_plane_classification() {
        assert_eq!(Plane::new([0.0, 0.0, 1.0], 0.0).plane_type, PLANE_Z);
        let neg = Plane::new([-1.0, 0.0, 0.0], 16.0);
        assert_eq!(neg.plane_type, PLANE_ANYX);
        assert_approx_eq!(neg.distance(&[-20.0, 0.0, 0.0]), 4.0);
        let p = Plane::new([0.8, 0.6, 0.0], 4.0);
        assert_eq!(p.plane_type, PLANE_ANYX);
        assert_approx_eq!(p.distance(&[5.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_anglemod_wraps() {
        assert_approx_eq!(anglemod(370.0), 10.0, 0.01);
        assert_approx_eq!(anglemod(-90.0), 270.0, 0.01);
    }

    #[test]
    fn test_vectoyaw_and_angles() {
        assert_eq!(vectoyaw(&[0.0, 1.0, 0.0]), 90.0);
        assert_eq!(vectoyaw(&[0.0, -1.0, 0.0]), 270.0);
        assert_eq!(vectoyaw(&[0.0, 0.0, 5.0]), 0.0);
        assert_eq!(vectoangles(&[0.0, 0.0, 1.0]), [90.0, 0.0, 0.0]);
        assert_eq!(vectoangles(&[1.0, 0.0, -1.0])[0], 315.0);
    }

    #[test]
    fn test_angle_vectors_yaw() {
        let (f, r, u) = angle_vectors(&[0.0, 90.0, 0.0]);
        assert_approx_eq!(f[1], 1.0, 1e-5);
        assert_approx_eq!(r[0], 1.0, 1e-5);
        assert_approx_eq!(u[2], 1.0, 1e-5);
    }

    #[test]
    fn test_box_on_plane_side() {
        let p = Plane::new([0.0, 0.0, 1.0], 0.0);
        assert_eq!(box_on_plane_side(&[-1.0; 3], &[1.0; 3], &p), 3);
        assert_eq!(box_on_plane_side(&[0.0, 0.0, 1.0], &[1.0; 3], &p), 1);
        assert_eq!(box_on_plane_side(&[-2.0; 3], &[-1.0; 3], &p), 2);
    }

    #[test]
    fn test_com_parse_entity_text() {
        let text = "{\n\"classname\" \"worldspawn\" // comment\n}";
        let (t, rest) = com_parse(text);
        assert_eq!(t, "{");
        let (t, rest) = com_parse(rest.unwrap());
        assert_eq!(t, "classname");
        let (t, rest) = com_parse(rest.unwrap());
        assert_eq!(t, "worldspawn");
        let (t, rest) = com_parse(rest.unwrap());
        assert_eq!(t, "}");
        let (t, rest) = com_parse(rest.unwrap());
        assert!(t.is_empty());
        assert!(rest.is_none());
    }

    #[test]
    fn test_com_parse_keeps_high_chars() {
        let (t, rest) = com_parse("\"caf\u{e9} \u{ff}\" na\u{ef}ve");
        assert_eq!(t, "caf\u{e9} \u{ff}");
        let (t, _) = com_parse(rest.unwrap());
        assert_eq!(t, "na\u{ef}ve");
    }
}
