// cmodel.rs — collision hulls, brush models and leaf visibility
//
// A hull is a binary tree of clip nodes over the map planes. Child
// references >= 0 are clip node indices, negative ones are leaf contents.
// Each hull is already expanded by the box size it serves, so every query
// against it is a point or line query.

use crate::common::com_dprintf;
use crate::q_shared::{
    box_on_plane_side, vector_add, vector_lerp, vector_subtract, Plane, Trace, Vec3,
    CONTENTS_CURRENT_DOWN, CONTENTS_EMPTY, CONTENTS_SOLID, MAX_MAP_HULLS,
};

use std::sync::Arc;
use thiserror::Error;

/// Distance a trace impact is backed off from the plane it hit.
/// 1/32 unit is a quarter of the 1/8 network coordinate step, so a
/// position sent over the wire never lands back inside the surface.
pub const DIST_EPSILON: f32 = 0.03125;

/// Deepest clip tree a hull may have. `Hull::validate` enforces it, which
/// bounds the walker's pending-branch stack.
pub const MAX_HULL_DEPTH: usize = 256;

/// Malformed collision data, reported once when a model is validated.
#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("{model}: hull {hull} clip node {node} has bad plane index {plane}")]
    BadPlane { model: String, hull: usize, node: usize, plane: i32 },
    #[error("{model}: hull {hull} clip node {node} has bad child {child}")]
    BadChild { model: String, hull: usize, node: usize, child: i32 },
    #[error("{model}: hull {hull} is deeper than {}", MAX_HULL_DEPTH)]
    TooDeep { model: String, hull: usize },
    #[error("{model}: node {node} references bad {what} {index}")]
    BadNode { model: String, node: usize, what: &'static str, index: i32 },
    #[error("{model}: hull {hull} clip node {node} is reachable twice")]
    Cycle { model: String, hull: usize, node: usize },
    #[error("{0}: has no hulls")]
    NoHulls(String),
    #[error("{model}: missing clip hull {hull}")]
    MissingHull { model: String, hull: usize },
    #[error("{model}: submodel {sub} hull {hull} head node {node} out of range")]
    BadHeadNode { model: String, sub: usize, hull: usize, node: i32 },
}

// ============================================================
// Hull data
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClipNode {
    pub planenum: i32,
    pub children: [i16; 2], // negative numbers are contents
}

/// A collision hull. Clip nodes and planes are shared between the hulls
/// of a model and its submodels.
#[derive(Debug, Clone)]
pub struct Hull {
    pub clipnodes: Arc<[ClipNode]>,
    pub planes: Arc<[Plane]>,
    pub firstclipnode: i32,
    pub lastclipnode: i32,
    pub clip_mins: Vec3,
    pub clip_maxs: Vec3,
}

impl Default for Hull {
    fn default() -> Self {
        Self {
            clipnodes: Arc::from(Vec::new()),
            planes: Arc::from(Vec::new()),
            firstclipnode: 0,
            lastclipnode: -1,
            clip_mins: [0.0; 3],
            clip_maxs: [0.0; 3],
        }
    }
}

/// Borrowed view of a hull; the walker only ever needs this.
#[derive(Debug, Clone, Copy)]
pub struct HullRef<'a> {
    pub clipnodes: &'a [ClipNode],
    pub planes: &'a [Plane],
    pub firstclipnode: i32,
    pub clip_mins: Vec3,
    pub clip_maxs: Vec3,
}

impl Hull {
    pub fn as_ref(&self) -> HullRef<'_> {
        HullRef {
            clipnodes: &self.clipnodes,
            planes: &self.planes,
            firstclipnode: self.firstclipnode,
            clip_mins: self.clip_mins,
            clip_maxs: self.clip_maxs,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lastclipnode < self.firstclipnode
    }

    /// Check every reachable clip node and the tree depth.
    pub fn validate(&self, model: &str, hull: usize) -> Result<(), ModelError> {
        if self.is_empty() {
            return Ok(());
        }
        let mut pending: Vec<(i32, usize)> = vec![(self.firstclipnode, 1)];
        let mut visited = vec![false; self.clipnodes.len()];
        while let Some((num, depth)) = pending.pop() {
            if depth > MAX_HULL_DEPTH {
                return Err(ModelError::TooDeep { model: model.to_string(), hull });
            }
            let node = usize::try_from(num)
                .ok()
                .and_then(|n| self.clipnodes.get(n).map(|c| (n, *c)));
            let Some((n, clip)) = node else {
                return Err(ModelError::BadChild {
                    model: model.to_string(),
                    hull,
                    node: num.max(0) as usize,
                    child: num,
                });
            };
            if visited[n] {
                return Err(ModelError::Cycle { model: model.to_string(), hull, node: n });
            }
            visited[n] = true;
            if clip.planenum < 0 || clip.planenum as usize >= self.planes.len() {
                return Err(ModelError::BadPlane {
                    model: model.to_string(),
                    hull,
                    node: n,
                    plane: clip.planenum,
                });
            }
            for child in clip.children {
                let child = child as i32;
                if child < 0 {
                    if child < CONTENTS_CURRENT_DOWN {
                        return Err(ModelError::BadChild {
                            model: model.to_string(),
                            hull,
                            node: n,
                            child,
                        });
                    }
                } else {
                    pending.push((child, depth + 1));
                }
            }
        }
        Ok(())
    }
}

// ============================================================
// Box hull
//
// Bounding-box entities are clipped against a six-plane hull built on
// the fly from the combined box size.
// ============================================================

#[derive(Debug, Clone, Copy)]
pub struct BoxHull {
    clipnodes: [ClipNode; 6],
    planes: [Plane; 6],
}

impl BoxHull {
    pub fn new(mins: &Vec3, maxs: &Vec3) -> Self {
        let mut clipnodes = [ClipNode::default(); 6];
        let mut planes = [Plane::default(); 6];
        for i in 0..6 {
            let side = i & 1;
            clipnodes[i].planenum = i as i32;
            clipnodes[i].children[side] = CONTENTS_EMPTY as i16;
            clipnodes[i].children[side ^ 1] = if i != 5 {
                (i + 1) as i16
            } else {
                CONTENTS_SOLID as i16
            };
            planes[i].plane_type = (i >> 1) as u8;
            planes[i].normal[i >> 1] = 1.0;
        }
        planes[0].dist = maxs[0];
        planes[1].dist = mins[0];
        planes[2].dist = maxs[1];
        planes[3].dist = mins[1];
        planes[4].dist = maxs[2];
        planes[5].dist = mins[2];
        Self { clipnodes, planes }
    }

    pub fn as_ref(&self) -> HullRef<'_> {
        HullRef {
            clipnodes: &self.clipnodes,
            planes: &self.planes,
            firstclipnode: 0,
            clip_mins: [0.0; 3],
            clip_maxs: [0.0; 3],
        }
    }
}

// ============================================================
// Hull walker
// ============================================================

/// A branch still to be walked. `Visit` descends a subtree with a
/// segment; `Far` resumes a straddled node once its near side has been
/// walked without an impact.
#[derive(Debug, Clone, Copy)]
enum Branch {
    Visit {
        num: i32,
        p1f: f32,
        p2f: f32,
        p1: Vec3,
        p2: Vec3,
    },
    Far {
        plane: Plane,
        child: i32,
        side: usize,
        frac: f32,
        p1f: f32,
        p2f: f32,
        midf: f32,
        p1: Vec3,
        p2: Vec3,
        mid: Vec3,
    },
}

impl HullRef<'_> {
    /// Clip node `num` and its plane, or None when `num` is outside this
    /// hull. An empty hull has no nodes, so every point in it is open.
    #[inline]
    fn node(&self, num: i32) -> Option<(ClipNode, &Plane)> {
        let node = *self.clipnodes.get(usize::try_from(num).ok()?)?;
        let plane = self.planes.get(usize::try_from(node.planenum).ok()?)?;
        Some((node, plane))
    }

    /// Contents of the leaf containing `p`, starting at clip node `num`.
    pub fn point_contents(&self, mut num: i32, p: &Vec3) -> i32 {
        while num >= 0 {
            let Some((node, plane)) = self.node(num) else {
                return CONTENTS_EMPTY;
            };
            num = if plane.distance(p) < 0.0 {
                node.children[1] as i32
            } else {
                node.children[0] as i32
            };
        }
        num
    }

    /// Walk the segment p1..p2 (fractions p1f..p2f of the whole move)
    /// through the tree from node `num`.
    ///
    /// Near subtrees are always finished before the far side of their
    /// node is looked at, and the walk stops at the first solid impact,
    /// so the impact recorded in `trace` is the first one along the
    /// segment. Returns false once an impact has been recorded (or the
    /// segment never left solid), true if the segment is clear.
    pub fn hull_check(
        &self,
        num: i32,
        p1f: f32,
        p2f: f32,
        p1: &Vec3,
        p2: &Vec3,
        trace: &mut Trace,
    ) -> bool {
        // at most one far branch per tree level is pending at a time
        let mut stack: Vec<Branch> = Vec::with_capacity(32);
        stack.push(Branch::Visit { num, p1f, p2f, p1: *p1, p2: *p2 });

        while let Some(branch) = stack.pop() {
            match branch {
                Branch::Visit { mut num, p1f, p2f, p1, p2 } => {
                    // descend while both ends are on the same side
                    let mut straddle = None;
                    while num >= 0 {
                        let Some((node, plane)) = self.node(num) else {
                            num = CONTENTS_EMPTY;
                            break;
                        };
                        let t1 = plane.distance(&p1);
                        let t2 = plane.distance(&p2);
                        if t1 >= 0.0 && t2 >= 0.0 {
                            num = node.children[0] as i32;
                        } else if t1 < 0.0 && t2 < 0.0 {
                            num = node.children[1] as i32;
                        } else {
                            straddle = Some((node, *plane, t1, t2));
                            break;
                        }
                    }

                    let Some((node, plane, t1, t2)) = straddle else {
                        // reached a leaf
                        if num != CONTENTS_SOLID {
                            trace.allsolid = false;
                            if num == CONTENTS_EMPTY {
                                trace.inopen = true;
                            } else {
                                trace.inwater = true;
                            }
                        } else {
                            trace.startsolid = true;
                        }
                        continue;
                    };

                    // put the crosspoint DIST_EPSILON units on the near side
                    let frac = if t1 < 0.0 {
                        (t1 + DIST_EPSILON) / (t1 - t2)
                    } else {
                        (t1 - DIST_EPSILON) / (t1 - t2)
                    }
                    .clamp(0.0, 1.0);

                    let midf = p1f + (p2f - p1f) * frac;
                    let mid = vector_lerp(&p1, frac, &p2);
                    let side = (t1 < 0.0) as usize;

                    let far = Branch::Far {
                        plane,
                        child: node.children[side ^ 1] as i32,
                        side,
                        frac,
                        p1f,
                        p2f,
                        midf,
                        p1,
                        p2,
                        mid,
                    };
                    let near = Branch::Visit {
                        num: node.children[side] as i32,
                        p1f,
                        p2f: midf,
                        p1,
                        p2: mid,
                    };
                    if stack.len() > MAX_HULL_DEPTH {
                        log::error!("hull_check: clip tree deeper than {}", MAX_HULL_DEPTH);
                        return false;
                    }
                    stack.push(far);
                    stack.push(near);
                }

                Branch::Far { plane, child, side, mut frac, p1f, p2f, mut midf, p1, p2, mut mid } => {
                    if self.point_contents(child, &mid) != CONTENTS_SOLID {
                        // go past the node
                        stack.push(Branch::Visit { num: child, p1f: midf, p2f, p1: mid, p2 });
                        continue;
                    }

                    if trace.allsolid {
                        return false; // never got out of the solid area
                    }

                    // the other side of the node is solid, this is the impact point
                    trace.plane = if side == 0 {
                        plane
                    } else {
                        Plane {
                            normal: [-plane.normal[0], -plane.normal[1], -plane.normal[2]],
                            dist: -plane.dist,
                            ..plane
                        }
                    };

                    while self.point_contents(self.firstclipnode, &mid) == CONTENTS_SOLID {
                        // shouldn't really happen, but does occasionally
                        frac -= 0.1;
                        if frac < 0.0 {
                            trace.fraction = midf;
                            trace.endpos = mid;
                            com_dprintf("backup past 0\n");
                            return false;
                        }
                        midf = p1f + (p2f - p1f) * frac;
                        mid = vector_lerp(&p1, frac, &p2);
                    }

                    trace.fraction = midf;
                    trace.endpos = mid;
                    return false;
                }
            }
        }
        true
    }
}

/// Trace a point-sized move through `hull` after shifting it by `offset`
/// (hull space = world space - offset).
pub fn trace_hull(hull: &HullRef, offset: &Vec3, start: &Vec3, end: &Vec3) -> Trace {
    let mut trace = Trace {
        fraction: 1.0,
        allsolid: true,
        endpos: *end,
        ..Trace::default()
    };

    let start_l = vector_subtract(start, offset);
    let end_l = vector_subtract(end, offset);

    hull.hull_check(hull.firstclipnode, 0.0, 1.0, &start_l, &end_l, &mut trace);

    // fix trace up by the offset
    if trace.fraction != 1.0 {
        trace.endpos = vector_add(&trace.endpos, offset);
    }
    trace
}

/// Sweep a box from `start` to `end` against a hull pre-expanded for that
/// box size. The box is reduced to a point by the hull's clip offset.
pub fn trace_box(hull: &HullRef, start: &Vec3, end: &Vec3, mins: &Vec3, _maxs: &Vec3) -> Trace {
    let offset = vector_subtract(&hull.clip_mins, mins);
    trace_hull(hull, &offset, start, end)
}

// ============================================================
// Brush models
// ============================================================

/// Node of the rendering BSP, used only for leaf and PVS queries.
/// Children >= 0 are nodes, negative are leafs (-1 - leafnum).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MNode {
    pub planenum: i32,
    pub children: [i32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MLeaf {
    pub contents: i32,
    /// Offset of the compressed PVS row in the model's vis data, -1 = none.
    pub visofs: i32,
}

impl Default for MLeaf {
    fn default() -> Self {
        Self { contents: CONTENTS_SOLID, visofs: -1 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SubModel {
    pub mins: Vec3,
    pub maxs: Vec3,
    pub origin: Vec3,
    pub headnode: [i32; MAX_MAP_HULLS],
    pub visleafs: i32,
}

/// Everything the core needs from a loaded map model. Read-only once
/// built and shared between every entity that references it.
#[derive(Debug, Clone, Default)]
pub struct BrushModel {
    pub name: String,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub hulls: [Hull; MAX_MAP_HULLS],
    pub planes: Arc<[Plane]>,
    pub nodes: Arc<[MNode]>,
    pub leafs: Arc<[MLeaf]>,
    pub visdata: Arc<[u8]>,
    pub submodels: Vec<SubModel>,
    pub entities: String,
}

/// Standard clip sizes: point, player, large monster.
pub const HULL_SIZES: [(Vec3, Vec3); 3] = [
    ([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]),
    ([-16.0, -16.0, -24.0], [16.0, 16.0, 32.0]),
    ([-32.0, -32.0, -24.0], [32.0, 32.0, 64.0]),
];

impl BrushModel {
    /// Check every hull and the rendering tree. Malformed collision data is
    /// a load-time error; the walker assumes it never happens.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.hulls.iter().all(Hull::is_empty) {
            return Err(ModelError::NoHulls(self.name.clone()));
        }
        // every standard box size must have a hull to clip against
        for i in 0..HULL_SIZES.len() {
            if self.hulls[i].is_empty() {
                return Err(ModelError::MissingHull { model: self.name.clone(), hull: i });
            }
        }
        for (i, hull) in self.hulls.iter().enumerate() {
            hull.validate(&self.name, i)?;
        }
        for (n, sub) in self.submodels.iter().enumerate().skip(1) {
            for i in 0..HULL_SIZES.len() {
                let head = sub.headnode[i];
                if head < 0 || head as usize >= self.hulls[i].clipnodes.len() {
                    return Err(ModelError::BadHeadNode {
                        model: self.name.clone(),
                        sub: n,
                        hull: i,
                        node: head,
                    });
                }
                let hull = Hull { firstclipnode: head, ..self.hulls[i].clone() };
                hull.validate(&self.name, i)?;
            }
        }
        for (n, node) in self.nodes.iter().enumerate() {
            if node.planenum < 0 || node.planenum as usize >= self.planes.len() {
                return Err(ModelError::BadNode {
                    model: self.name.clone(),
                    node: n,
                    what: "plane",
                    index: node.planenum,
                });
            }
            for child in node.children {
                let bad = if child >= 0 {
                    child as usize >= self.nodes.len()
                } else {
                    (-1 - child) as usize >= self.leafs.len()
                };
                if bad {
                    return Err(ModelError::BadNode {
                        model: self.name.clone(),
                        node: n,
                        what: "child",
                        index: child,
                    });
                }
            }
        }
        Ok(())
    }

    /// Pick the hull for a box of the given size.
    pub fn hull_for_size(&self, size: &Vec3) -> &Hull {
        if size[0] < 3.0 {
            &self.hulls[0]
        } else if size[0] <= 32.0 {
            &self.hulls[1]
        } else {
            &self.hulls[2]
        }
    }

    /// Number of leafs that take part in visibility (leaf 0 never does).
    pub fn num_visleafs(&self) -> usize {
        self.leafs.len().saturating_sub(1)
    }

    /// Leaf index containing `p`.
    pub fn point_in_leaf(&self, p: &Vec3) -> usize {
        if self.nodes.is_empty() {
            return if self.leafs.len() > 1 { 1 } else { 0 };
        }
        let mut num = 0i32;
        while num >= 0 {
            let node = &self.nodes[num as usize];
            let d = self.planes[node.planenum as usize].distance(p);
            num = if d >= 0.0 { node.children[0] } else { node.children[1] };
        }
        (-1 - num) as usize
    }

    /// Decompressed PVS row for a leaf. Bit `i` is visleaf `i + 1`.
    pub fn leaf_pvs(&self, leaf: usize) -> Vec<u8> {
        let row = (self.num_visleafs() + 7) >> 3;
        let visofs = self.leafs.get(leaf).map_or(-1, |l| l.visofs);
        if leaf == 0 || visofs < 0 || self.visdata.is_empty() {
            return vec![0xff; row];
        }
        decompress_vis(&self.visdata[visofs as usize..], row)
    }

    /// Union of the PVS of every leaf within 8 units of `org`.
    pub fn fat_pvs(&self, org: &Vec3) -> Vec<u8> {
        let row = (self.num_visleafs() + 7) >> 3;
        let mut fat = vec![0u8; row];
        if self.nodes.is_empty() {
            let pvs = self.leaf_pvs(self.point_in_leaf(org));
            fat.copy_from_slice(&pvs);
            return fat;
        }

        let mut pending = vec![0i32];
        while let Some(mut num) = pending.pop() {
            loop {
                if num < 0 {
                    let leaf = (-1 - num) as usize;
                    if self.leafs[leaf].contents != CONTENTS_SOLID {
                        let pvs = self.leaf_pvs(leaf);
                        for (f, p) in fat.iter_mut().zip(pvs.iter()) {
                            *f |= *p;
                        }
                    }
                    break;
                }
                let node = &self.nodes[num as usize];
                let d = self.planes[node.planenum as usize].distance(org);
                if d > 8.0 {
                    num = node.children[0];
                } else if d < -8.0 {
                    num = node.children[1];
                } else {
                    // go down both
                    pending.push(node.children[0]);
                    num = node.children[1];
                }
            }
        }
        fat
    }

    /// Non-solid leafs touched by a box, at most `max` of them, as visleaf
    /// numbers (leaf index - 1).
    pub fn box_leafs(&self, mins: &Vec3, maxs: &Vec3, max: usize) -> Vec<i16> {
        let mut out = Vec::new();
        if self.nodes.is_empty() {
            if self.leafs.len() > 1 {
                out.push(0);
            }
            return out;
        }
        let mut pending = vec![0i32];
        while let Some(num) = pending.pop() {
            if num < 0 {
                let leaf = (-1 - num) as usize;
                if self.leafs[leaf].contents == CONTENTS_SOLID {
                    continue;
                }
                if out.len() == max {
                    break;
                }
                out.push((leaf - 1) as i16);
                continue;
            }
            let node = &self.nodes[num as usize];
            let plane = &self.planes[node.planenum as usize];
            let sides = box_on_plane_side(mins, maxs, plane);
            // push back side first so the front side is visited first
            if sides & 2 != 0 {
                pending.push(node.children[1]);
            }
            if sides & 1 != 0 {
                pending.push(node.children[0]);
            }
        }
        out
    }

    /// Build a closed rectangular room: empty inside `mins..maxs`, solid
    /// outside, with the three standard hulls and a two-leaf render tree.
    pub fn room(name: &str, mins: &Vec3, maxs: &Vec3) -> Self {
        let mut planes = Vec::new();
        let mut hull_nodes: Vec<Vec<ClipNode>> = Vec::new();

        for (clip_mins, clip_maxs) in HULL_SIZES.iter() {
            let lo = vector_subtract(mins, clip_mins);
            let hi = vector_subtract(maxs, clip_maxs);
            let mut nodes = Vec::new();
            for axis in 0..3 {
                for (sign, dist) in [(1.0f32, lo[axis]), (-1.0, -hi[axis])] {
                    let mut normal = [0.0; 3];
                    normal[axis] = sign;
                    let planenum = planes.len() as i32;
                    planes.push(Plane::new(normal, dist));
                    let idx = nodes.len() as i16;
                    nodes.push(ClipNode {
                        planenum,
                        children: [idx + 1, CONTENTS_SOLID as i16],
                    });
                }
            }
            if let Some(last) = nodes.last_mut() {
                last.children[0] = CONTENTS_EMPTY as i16;
            }
            hull_nodes.push(nodes);
        }

        let planes: Arc<[Plane]> = Arc::from(planes);

        // render tree mirrors the point hull: leaf 0 solid, leaf 1 the room
        let nodes: Vec<MNode> = hull_nodes[0]
            .iter()
            .map(|c| MNode {
                planenum: c.planenum,
                children: [
                    if c.children[0] >= 0 { c.children[0] as i32 } else { -2 },
                    -1,
                ],
            })
            .collect();
        let leafs = vec![
            MLeaf { contents: CONTENTS_SOLID, visofs: -1 },
            MLeaf { contents: CONTENTS_EMPTY, visofs: -1 },
        ];

        let mut hulls: [Hull; MAX_MAP_HULLS] = Default::default();
        for (i, clipnodes) in hull_nodes.into_iter().enumerate() {
            // each hull gets its own node array so firstclipnode is 0
            let last = clipnodes.len() as i32 - 1;
            hulls[i] = Hull {
                clipnodes: Arc::from(clipnodes),
                planes: planes.clone(),
                firstclipnode: 0,
                lastclipnode: last,
                clip_mins: HULL_SIZES[i].0,
                clip_maxs: HULL_SIZES[i].1,
            };
        }

        Self {
            name: name.to_string(),
            mins: *mins,
            maxs: *maxs,
            hulls,
            planes,
            nodes: Arc::from(nodes),
            leafs: Arc::from(leafs),
            visdata: Arc::from(Vec::new()),
            submodels: vec![SubModel {
                mins: *mins,
                maxs: *maxs,
                origin: [0.0; 3],
                headnode: [0; MAX_MAP_HULLS],
                visleafs: 1,
            }],
            entities: String::new(),
        }
    }

    /// Derive hull 0 from the rendering tree: every node becomes a clip
    /// node and leaf children become their contents.
    pub fn make_hull0(&mut self) {
        let clipnodes: Vec<ClipNode> = self
            .nodes
            .iter()
            .map(|n| {
                let mut c = ClipNode { planenum: n.planenum, children: [0; 2] };
                for j in 0..2 {
                    let child = n.children[j];
                    c.children[j] = if child < 0 {
                        self.leafs[(-1 - child) as usize].contents as i16
                    } else {
                        child as i16
                    };
                }
                c
            })
            .collect();
        let last = clipnodes.len() as i32 - 1;
        self.hulls[0] = Hull {
            clipnodes: Arc::from(clipnodes),
            planes: self.planes.clone(),
            firstclipnode: 0,
            lastclipnode: last,
            clip_mins: [0.0; 3],
            clip_maxs: [0.0; 3],
        };
    }

    /// Collision model for inline submodel `index` (`*index`), sharing this
    /// model's trees with the submodel's head nodes.
    pub fn submodel(&self, index: usize) -> Option<BrushModel> {
        let sub = self.submodels.get(index)?;
        let mut model = self.clone();
        model.name = format!("*{}", index);
        model.mins = sub.mins;
        model.maxs = sub.maxs;
        for (hull, head) in model.hulls.iter_mut().zip(sub.headnode.iter()) {
            hull.firstclipnode = *head;
        }
        model.submodels.clear();
        Some(model)
    }
}

/// Run-length decode one PVS row: a zero byte is followed by a count of
/// zero bytes.
pub fn decompress_vis(input: &[u8], row: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(row);
    let mut i = 0;
    while out.len() < row {
        let Some(&b) = input.get(i) else { break };
        if b != 0 {
            out.push(b);
            i += 1;
            continue;
        }
        let mut c = input.get(i + 1).copied().unwrap_or(0) as usize;
        i += 2;
        if out.len() + c > row {
            c = row - out.len();
            com_dprintf("warning: Vis decompression overrun\n");
        }
        out.extend(std::iter::repeat(0).take(c));
        if c == 0 {
            break;
        }
    }
    out.resize(row, 0);
    out
}
